// SPDX-License-Identifier: Apache-2.0

//! The data-ownership registry.
//!
//! Maps (buffer index, attribute key) to the model and data-parallel rank
//! that produced the attribute. Written by request coroutines just before an
//! RPC posts (and by the data loader for dataset keys); read to assemble the
//! producer mappings of a cross-topology transfer. At most one producer may
//! ever claim a pair; a conflicting claim is a fatal scheduler error.

use crate::error::Error;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use trainflow_config::{DataKey, ModelName};

/// The registry. Cheap to clone; all clones share one map.
#[derive(Clone, Default)]
pub struct DataOwner {
    map: Rc<RefCell<HashMap<(u64, DataKey), (ModelName, usize)>>>,
}

impl DataOwner {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `(index, key)` is held by `owner` at dp rank `dp`.
    ///
    /// Re-recording the identical owner is a no-op; a different owner is a
    /// fatal invariant violation.
    pub fn set(
        &self,
        index: u64,
        key: &DataKey,
        owner: &ModelName,
        dp: usize,
    ) -> Result<(), Error> {
        let mut map = self.map.borrow_mut();
        if let Some((first, first_dp)) = map.get(&(index, key.clone())) {
            if first == owner && *first_dp == dp {
                return Ok(());
            }
            return Err(Error::DuplicateOwner {
                index,
                key: key.clone(),
                first: first.clone(),
                first_dp: *first_dp,
                second: owner.clone(),
                second_dp: dp,
            });
        }
        let _ = map.insert((index, key.clone()), (owner.clone(), dp));
        Ok(())
    }

    /// Looks up the owner of `(index, key)`.
    pub fn get(&self, index: u64, key: &DataKey) -> Result<(ModelName, usize), Error> {
        self.map
            .borrow()
            .get(&(index, key.clone()))
            .cloned()
            .ok_or_else(|| Error::UnknownOwner {
                index,
                key: key.clone(),
            })
    }

    /// Number of recorded pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_producer_enforced() {
        let owners = DataOwner::new();
        let key = DataKey::from("seq");
        let actor = ModelName::new("actor", 0);
        let reward = ModelName::new("reward", 0);

        owners.set(3, &key, &actor, 1).expect("first claim");
        owners.set(3, &key, &actor, 1).expect("identical re-claim");
        let err = owners
            .set(3, &key, &reward, 0)
            .expect_err("conflicting claim");
        assert!(matches!(err, Error::DuplicateOwner { index: 3, .. }));

        assert_eq!(owners.get(3, &key).expect("recorded"), (actor, 1));
        assert!(matches!(
            owners.get(4, &key),
            Err(Error::UnknownOwner { index: 4, .. })
        ));
    }
}
