// SPDX-License-Identifier: Apache-2.0

//! The asynchronous sequence buffer.
//!
//! Records enter when the data loader fetches an epoch, accumulate
//! attributes as RPCs complete, and retire once every RPC has consumed them.
//! `get_batch_for_rpc` is the rendezvous: it parks its caller until enough
//! records are ready, where ready means every input key of the RPC is
//! present and the RPC has not consumed the record yet.
//!
//! Selection is FIFO by buffer index. Starvation is impossible: a record's
//! pending set only shrinks, and indices are never reused within a run.

use crate::error::Error;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tokio::sync::mpsc;
use trainflow_config::{DataKey, RpcName};

/// What one RPC demands from the buffer, fixed at spawn time.
#[derive(Debug, Clone)]
pub struct RpcDemand {
    /// The demanding RPC.
    pub name: RpcName,
    /// Keys a record must carry to be ready for this RPC.
    pub input_keys: Vec<DataKey>,
    /// Minimum batch size.
    pub min_n_seqs: usize,
    /// Maximum batch size.
    pub max_n_seqs: usize,
    /// Minimum sequences per data-parallel slice.
    pub min_n_seqs_per_dp: usize,
    /// Round batches down to a multiple of `dp_size`.
    pub balanced_dp: bool,
    /// Data-parallel size of the RPC's model.
    pub dp_size: usize,
    /// Whether the RPC is a DFG source; only sources trigger dataset fetches
    /// when the buffer runs dry.
    pub is_src: bool,
}

/// A batch handed to one RPC invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Buffer indices, ascending.
    pub indices: Vec<u64>,
    /// Per-sequence lengths, aligned with `indices`.
    pub seqlens: Vec<u32>,
}

impl Batch {
    /// Number of sequences in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

struct Record {
    seqlen: u32,
    keys: HashSet<DataKey>,
    pending: HashSet<RpcName>,
}

struct Inner {
    capacity: usize,
    next_index: u64,
    records: BTreeMap<u64, Record>,
    rpc_names: Vec<RpcName>,
    waiters: VecDeque<Waker>,
}

impl Inner {
    fn wake(&mut self, n: usize) {
        for _ in 0..n {
            match self.waiters.pop_front() {
                Some(waker) => waker.wake(),
                None => break,
            }
        }
    }

    fn wake_all(&mut self) {
        let n = self.waiters.len();
        self.wake(n);
    }
}

/// The shared sequence buffer. Cheap to clone; all clones see one store.
#[derive(Clone)]
pub struct SequenceBuffer {
    inner: Rc<RefCell<Inner>>,
    fetch_ctl: mpsc::Sender<()>,
    fetch_master_ctl: mpsc::Sender<()>,
}

impl SequenceBuffer {
    /// Creates a buffer for the given RPC names with an advisory `capacity`.
    ///
    /// `fetch_ctl` and `fetch_master_ctl` are signalled (best effort, size-1
    /// queues) whenever a source RPC cannot be satisfied, asking the data
    /// loader for a new epoch and telling the driver an epoch boundary
    /// passed.
    #[must_use]
    pub fn new(
        rpc_names: Vec<RpcName>,
        capacity: usize,
        fetch_ctl: mpsc::Sender<()>,
        fetch_master_ctl: mpsc::Sender<()>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                capacity,
                next_index: 0,
                records: BTreeMap::new(),
                rpc_names,
                waiters: VecDeque::new(),
            })),
            fetch_ctl,
            fetch_master_ctl,
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().records.len()
    }

    /// Whether the buffer holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically inserts records as `(keys, seqlen)` pairs and returns their
    /// fresh buffer indices. Each record starts pending for every RPC.
    ///
    /// Does not wake waiters; the loader calls [`Self::notify`] once a bulk
    /// load is complete.
    pub fn put_batch(&self, records: Vec<(Vec<DataKey>, u32)>) -> Result<Vec<u64>, Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.records.len() + records.len() > inner.capacity {
            return Err(Error::BufferFull {
                capacity: inner.capacity,
            });
        }
        let pending: HashSet<RpcName> = inner.rpc_names.iter().cloned().collect();
        let mut indices = Vec::with_capacity(records.len());
        for (keys, seqlen) in records {
            let index = inner.next_index;
            inner.next_index += 1;
            let _ = inner.records.insert(
                index,
                Record {
                    seqlen,
                    keys: keys.into_iter().collect(),
                    pending: pending.clone(),
                },
            );
            indices.push(index);
        }
        Ok(indices)
    }

    /// Adds keys to records and updates their lengths (generation lengthens
    /// sequences). Wakes every waiter.
    pub fn amend_batch(
        &self,
        indices: &[u64],
        amendments: Vec<(Vec<DataKey>, u32)>,
    ) -> Result<(), Error> {
        if indices.len() != amendments.len() {
            return Err(Error::AmendMismatch {
                indices: indices.len(),
                amendments: amendments.len(),
            });
        }
        let mut inner = self.inner.borrow_mut();
        for (&index, (keys, seqlen)) in indices.iter().zip(amendments) {
            let record = inner
                .records
                .get_mut(&index)
                .ok_or(Error::UnknownBufferIndex { index })?;
            record.keys.extend(keys);
            record.seqlen = seqlen;
        }
        inner.wake_all();
        Ok(())
    }

    /// Wakes up to `n` parked `get_batch_for_rpc` calls, used after a bulk
    /// data load.
    pub fn notify(&self, n: usize) {
        self.inner.borrow_mut().wake(n);
    }

    /// Parks until at least `min_n_seqs` records are ready for the RPC, then
    /// returns at most `max_n_seqs` of them, FIFO by index. Chosen records
    /// stop being pending for this RPC; fully consumed records retire.
    pub async fn get_batch_for_rpc(&self, demand: &RpcDemand) -> Result<Batch, Error> {
        loop {
            if let Some(batch) = self.try_take(demand) {
                return Ok(batch);
            }
            if demand.is_src {
                // Ask for more data; a full queue means a fetch is already
                // under way.
                let _ = self.fetch_ctl.try_send(());
                let _ = self.fetch_master_ctl.try_send(());
            }
            WaitTurn {
                inner: &self.inner,
                registered: false,
            }
            .await;
        }
    }

    fn try_take(&self, demand: &RpcDemand) -> Option<Batch> {
        let mut inner = self.inner.borrow_mut();

        let mut chosen = Vec::new();
        for (&index, record) in &inner.records {
            if chosen.len() == demand.max_n_seqs {
                break;
            }
            if !record.pending.contains(&demand.name) {
                continue;
            }
            if !demand.input_keys.iter().all(|k| record.keys.contains(k)) {
                continue;
            }
            chosen.push(index);
        }

        let required = demand
            .min_n_seqs
            .max(demand.min_n_seqs_per_dp * demand.dp_size)
            .max(1);
        let mut take = chosen.len();
        if demand.balanced_dp {
            take -= take % demand.dp_size;
        }
        if take < required {
            return None;
        }
        chosen.truncate(take);

        let mut seqlens = Vec::with_capacity(take);
        for &index in &chosen {
            let record = inner
                .records
                .get_mut(&index)
                .unwrap_or_else(|| unreachable!("chosen record vanished"));
            let _ = record.pending.remove(&demand.name);
            seqlens.push(record.seqlen);
            if record.pending.is_empty() {
                let _ = inner.records.remove(&index);
            }
        }

        Some(Batch {
            indices: chosen,
            seqlens,
        })
    }
}

/// Completes after the buffer wakes this waiter (or on any later poll; the
/// caller re-checks its condition in a loop).
struct WaitTurn<'a> {
    inner: &'a Rc<RefCell<Inner>>,
    registered: bool,
}

impl Future for WaitTurn<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.registered {
            return Poll::Ready(());
        }
        self.inner
            .borrow_mut()
            .waiters
            .push_back(cx.waker().clone());
        self.registered = true;
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn demand(name: &'static str, inputs: &[&'static str], min: usize, max: usize) -> RpcDemand {
        RpcDemand {
            name: name.into(),
            input_keys: inputs.iter().map(|k| DataKey::from(*k)).collect(),
            min_n_seqs: min,
            max_n_seqs: max,
            min_n_seqs_per_dp: 1,
            balanced_dp: false,
            dp_size: 1,
            is_src: false,
        }
    }

    fn buffer(rpcs: &[&'static str], capacity: usize) -> (SequenceBuffer, mpsc::Receiver<()>) {
        let (fetch_tx, fetch_rx) = mpsc::channel(1);
        let (master_tx, _master_rx) = mpsc::channel(1);
        (
            SequenceBuffer::new(
                rpcs.iter().map(|r| RpcName::from(*r)).collect(),
                capacity,
                fetch_tx,
                master_tx,
            ),
            fetch_rx,
        )
    }

    fn run_local<F: Future>(fut: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        rt.block_on(local.run_until(fut))
    }

    #[test]
    fn fifo_selection_by_index() {
        run_local(async {
            let (buf, _rx) = buffer(&["train"], 64);
            let indices = buf
                .put_batch((0..8).map(|i| (vec![DataKey::from("seq")], 100 + i)).collect())
                .expect("capacity");
            assert_eq!(indices, (0..8).collect::<Vec<u64>>());

            let batch = buf
                .get_batch_for_rpc(&demand("train", &["seq"], 4, 4))
                .await
                .expect("ready records");
            assert_eq!(batch.indices, vec![0, 1, 2, 3]);
            assert_eq!(batch.seqlens, vec![100, 101, 102, 103]);

            // Consumed records are gone for this RPC; the next batch starts
            // where the last one stopped.
            let batch = buf
                .get_batch_for_rpc(&demand("train", &["seq"], 4, 4))
                .await
                .expect("ready records");
            assert_eq!(batch.indices, vec![4, 5, 6, 7]);
            // `train` was the only RPC, so everything retired.
            assert!(buf.is_empty());
        });
    }

    #[test]
    fn waits_until_amended_keys_make_records_ready() {
        run_local(async {
            let (buf, _rx) = buffer(&["ref", "train"], 64);
            let indices = buf
                .put_batch(vec![(vec![DataKey::from("seq")], 10); 4])
                .expect("capacity");

            let waiter = {
                let buf = buf.clone();
                tokio::task::spawn_local(async move {
                    buf.get_batch_for_rpc(&demand("train", &["seq", "ref_logp"], 4, 4))
                        .await
                })
            };
            tokio::task::yield_now().await;

            buf.amend_batch(&indices, vec![(vec![DataKey::from("ref_logp")], 10); 4])
                .expect("known indices");
            let batch = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("woken by amend")
                .expect("task")
                .expect("batch");
            assert_eq!(batch.indices, indices);
        });
    }

    #[test]
    fn notify_wakes_exactly_n() {
        run_local(async {
            let (buf, _rx) = buffer(&["a", "b"], 64);
            let _ = buf
                .put_batch(vec![(vec![DataKey::from("seq")], 10); 2])
                .expect("capacity");

            // Two waiters demanding more than is available.
            let w1 = {
                let buf = buf.clone();
                tokio::task::spawn_local(
                    async move { buf.get_batch_for_rpc(&demand("a", &["seq"], 4, 4)).await },
                )
            };
            let w2 = {
                let buf = buf.clone();
                tokio::task::spawn_local(
                    async move { buf.get_batch_for_rpc(&demand("b", &["seq"], 4, 4)).await },
                )
            };
            tokio::task::yield_now().await;

            let _ = buf
                .put_batch(vec![(vec![DataKey::from("seq")], 10); 2])
                .expect("capacity");
            buf.notify(2);
            let b1 = tokio::time::timeout(Duration::from_secs(1), w1)
                .await
                .expect("woken")
                .expect("task")
                .expect("batch");
            let b2 = tokio::time::timeout(Duration::from_secs(1), w2)
                .await
                .expect("woken")
                .expect("task")
                .expect("batch");
            assert_eq!(b1.len(), 4);
            assert_eq!(b2.len(), 4);
        });
    }

    #[test]
    fn balanced_dp_rounds_down() {
        run_local(async {
            let (buf, _rx) = buffer(&["train"], 64);
            let _ = buf
                .put_batch(vec![(vec![DataKey::from("seq")], 10); 7])
                .expect("capacity");
            let mut d = demand("train", &["seq"], 2, 16);
            d.balanced_dp = true;
            d.dp_size = 2;
            let batch = buf.get_batch_for_rpc(&d).await.expect("ready");
            assert_eq!(batch.len(), 6);
        });
    }

    #[test]
    fn source_depletion_signals_fetch() {
        run_local(async {
            let (buf, mut fetch_rx) = buffer(&["gen"], 64);
            let waiter = {
                let buf = buf.clone();
                let mut d = demand("gen", &[], 4, 4);
                d.is_src = true;
                tokio::task::spawn_local(async move { buf.get_batch_for_rpc(&d).await })
            };
            tokio::task::yield_now().await;
            assert!(fetch_rx.try_recv().is_ok());

            let _ = buf
                .put_batch(vec![(vec![], 10); 4])
                .expect("capacity");
            buf.notify(1);
            let batch = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("woken")
                .expect("task")
                .expect("batch");
            assert_eq!(batch.len(), 4);
        });
    }

    #[test]
    fn capacity_is_enforced() {
        let (buf, _rx) = buffer(&["train"], 4);
        let err = buf
            .put_batch(vec![(vec![], 10); 5])
            .expect_err("over capacity");
        assert!(matches!(err, Error::BufferFull { capacity: 4 }));
    }

    #[test]
    fn amend_unknown_index_is_fatal() {
        let (buf, _rx) = buffer(&["train"], 4);
        let err = buf
            .amend_batch(&[99], vec![(vec![], 10)])
            .expect_err("unknown index");
        assert!(matches!(err, Error::UnknownBufferIndex { index: 99 }));
    }
}
