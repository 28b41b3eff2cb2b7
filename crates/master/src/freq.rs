// SPDX-License-Identifier: Apache-2.0

//! Epoch/step/wall-clock frequency control for save and eval.

use std::time::Duration;
use tokio::time::Instant;
use trainflow_config::FreqSpec;

/// Fires when *any* armed threshold (epochs, steps, seconds) since the last
/// fire is reached. A control with no thresholds never fires.
#[derive(Debug)]
pub struct FreqCtl {
    freq_epoch: Option<u64>,
    freq_step: Option<u64>,
    freq_sec: Option<Duration>,
    epochs_since: u64,
    steps_since: u64,
    last_fire: Instant,
}

impl FreqCtl {
    /// Creates a control from its spec, with the clock starting now.
    #[must_use]
    pub fn new(spec: &FreqSpec) -> Self {
        Self {
            freq_epoch: spec.epochs,
            freq_step: spec.steps,
            freq_sec: spec.secs,
            epochs_since: 0,
            steps_since: 0,
            last_fire: Instant::now(),
        }
    }

    /// Accumulates progress and reports whether the control fires. Firing
    /// resets every counter and the clock.
    pub fn check(&mut self, epochs: u64, steps: u64) -> bool {
        self.epochs_since += epochs;
        self.steps_since += steps;

        let fired = self.freq_epoch.is_some_and(|f| self.epochs_since >= f)
            || self.freq_step.is_some_and(|f| self.steps_since >= f)
            || self.freq_sec.is_some_and(|f| self.last_fire.elapsed() >= f);
        if fired {
            self.epochs_since = 0;
            self.steps_since = 0;
            self.last_fire = Instant::now();
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_control_never_fires() {
        let mut ctl = FreqCtl::new(&FreqSpec::default());
        for _ in 0..100 {
            assert!(!ctl.check(1, 1));
        }
    }

    #[test]
    fn step_threshold_fires_and_resets() {
        let mut ctl = FreqCtl::new(&FreqSpec {
            steps: Some(3),
            ..FreqSpec::default()
        });
        assert!(!ctl.check(0, 1));
        assert!(!ctl.check(0, 1));
        assert!(ctl.check(0, 1));
        assert!(!ctl.check(0, 1));
        assert!(!ctl.check(0, 2));
        assert!(ctl.check(0, 1));
    }

    #[test]
    fn any_threshold_suffices() {
        let mut ctl = FreqCtl::new(&FreqSpec {
            epochs: Some(1),
            steps: Some(1000),
            ..FreqSpec::default()
        });
        assert!(!ctl.check(0, 1));
        assert!(ctl.check(1, 1));
    }

    #[test]
    fn time_threshold_fires_once_elapsed() {
        let mut ctl = FreqCtl::new(&FreqSpec {
            secs: Some(Duration::ZERO),
            ..FreqSpec::default()
        });
        assert!(ctl.check(0, 1));
    }
}
