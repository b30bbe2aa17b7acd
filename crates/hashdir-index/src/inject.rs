use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::FailureInjectionConfig;
use crate::error::{IndexError, IndexResult};

/// Synthetic failure source for crash-consistency testing.
///
/// Mutating operations call [`FailureInjector::maybe_fail`] between their
/// steps. A point fails only if more points have passed since the last
/// failure than passed before it, so every retry of the same operation
/// gets strictly further than the previous attempt and eventually
/// completes, even at probability 1.0.
///
/// Injection is armed by [`FailureInjector::begin`] and disarmed by
/// [`FailureInjector::finish`]; outside a guarded operation it never fires.
pub struct FailureInjector {
    probability: f64,
    state: Mutex<InjectorState>,
}

struct InjectorState {
    armed: bool,
    current: u64,
    last_failure: u64,
    injected: u64,
    rng: StdRng,
}

impl FailureInjector {
    /// An injector that never fires.
    pub fn disabled() -> Self {
        Self::new(0.0, Some(0))
    }

    /// An injector firing with `probability` at eligible points.
    pub fn new(probability: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            probability: probability.clamp(0.0, 1.0),
            state: Mutex::new(InjectorState {
                armed: false,
                current: 0,
                last_failure: 0,
                injected: 0,
                rng,
            }),
        }
    }

    pub fn from_config(config: &FailureInjectionConfig) -> Self {
        Self::new(config.probability, config.seed)
    }

    pub fn is_enabled(&self) -> bool {
        self.probability > 0.0
    }

    /// Arm injection for one guarded operation and reset the counters.
    pub fn begin(&self) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.state.lock().expect("injector mutex poisoned");
        state.armed = true;
        state.current = 0;
        state.last_failure = 0;
    }

    /// Disarm injection once the guarded operation has completed.
    pub fn finish(&self) {
        let mut state = self.state.lock().expect("injector mutex poisoned");
        state.armed = false;
    }

    /// Possibly fail at this point with [`IndexError::InjectedFailure`].
    pub fn maybe_fail(&self) -> IndexResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut state = self.state.lock().expect("injector mutex poisoned");
        if !state.armed {
            return Ok(());
        }
        if state.current > state.last_failure && state.rng.gen::<f64>() < self.probability {
            let point = state.current;
            state.last_failure = point;
            state.current = 0;
            state.injected += 1;
            tracing::debug!(point, "injecting failure");
            return Err(IndexError::InjectedFailure { point });
        }
        state.current += 1;
        Ok(())
    }

    /// Total failures injected over the injector's lifetime.
    pub fn injected(&self) -> u64 {
        self.state.lock().expect("injector mutex poisoned").injected
    }
}

impl std::fmt::Debug for FailureInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureInjector")
            .field("probability", &self.probability)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_fails() {
        let inj = FailureInjector::disabled();
        inj.begin();
        for _ in 0..100 {
            inj.maybe_fail().unwrap();
        }
        assert_eq!(inj.injected(), 0);
    }

    #[test]
    fn unarmed_never_fails() {
        let inj = FailureInjector::new(1.0, Some(1));
        for _ in 0..100 {
            inj.maybe_fail().unwrap();
        }
        assert_eq!(inj.injected(), 0);
    }

    #[test]
    fn certain_failure_advances_each_attempt() {
        let inj = FailureInjector::new(1.0, Some(1));
        inj.begin();

        // Attempt n gets exactly n points further than the previous one.
        let mut reached = Vec::new();
        for _ in 0..4 {
            let mut passed = 0;
            loop {
                match inj.maybe_fail() {
                    Ok(()) => passed += 1,
                    Err(e) => {
                        assert!(e.is_retryable());
                        break;
                    }
                }
            }
            reached.push(passed);
        }
        assert_eq!(reached, vec![1, 2, 3, 4]);
        inj.finish();
        inj.maybe_fail().unwrap();
    }

    #[test]
    fn begin_resets_progress() {
        let inj = FailureInjector::new(1.0, Some(9));
        inj.begin();
        inj.maybe_fail().unwrap();
        assert!(inj.maybe_fail().is_err());
        inj.begin();
        inj.maybe_fail().unwrap();
        assert!(inj.maybe_fail().is_err());
        assert_eq!(inj.injected(), 2);
    }

    #[test]
    fn same_seed_same_failures() {
        let run = |seed| {
            let inj = FailureInjector::new(0.3, Some(seed));
            inj.begin();
            (0..200).map(|_| inj.maybe_fail().is_err()).collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }
}
