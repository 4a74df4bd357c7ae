//! Lifecycle of the learned model.
//!
//! The supervisor loads the model lazily on first use, shares the loaded
//! handle with every request and takes it out of service when loading fails or
//! inference keeps failing. Callers never see an error from it: no handle
//! simply means "use the fallback detector".

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::model::ModelHandle;
use crate::traits::ModelLoader;

/// Snapshot of the supervisor's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready,
    Unavailable,
}

enum Slot {
    Uninitialized,
    Loading,
    Ready(ModelHandle),
    Unavailable { since: Instant },
}

struct Inner {
    slot: Slot,
    consecutive_failures: u32,
    load_attempts: u64,
}

pub struct ModelSupervisor<L: ModelLoader> {
    loader: L,
    config: SupervisorConfig,
    inner: Mutex<Inner>,
    loaded: Condvar,
}

impl<L: ModelLoader> ModelSupervisor<L> {
    pub fn new(loader: L, config: SupervisorConfig) -> Self {
        Self {
            loader,
            config,
            inner: Mutex::new(Inner {
                slot: Slot::Uninitialized,
                consecutive_failures: 0,
                load_attempts: 0,
            }),
            loaded: Condvar::new(),
        }
    }

    /// The shared model handle, loading it first if nobody has yet.
    ///
    /// Blocks while another caller is loading. Returns `None` when the model
    /// is unavailable; that is the signal to run the fallback.
    pub fn acquire(&self) -> Option<ModelHandle> {
        let mut inner = self.inner.lock();
        loop {
            match &inner.slot {
                Slot::Ready(handle) => return Some(Arc::clone(handle)),
                Slot::Loading => {
                    self.loaded.wait(&mut inner);
                    continue;
                }
                Slot::Unavailable { since } => match self.config.retry_cooldown() {
                    Some(cooldown) if since.elapsed() >= cooldown => {
                        info!(loader = %self.loader.describe(), "cool-down elapsed, retrying model load");
                    }
                    _ => return None,
                },
                Slot::Uninitialized => {}
            }
            break;
        }

        inner.slot = Slot::Loading;
        inner.load_attempts += 1;
        drop(inner);

        // load outside the lock so state() stays responsive
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.loader.load()));

        let mut inner = self.inner.lock();
        let handle = match outcome {
            Ok(Ok(model)) => {
                let handle: ModelHandle = Arc::from(model);
                inner.slot = Slot::Ready(Arc::clone(&handle));
                inner.consecutive_failures = 0;
                info!(
                    loader = %self.loader.describe(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model ready"
                );
                Some(handle)
            }
            Ok(Err(e)) => {
                warn!(loader = %self.loader.describe(), error = %e, "model unavailable, using fallback detector");
                inner.slot = Slot::Unavailable {
                    since: Instant::now(),
                };
                None
            }
            Err(_) => {
                error!(loader = %self.loader.describe(), "model loader panicked, using fallback detector");
                inner.slot = Slot::Unavailable {
                    since: Instant::now(),
                };
                None
            }
        };
        self.loaded.notify_all();
        handle
    }

    pub fn record_success(&self) {
        self.inner.lock().consecutive_failures = 0;
    }

    /// Count one failed or timed-out inference. Reaching the threshold drops
    /// the handle; requests already holding it finish with their clone.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= self.config.failure_threshold
            && matches!(inner.slot, Slot::Ready(_))
        {
            warn!(
                failures = inner.consecutive_failures,
                "repeated inference failures, taking model out of service"
            );
            inner.slot = Slot::Unavailable {
                since: Instant::now(),
            };
            inner.consecutive_failures = 0;
        }
    }

    pub fn state(&self) -> ModelState {
        match self.inner.lock().slot {
            Slot::Uninitialized => ModelState::Uninitialized,
            Slot::Loading => ModelState::Loading,
            Slot::Ready(_) => ModelState::Ready,
            Slot::Unavailable { .. } => ModelState::Unavailable,
        }
    }

    /// How many times the loader has been invoked.
    pub fn load_attempts(&self) -> u64 {
        self.inner.lock().load_attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockLoader;
    use std::time::Duration;

    fn config(cooldown: Option<u64>, threshold: u32) -> SupervisorConfig {
        SupervisorConfig {
            retry_cooldown_secs: cooldown,
            failure_threshold: threshold,
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn test_lazy_load_and_reuse() {
        let supervisor = ModelSupervisor::new(MockLoader::new(128), config(None, 3));
        assert_eq!(supervisor.state(), ModelState::Uninitialized);

        let first = supervisor.acquire().unwrap();
        let second = supervisor.acquire().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(supervisor.state(), ModelState::Ready);
        assert_eq!(supervisor.load_attempts(), 1);
    }

    #[test]
    fn test_concurrent_first_use_loads_once() {
        let loader = MockLoader::new(128).with_delay(Duration::from_millis(50));
        let supervisor = ModelSupervisor::new(loader, config(None, 3));

        let handles: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| supervisor.acquire()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(supervisor.load_attempts(), 1);
        let first = handles[0].as_ref().unwrap();
        assert!(handles
            .iter()
            .all(|h| h.as_ref().is_some_and(|h| Arc::ptr_eq(h, first))));
    }

    #[test]
    fn test_failed_load_is_sticky_without_cooldown() {
        let supervisor = ModelSupervisor::new(MockLoader::failing(), config(None, 3));
        assert!(supervisor.acquire().is_none());
        assert!(supervisor.acquire().is_none());
        assert_eq!(supervisor.state(), ModelState::Unavailable);
        assert_eq!(supervisor.load_attempts(), 1);
    }

    #[test]
    fn test_panicking_loader_counts_as_failure() {
        let supervisor = ModelSupervisor::new(MockLoader::panicking(), config(None, 3));
        assert!(supervisor.acquire().is_none());
        assert_eq!(supervisor.state(), ModelState::Unavailable);
    }

    #[test]
    fn test_cooldown_allows_one_retry() {
        let loader = MockLoader::new(128).fail_first(1);
        let supervisor = ModelSupervisor::new(loader, config(Some(0), 3));

        assert!(supervisor.acquire().is_none());
        assert_eq!(supervisor.state(), ModelState::Unavailable);

        assert!(supervisor.acquire().is_some());
        assert_eq!(supervisor.state(), ModelState::Ready);
        assert_eq!(supervisor.load_attempts(), 2);
    }

    #[test]
    fn test_cooldown_not_elapsed_keeps_fallback() {
        let supervisor = ModelSupervisor::new(MockLoader::failing(), config(Some(3600), 3));
        assert!(supervisor.acquire().is_none());
        assert!(supervisor.acquire().is_none());
        assert_eq!(supervisor.load_attempts(), 1);
    }

    #[test]
    fn test_repeated_failures_take_model_out_of_service() {
        let supervisor = ModelSupervisor::new(MockLoader::new(128), config(None, 2));
        let held = supervisor.acquire().unwrap();

        supervisor.record_failure();
        assert_eq!(supervisor.state(), ModelState::Ready);
        supervisor.record_failure();
        assert_eq!(supervisor.state(), ModelState::Unavailable);
        assert!(supervisor.acquire().is_none());

        // an in-flight request keeps a usable handle
        assert_eq!(held.input_size(), 128);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let supervisor = ModelSupervisor::new(MockLoader::new(128), config(None, 2));
        supervisor.acquire().unwrap();

        supervisor.record_failure();
        supervisor.record_success();
        supervisor.record_failure();
        assert_eq!(supervisor.state(), ModelState::Ready);
        assert_eq!(supervisor.consecutive_failures(), 1);
    }
}
