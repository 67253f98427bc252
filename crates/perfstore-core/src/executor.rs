//! Scheduling of poll runners.
//!
//! Services never spawn threads or tasks themselves; they hand finished
//! [`PollRunner`]s to a [`FetchExecutor`]. Runners block while sleeping, so
//! executors must give each one a thread it may park.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::poller::PollRunner;

pub trait FetchExecutor: Send + Sync {
    /// Start driving `runner` until it is stopped
    fn submit(&self, runner: Arc<PollRunner>);
}

/// Runs every runner on the blocking pool of a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioFetchExecutor {
    handle: Handle,
}

impl TokioFetchExecutor {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime the caller is running on.
    ///
    /// Returns `None` outside of a tokio runtime.
    #[must_use]
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl FetchExecutor for TokioFetchExecutor {
    fn submit(&self, runner: Arc<PollRunner>) {
        debug!(poller = runner.name(), device_id = %runner.device(), "submitting runner to blocking pool");
        // Detached: the runner exits on its own once stopped.
        drop(self.handle.spawn_blocking(move || runner.run()));
    }
}

/// One named OS thread per runner, for embedders without a runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadFetchExecutor;

impl FetchExecutor for ThreadFetchExecutor {
    fn submit(&self, runner: Arc<PollRunner>) {
        let name = match runner.session_id() {
            Some(session_id) => format!("perfstore-{}-{session_id}", runner.name()),
            None => format!("perfstore-{}-dev{}", runner.name(), runner.device()),
        };
        let spawned = std::thread::Builder::new().name(name.clone()).spawn({
            let runner = Arc::clone(&runner);
            move || runner.run()
        });
        if let Err(err) = spawned {
            warn!(thread = %name, error = %err, "failed to spawn poll runner thread");
            runner.stop();
        }
    }
}

/// Holds runners without running them; tests drive them with [`tick_all`].
///
/// [`tick_all`]: ManualExecutor::tick_all
#[derive(Debug, Default)]
pub struct ManualExecutor {
    runners: Mutex<Vec<Arc<PollRunner>>>,
}

impl ManualExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one iteration of every live runner, forgetting stopped ones.
    ///
    /// Returns how many runners ticked.
    pub fn tick_all(&self) -> usize {
        let snapshot: Vec<Arc<PollRunner>> = {
            let mut runners = self.runners.lock().unwrap_or_else(PoisonError::into_inner);
            runners.retain(|r| !r.is_stopped());
            runners.clone()
        };
        snapshot.iter().filter(|r| r.tick()).count()
    }

    /// Runners submitted and not yet observed stopped
    #[must_use]
    pub fn pending(&self) -> usize {
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| !r.is_stopped())
            .count()
    }

    #[must_use]
    pub fn runners(&self) -> Vec<Arc<PollRunner>> {
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FetchExecutor for ManualExecutor {
    fn submit(&self, runner: Arc<PollRunner>) {
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(runner);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::poller::{PollSettings, Poller};
    use crate::types::DeviceId;

    struct Counting(Arc<AtomicUsize>);

    impl Poller for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn poll(&mut self) -> crate::Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn runner(counter: &Arc<AtomicUsize>) -> Arc<PollRunner> {
        PollRunner::new(
            Box::new(Counting(Arc::clone(counter))),
            PollSettings {
                interval: Duration::from_millis(2),
                stop_check_interval: Duration::from_millis(1),
            },
            DeviceId(1),
            Some(1),
        )
    }

    fn wait_for(counter: &AtomicUsize, at_least: usize) {
        for _ in 0..2_000 {
            if counter.load(Ordering::SeqCst) >= at_least {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("runner never reached {at_least} polls");
    }

    #[test]
    fn manual_executor_ticks_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = ManualExecutor::new();
        let runner = runner(&counter);
        executor.submit(Arc::clone(&runner));

        assert_eq!(executor.tick_all(), 1);
        assert_eq!(executor.tick_all(), 1);
        runner.stop();
        assert_eq!(executor.tick_all(), 0);
        assert_eq!(executor.pending(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn thread_executor_runs_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = runner(&counter);
        ThreadFetchExecutor.submit(Arc::clone(&runner));
        wait_for(&counter, 3);
        runner.stop();
        assert!(runner.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tokio_executor_uses_blocking_pool() {
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = runner(&counter);
        let executor = TokioFetchExecutor::current().unwrap();
        executor.submit(Arc::clone(&runner));

        let waiter = Arc::clone(&counter);
        tokio::task::spawn_blocking(move || wait_for(&waiter, 3))
            .await
            .unwrap();
        runner.stop();
    }
}
