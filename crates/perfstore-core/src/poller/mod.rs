//! Background pollers and the runner that drives them.
//!
//! A [`Poller`] knows how to pull one round of telemetry from a device and
//! persist it. A [`PollRunner`] wraps a poller with a cooperative stop flag
//! and a fixed cadence; the runner itself is handed to a
//! [`FetchExecutor`](crate::executor::FetchExecutor) for scheduling.

pub mod cpu;
pub mod device;
pub mod event;
pub mod jvmti;
pub mod memory;
pub mod stream;
pub mod symbols;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::Result;
use crate::config::PollingConfig;
use crate::types::DeviceId;

pub use cpu::CpuPoller;
pub use device::DevicePoller;
pub use event::EventPoller;
pub use jvmti::JvmtiPoller;
pub use memory::MemoryStatsPoller;
pub use stream::UnifiedEventsPoller;
pub use symbols::{NativeSymbolizer, NopSymbolizer, ResolvedSymbol, SymbolPoller};

/// One round of fetch-and-persist work.
///
/// Implementations keep their own cursor and only advance it once the
/// corresponding write has succeeded, so a failed round is retried in full.
pub trait Poller: Send {
    fn name(&self) -> &'static str;

    /// Run one round; returns the number of rows written
    fn poll(&mut self) -> Result<usize>;
}

/// Cadence of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Upper bound on how long `stop()` can go unnoticed while sleeping
    pub stop_check_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for PollSettings {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            stop_check_interval: config.stop_check_interval(),
        }
    }
}

pub struct PollRunner {
    name: &'static str,
    device: DeviceId,
    session_id: Option<i64>,
    poller: Mutex<Box<dyn Poller>>,
    stop: Arc<AtomicBool>,
    settings: PollSettings,
    iterations: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for PollRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollRunner")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("session_id", &self.session_id)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl PollRunner {
    #[must_use]
    pub fn new(
        poller: Box<dyn Poller>,
        settings: PollSettings,
        device: DeviceId,
        session_id: Option<i64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: poller.name(),
            device,
            session_id,
            poller: Mutex::new(poller),
            stop: Arc::new(AtomicBool::new(false)),
            settings,
            iterations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    #[must_use]
    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Ask the runner to exit; takes effect at the next flag check
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        debug!(
            poller = self.name,
            device_id = %self.device,
            session_id = ?self.session_id,
            "poll runner stop requested"
        );
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run exactly one iteration; returns false once the runner is stopped.
    ///
    /// A failed round is logged and counted, never propagated.
    pub fn tick(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the lock: stop() may have landed while we waited.
        if self.is_stopped() {
            return false;
        }
        self.iterations.fetch_add(1, Ordering::Relaxed);
        match poller.poll() {
            Ok(rows) => {
                trace!(
                    poller = self.name,
                    device_id = %self.device,
                    session_id = ?self.session_id,
                    rows,
                    "poll round complete"
                );
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    poller = self.name,
                    device_id = %self.device,
                    session_id = ?self.session_id,
                    error = %err,
                    "poll round failed"
                );
            }
        }
        true
    }

    /// Loop until stopped. Blocks the calling thread.
    pub fn run(&self) {
        let span = crate::session_span!(
            "poll_runner",
            poller = self.name,
            device_id = self.device.0,
            session_id = tracing::field::debug(self.session_id),
        );
        let _guard = span.enter();
        debug!(poller = self.name, device_id = %self.device, session_id = ?self.session_id, "poll runner started");
        while self.tick() {
            self.sleep_interval();
        }
        debug!(
            poller = self.name,
            device_id = %self.device,
            session_id = ?self.session_id,
            iterations = self.iterations(),
            failures = self.failures(),
            "poll runner exited"
        );
    }

    fn sleep_interval(&self) {
        let deadline = Instant::now() + self.settings.interval;
        let slice = self.settings.stop_check_interval.max(Duration::from_millis(1));
        loop {
            if self.is_stopped() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransportError};

    struct Scripted {
        outcomes: Vec<Result<usize>>,
        calls: Arc<AtomicU64>,
    }

    impl Poller for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn poll(&mut self) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.outcomes.is_empty() {
                Ok(0)
            } else {
                self.outcomes.remove(0)
            }
        }
    }

    fn runner(outcomes: Vec<Result<usize>>) -> (Arc<PollRunner>, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let poller = Scripted {
            outcomes,
            calls: Arc::clone(&calls),
        };
        let settings = PollSettings {
            interval: Duration::from_millis(5),
            stop_check_interval: Duration::from_millis(1),
        };
        (PollRunner::new(Box::new(poller), settings, DeviceId(1), Some(7)), calls)
    }

    #[test]
    fn failed_round_does_not_stop_runner() {
        let (runner, calls) = runner(vec![
            Err(Error::Transport(TransportError::Unavailable("gone".into()))),
            Ok(3),
        ]);
        assert!(runner.tick());
        assert!(runner.tick());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(runner.failures(), 1);
        assert_eq!(runner.iterations(), 2);
    }

    #[test]
    fn stopped_runner_does_not_poll() {
        let (runner, calls) = runner(Vec::new());
        runner.stop();
        assert!(!runner.tick());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn run_exits_after_stop() {
        let (runner, calls) = runner(Vec::new());
        let handle = {
            let runner = Arc::clone(&runner);
            std::thread::spawn(move || runner.run())
        };
        while calls.load(Ordering::SeqCst) < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        runner.stop();
        handle.join().unwrap();
        assert!(runner.is_stopped());
    }

    #[test]
    fn settings_follow_config() {
        let config = PollingConfig {
            poll_interval_ms: 100,
            stop_check_interval_ms: 10,
        };
        let settings = PollSettings::from(&config);
        assert_eq!(settings.interval, Duration::from_millis(100));
        assert_eq!(settings.stop_check_interval, Duration::from_millis(10));
    }
}
