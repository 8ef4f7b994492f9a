//! Background loop - a named thread that ticks on a fixed interval
//!
//! Each `start` gets its own stop signal, so a loop that outlived a timed-out
//! `stop` can never be revived by a later `start`.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LoopFlags {
    stop_requested: bool,
    exited: bool,
}

#[derive(Debug, Default)]
struct LoopSignal {
    flags: Mutex<LoopFlags>,
    cvar: Condvar,
}

impl LoopSignal {
    /// Sleep for `timeout` or until a stop is requested; true if stopping
    fn wait_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock();
        while !flags.stop_requested {
            if self.cvar.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
        flags.stop_requested
    }

    fn request_stop(&self) {
        self.flags.lock().stop_requested = true;
        self.cvar.notify_all();
    }

    /// Wait until the thread reports exit; false on timeout
    fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock();
        while !flags.exited {
            if self.cvar.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
        flags.exited
    }

    fn has_exited(&self) -> bool {
        self.flags.lock().exited
    }
}

/// Marks the loop as exited even when the tick panics
struct ExitGuard(Arc<LoopSignal>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.flags.lock().exited = true;
        self.0.cvar.notify_all();
    }
}

struct Running {
    signal: Arc<LoopSignal>,
    handle: JoinHandle<()>,
}

/// Periodic background thread with idempotent, bounded start/stop
pub struct BackgroundLoop {
    name: String,
    running: Mutex<Option<Running>>,
}

impl BackgroundLoop {
    pub fn new(name: impl Into<String>) -> Self {
        BackgroundLoop {
            name: name.into(),
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop thread. `tick` runs after every `interval`; returning
    /// false ends the loop. Returns false if the loop is already running.
    pub fn start<F>(&self, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            if !current.signal.has_exited() {
                return false;
            }
        }
        // Reap a loop that ended on its own
        if let Some(finished) = running.take() {
            let _ = finished.handle.join();
        }

        let signal = Arc::new(LoopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _guard = ExitGuard(Arc::clone(&thread_signal));
                while !thread_signal.wait_stop(interval) {
                    if !tick() {
                        break;
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                tracing::info!(name = %self.name, ?interval, "background loop started");
                *running = Some(Running { signal, handle });
                true
            }
            Err(e) => {
                tracing::error!(name = %self.name, error = %e, "failed to spawn background loop");
                false
            }
        }
    }

    /// Ask the loop to exit and wait up to `timeout` for it.
    ///
    /// Returns false if nothing was running. A loop that misses the deadline
    /// is detached; it still exits at its next checkpoint.
    pub fn stop(&self, timeout: Duration) -> bool {
        let Some(current) = self.running.lock().take() else {
            return false;
        };

        current.signal.request_stop();
        if current.signal.wait_exit(timeout) {
            let _ = current.handle.join();
            tracing::info!(name = %self.name, "background loop stopped");
        } else {
            tracing::warn!(name = %self.name, ?timeout, "background loop did not stop in time, detaching");
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| !r.signal.has_exited())
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        if let Some(current) = self.running.get_mut().take() {
            current.signal.request_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_loop_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let worker = BackgroundLoop::new("test-loop");

        assert!(worker.start(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }));
        assert!(worker.is_running());

        std::thread::sleep(Duration::from_millis(60));
        assert!(worker.stop(Duration::from_secs(1)));
        assert!(!worker.is_running());
        assert!(ticks.load(Ordering::SeqCst) > 0);

        let after = ticks.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let worker = BackgroundLoop::new("idempotent");
        assert!(!worker.stop(Duration::from_millis(10)));

        assert!(worker.start(Duration::from_secs(60), || true));
        assert!(!worker.start(Duration::from_secs(60), || true));

        // Long interval: stop must interrupt the sleep, not wait it out
        let started = Instant::now();
        assert!(worker.stop(Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!worker.stop(Duration::from_millis(10)));

        assert!(worker.start(Duration::from_secs(60), || true));
        assert!(worker.stop(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_is_bounded() {
        let worker = BackgroundLoop::new("slow");
        worker.start(Duration::from_millis(1), || {
            std::thread::sleep(Duration::from_millis(300));
            true
        });
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(worker.stop(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn test_tick_false_ends_loop() {
        let worker = BackgroundLoop::new("once");
        worker.start(Duration::from_millis(1), || false);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_running());
        assert!(worker.start(Duration::from_millis(1), || false));
    }
}
