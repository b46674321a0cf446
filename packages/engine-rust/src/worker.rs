//! Stop signalling for background worker threads.
//!
//! Each worker loops on `wait(interval)`: the call sleeps for the interval
//! but returns early -- and reports `true` -- the moment a shutdown is
//! signalled, so workers exit well inside the shutdown grace period.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Shared stop flag with a condition variable for prompt wakeups.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// A fresh, un-signalled stop flag.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signals every waiting worker to exit.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        drop(stopped);
        self.wake.notify_all();
    }

    /// Whether stop has been signalled.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps up to `interval`, returning `true` if stop was signalled.
    pub fn wait(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return true;
        }
        self.wake.wait_for(&mut stopped, interval);
        *stopped
    }
}

/// A background thread paired with its stop signal.
pub struct Worker {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a named worker thread running `body(signal)`.
    ///
    /// The body is expected to loop on `signal.wait(..)` and return when it
    /// reports stopped.
    pub fn spawn(
        name: &str,
        body: impl FnOnce(Arc<StopSignal>) + Send + 'static,
    ) -> Self {
        let signal = StopSignal::new();
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(thread_signal))
            .ok();
        Self {
            signal,
            handle,
        }
    }

    /// Signals the worker and joins it.
    pub fn shutdown(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
