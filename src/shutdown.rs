/*!
Cooperative cancellation token observed at every blocking point.
*/
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Cadence at which blocking loops re-check for shutdown.
pub const THREAD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A one-way flag with a condvar so sleepers wake immediately when the
/// process starts tearing down.
#[derive(Default)]
pub struct Shutdown {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Arc<Shutdown> {
        Arc::new(Shutdown::default())
    }

    pub fn signal(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Sleep for at most `timeout`; returns true when shutdown was
    /// signalled (now or earlier).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if *flag {
            return true;
        }
        let _ = self.condvar.wait_for(&mut flag, timeout);
        *flag
    }

    /// Block until shutdown is signalled.
    pub fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.condvar.wait(&mut flag);
        }
    }
}
