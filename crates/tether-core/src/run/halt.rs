//! Cancellation signal for a blocking run.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Code and user data carried from [`Session::halt`](crate::session::Session::halt)
/// into the resulting [`Event::Halt`](crate::events::Event::Halt)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltRequest
{
    /// Caller-chosen code
    pub code: u64,
    /// Caller-chosen payload
    pub user_data: u64,
}

/// One-shot halt flag a backend can block on
///
/// `raise` sets the request and wakes every waiter; the dispatcher `take`s it
/// when the run drains. A request raised while no run is outstanding stays
/// set and ends the next run immediately. Raising twice before a take keeps
/// the latest request.
#[derive(Debug, Default)]
pub struct HaltSignal
{
    request: Mutex<Option<HaltRequest>>,
    raised: Condvar,
}

impl HaltSignal
{
    /// New, unraised signal
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Raise the signal and wake waiters
    pub fn raise(&self, code: u64, user_data: u64)
    {
        let mut request = self.request.lock();
        *request = Some(HaltRequest { code, user_data });
        debug!("halt raised (code {}, user data {:#x})", code, user_data);
        self.raised.notify_all();
    }

    /// Whether a request is pending
    pub fn is_raised(&self) -> bool
    {
        self.request.lock().is_some()
    }

    /// Consume the pending request, if any
    pub fn take(&self) -> Option<HaltRequest>
    {
        self.request.lock().take()
    }

    /// Block until the signal is raised (does not consume it)
    pub fn wait(&self)
    {
        let mut request = self.request.lock();
        while request.is_none() {
            self.raised.wait(&mut request);
        }
    }

    /// Block until raised or `timeout` elapses; returns whether it was raised
    pub fn wait_timeout(&self, timeout: Duration) -> bool
    {
        let mut request = self.request.lock();
        if request.is_none() {
            let _ = self.raised.wait_while_for(&mut request, |r| r.is_none(), timeout);
        }
        request.is_some()
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_raise_wakes_waiter()
    {
        let signal = Arc::new(HaltSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                signal.wait();
                signal.take()
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.raise(5, 0xabc);
        let got = waiter.join().unwrap();
        assert_eq!(got, Some(HaltRequest { code: 5, user_data: 0xabc }));
        assert!(!signal.is_raised());
    }

    #[test]
    fn test_wait_timeout_without_raise()
    {
        let signal = HaltSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        signal.raise(1, 2);
        assert!(signal.wait_timeout(Duration::from_millis(5)));
    }
}
