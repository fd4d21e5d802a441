//! Process shutdown flow: the signal handler asks, the run loop waits.
//!
//! A capacity-one channel carries at most one stop request; repeated
//! signals while a stop is already underway are absorbed.

use crossbeam::channel::{bounded, Receiver, Sender};

/// Why the run loop stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop was requested, normally by the termination signal handler.
    Requested,
    /// Every requester went away without asking. Treated as a stop so
    /// the process never outlives its controller.
    Abandoned,
}

pub fn shutdown_channel() -> (ShutdownRequester, ShutdownWaiter) {
    let (tx, rx) = bounded(1);
    (ShutdownRequester(tx), ShutdownWaiter(rx))
}

/// Cloneable handle that asks the process to stop. Safe to call from a
/// signal handler; asking twice changes nothing.
#[derive(Clone)]
pub struct ShutdownRequester(Sender<()>);

impl ShutdownRequester {
    pub fn request_stop(&self) {
        // A full or disconnected channel means a stop is already underway.
        let _ = self.0.try_send(());
    }
}

/// Blocks the run loop until a stop is due.
pub struct ShutdownWaiter(Receiver<()>);

impl ShutdownWaiter {
    pub fn wait(&self) -> StopReason {
        match self.0.recv() {
            Ok(()) => StopReason::Requested,
            Err(_) => StopReason::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_unblocks_the_waiter() {
        let (requester, waiter) = shutdown_channel();
        requester.request_stop();
        assert_eq!(waiter.wait(), StopReason::Requested);
    }

    #[test]
    fn repeated_requests_are_absorbed() {
        let (requester, waiter) = shutdown_channel();
        requester.request_stop();
        requester.request_stop();
        requester.clone().request_stop();

        assert_eq!(waiter.wait(), StopReason::Requested);
        // Only the first request was queued.
        assert_eq!(waiter.0.try_recv().ok(), None);
    }

    #[test]
    fn dropped_requesters_count_as_a_stop() {
        let (requester, waiter) = shutdown_channel();
        drop(requester);
        assert_eq!(waiter.wait(), StopReason::Abandoned);
    }
}
