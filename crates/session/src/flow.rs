//! Credit-based flow control for a single stream.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Notify;

/// Flow controller for one stream.
///
/// `send_window` is credit granted by the peer; senders acquire credit
/// before enqueueing payload, so the window never goes negative and no
/// frame is transmitted past remaining credit. `recv_window` is credit we
/// granted the peer; the demultiplexer charges it per inbound payload byte
/// and the reader re-credits it as data is consumed.
#[derive(Debug)]
pub(crate) struct FlowController {
    send_window: AtomicU32,
    recv_window: AtomicU32,
    send_notify: Notify,
    closed: AtomicBool,
}

impl FlowController {
    pub(crate) fn new(initial_window: u32) -> Self {
        Self {
            send_window: AtomicU32::new(initial_window),
            recv_window: AtomicU32::new(initial_window),
            send_notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Acquire `size` bytes of send credit, suspending until the peer
    /// replenishes the window. Returns `false` if the stream closed while
    /// waiting.
    pub(crate) async fn acquire(&self, size: u32) -> bool {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return false;
            }

            // Arm the notification before re-checking the window so a
            // replenish between the check and the await is not missed.
            let notified = self.send_notify.notified();

            let window = self.send_window.load(Ordering::Acquire);
            if window >= size {
                match self.send_window.compare_exchange(
                    window,
                    window - size,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(_) => continue,
                }
            }

            notified.await;
        }
    }

    /// Replenish the send window from a peer `WindowUpdate`.
    pub(crate) fn replenish_send(&self, increment: u32) {
        self.send_window.fetch_add(increment, Ordering::AcqRel);
        self.send_notify.notify_waiters();
    }

    /// Charge the receive window for an inbound payload. Returns `false`
    /// when the peer overran its credit.
    pub(crate) fn charge_recv(&self, size: u32) -> bool {
        loop {
            let window = self.recv_window.load(Ordering::Acquire);
            if window < size {
                return false;
            }
            match self.recv_window.compare_exchange(
                window,
                window - size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => {}
            }
        }
    }

    /// Re-credit the receive window for consumed-and-acknowledged bytes.
    pub(crate) fn credit_recv(&self, size: u32) {
        self.recv_window.fetch_add(size, Ordering::AcqRel);
    }

    /// Wake and fail every suspended sender. Used on reset and teardown.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.send_notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn send_window(&self) -> u32 {
        self.send_window.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_consumes_credit() {
        let flow = FlowController::new(100);
        assert!(flow.acquire(60).await);
        assert_eq!(flow.send_window(), 40);
        assert!(flow.acquire(40).await);
        assert_eq!(flow.send_window(), 0);
    }

    #[tokio::test]
    async fn acquire_suspends_until_replenished() {
        let flow = Arc::new(FlowController::new(10));
        assert!(flow.acquire(10).await);

        let waiter = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.acquire(5).await })
        };

        // The waiter cannot make progress with an empty window.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flow.replenish_send(5);
        assert!(waiter.await.unwrap());
        assert_eq!(flow.send_window(), 0);
    }

    #[tokio::test]
    async fn close_fails_suspended_senders() {
        let flow = Arc::new(FlowController::new(0));
        let waiter = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.acquire(1).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        flow.close();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn recv_overrun_is_detected() {
        let flow = FlowController::new(8);
        assert!(flow.charge_recv(8));
        assert!(!flow.charge_recv(1));
        flow.credit_recv(4);
        assert!(flow.charge_recv(4));
    }
}
