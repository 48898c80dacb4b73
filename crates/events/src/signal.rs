//! Lossless wake-up signals with bounded waits.
//!
//! A [`WakeSignal`] is a generation counter on a `tokio::sync::watch`
//! channel. Each [`WakeListener`] remembers the last generation it saw, so
//! a notification sent while nobody was waiting is still observed by the
//! next `wait`. Several notifications between two waits collapse into one
//! wake-up. Waits always carry a timeout so callers can re-check pause,
//! resize and shutdown state even when no signal arrives.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Sending half. Cheap to clone; all clones share one counter.
#[derive(Clone)]
pub struct WakeSignal {
    name: &'static str,
    sender: Arc<watch::Sender<u64>>,
}

impl WakeSignal {
    pub fn new(name: &'static str) -> Self {
        let (sender, _) = watch::channel(0);
        Self {
            name,
            sender: Arc::new(sender),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wake every listener.
    pub fn notify(&self) {
        self.sender.send_modify(|generation| *generation = generation.wrapping_add(1));
        tracing::trace!(signal = self.name, "Signal raised");
    }

    /// A listener that only observes notifications sent after this call.
    pub fn listener(&self) -> WakeListener {
        WakeListener {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving half, one per waiting actor.
pub struct WakeListener {
    receiver: watch::Receiver<u64>,
}

impl WakeListener {
    /// Wait for a notification newer than the last one seen, at most
    /// `timeout`. Returns `true` when woken by a notification.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.receiver.changed()).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                // Every sender is gone: nothing will ever notify again.
                tokio::time::sleep(timeout).await;
                false
            }
            Err(_) => false,
        }
    }

    /// Whether a notification arrived since the last wait, without
    /// consuming it.
    pub fn is_pending(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notification_before_wait_is_not_lost() {
        let signal = WakeSignal::new("work_ready");
        let mut listener = signal.listener();
        signal.notify();
        assert!(listener.is_pending());
        assert!(listener.wait(Duration::from_secs(5)).await);
        assert!(!listener.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_notification() {
        let signal = WakeSignal::new("logs_ready");
        let mut listener = signal.listener();
        assert!(!listener.wait(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn burst_collapses_into_one_wake() {
        let signal = WakeSignal::new("caught_up");
        let mut listener = signal.listener();
        signal.notify();
        signal.notify();
        signal.notify();
        assert!(listener.wait(Duration::from_secs(5)).await);
        assert!(!listener.is_pending());
    }

    #[tokio::test]
    async fn every_listener_is_woken() {
        let signal = WakeSignal::new("work_ready");
        let mut a = signal.listener();
        let mut b = signal.clone().listener();
        signal.notify();
        assert!(a.wait(Duration::from_secs(5)).await);
        assert!(b.wait(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn waiter_is_woken_by_later_notify() {
        let signal = WakeSignal::new("work_ready");
        let mut listener = signal.listener();
        let notifier = signal.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            notifier.notify();
        });
        assert!(listener.wait(Duration::from_secs(5)).await);
        handle.await.unwrap();
    }
}
