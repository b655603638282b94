use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::constraint::NetworkStatus;

/// Source of connectivity state for the engine.
///
/// Implementations that can push changes should return a receiver from
/// [`NetworkMonitor::subscribe`]; the engine then reacts to transitions
/// immediately instead of polling.
pub trait NetworkMonitor: Send + Sync {
    fn status(&self) -> NetworkStatus;

    /// Change notifications, if this monitor supports them.
    fn subscribe(&self) -> Option<broadcast::Receiver<NetworkStatus>> {
        None
    }
}

/// Monitor with an externally settable status.
///
/// The default for embedded use and for tests: the host application
/// feeds connectivity changes in through [`StaticNetworkMonitor::set_status`].
pub struct StaticNetworkMonitor {
    status: Mutex<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatus>,
}

impl StaticNetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            status: Mutex::new(initial),
            sender,
        }
    }

    pub fn set_status(&self, status: NetworkStatus) {
        let changed = {
            let mut current = self.status.lock();
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            let _ = self.sender.send(status);
        }
    }
}

impl Default for StaticNetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Unmetered)
    }
}

impl NetworkMonitor for StaticNetworkMonitor {
    fn status(&self) -> NetworkStatus {
        *self.status.lock()
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<NetworkStatus>> {
        Some(self.sender.subscribe())
    }
}

impl std::fmt::Debug for StaticNetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticNetworkMonitor")
            .field("status", &*self.status.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_status_notifies_subscribers() {
        let monitor = StaticNetworkMonitor::new(NetworkStatus::Disconnected);
        let mut rx = monitor.subscribe().expect("subscribable");

        monitor.set_status(NetworkStatus::Metered);
        assert_eq!(monitor.status(), NetworkStatus::Metered);
        assert_eq!(rx.recv().await.unwrap(), NetworkStatus::Metered);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_rebroadcast() {
        let monitor = StaticNetworkMonitor::new(NetworkStatus::Metered);
        let mut rx = monitor.subscribe().expect("subscribable");

        monitor.set_status(NetworkStatus::Metered);
        assert!(rx.try_recv().is_err());
    }
}
