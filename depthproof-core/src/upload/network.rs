use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    None,
    Wifi,
    Cellular,
    Ethernet,
    Other,
}

/// Connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
    pub connection_type: ConnectionType,
}

impl NetworkStatus {
    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            connection_type,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
            connection_type: ConnectionType::None,
        }
    }

    /// Uploads run only when connected and the internet is reachable.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

/// Shared view of network status that the upload queue gates on.
#[derive(Clone)]
pub struct NetworkMonitor {
    status: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            status: Arc::new(status),
        }
    }

    /// For hosts without connectivity reporting, e.g. the CLI.
    pub fn always_online() -> Self {
        Self::new(NetworkStatus::online(ConnectionType::Other))
    }

    /// Follow a raw platform feed, publishing a change only after it has been
    /// stable for `window`. Flapping links do not wake the queue repeatedly.
    pub fn debounced(mut raw: watch::Receiver<NetworkStatus>, window: Duration) -> Self {
        let monitor = Self::new(*raw.borrow_and_update());
        let target = Arc::downgrade(&monitor.status);

        tokio::spawn(async move {
            while raw.changed().await.is_ok() {
                loop {
                    match tokio::time::timeout(window, raw.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) | Err(_) => break,
                    }
                }
                let settled = *raw.borrow_and_update();
                let Some(target) = target.upgrade() else {
                    return;
                };
                let changed = target.send_if_modified(|current| {
                    if *current == settled {
                        false
                    } else {
                        *current = settled;
                        true
                    }
                });
                if changed {
                    debug!(online = settled.is_online(), connection = ?settled.connection_type, "Network status settled");
                }
            }
        });

        monitor
    }

    pub fn set(&self, status: NetworkStatus) {
        let was_online = self.is_online();
        self.status.send_replace(status);
        if was_online != status.is_online() {
            info!(online = status.is_online(), "Network availability changed");
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status.borrow().is_online()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Resolve once the network is online.
    pub async fn wait_online(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only ends when online.
        let _ = rx.wait_for(NetworkStatus::is_online).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_debounce_ignores_flapping() {
        let (raw, rx) = watch::channel(NetworkStatus::online(ConnectionType::Wifi));
        let monitor = NetworkMonitor::debounced(rx, Duration::from_millis(300));

        raw.send_replace(NetworkStatus::offline());
        tokio::time::sleep(Duration::from_millis(100)).await;
        raw.send_replace(NetworkStatus::online(ConnectionType::Wifi));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_publishes_stable_change() {
        let (raw, rx) = watch::channel(NetworkStatus::online(ConnectionType::Wifi));
        let monitor = NetworkMonitor::debounced(rx, Duration::from_millis(300));

        raw.send_replace(NetworkStatus::offline());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(monitor.is_online());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_wait_online_resolves_on_recovery() {
        let monitor = NetworkMonitor::new(NetworkStatus::offline());
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_online().await })
        };

        monitor.set(NetworkStatus::online(ConnectionType::Cellular));
        waiter.await.unwrap();
        assert_eq!(monitor.status().connection_type, ConnectionType::Cellular);
    }
}
