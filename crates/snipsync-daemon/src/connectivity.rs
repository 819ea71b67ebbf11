//! Online/offline tracking.
//!
//! `ConnectivityMonitor` holds the current flag and notifies subscribers on
//! transitions only. `ConnectivityProbe` feeds it from periodic reachability
//! checks when the host gives no platform signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::remote::RemoteApi;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a platform signal. Returns whether this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            let event = if online {
                info!("Connectivity restored");
                ConnectivityEvent::Online
            } else {
                info!("Connectivity lost");
                ConnectivityEvent::Offline
            };
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        changed
    }

    /// Receive future transitions. Drop the subscription to unsubscribe.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.events.subscribe(),
        }
    }
}

/// A live subscription to connectivity transitions.
pub struct Subscription {
    rx: broadcast::Receiver<ConnectivityEvent>,
}

impl Subscription {
    /// Next transition, or `None` once the monitor is gone.
    pub async fn recv(&mut self) -> Option<ConnectivityEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Connectivity subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

/// Polls the remote service and feeds the monitor.
pub struct ConnectivityProbe {
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(
        remote: Arc<dyn RemoteApi>,
        monitor: Arc<ConnectivityMonitor>,
        interval: Duration,
    ) -> Self {
        Self {
            remote,
            monitor,
            interval,
        }
    }

    /// Probe once and record the result.
    pub async fn check_once(&self) -> bool {
        let online = match self.remote.ping().await {
            Ok(()) => true,
            Err(e) if e.is_connectivity() => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
            Err(_) => true,
        };
        self.monitor.set_online(online);
        online
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Connectivity probe stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::testing::FakeRemote;

    #[tokio::test]
    async fn test_transitions_only() {
        let monitor = ConnectivityMonitor::new(true);
        let mut sub = monitor.subscribe();

        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));

        assert_eq!(sub.recv().await, Some(ConnectivityEvent::Offline));
        assert_eq!(sub.recv().await, Some(ConnectivityEvent::Online));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_misses_later_events() {
        let monitor = ConnectivityMonitor::new(false);
        let sub = monitor.subscribe();
        sub.unsubscribe();

        let mut late = monitor.subscribe();
        monitor.set_online(true);
        assert_eq!(late.recv().await, Some(ConnectivityEvent::Online));
    }

    #[tokio::test]
    async fn test_probe_maps_network_errors_to_offline() {
        let remote = Arc::new(FakeRemote::new());
        let monitor = Arc::new(ConnectivityMonitor::new(true));
        let probe = ConnectivityProbe::new(remote.clone(), monitor.clone(), Duration::from_secs(30));

        remote.set_ping_result(Err(RemoteError::Network("unreachable".into())));
        assert!(!probe.check_once().await);
        assert!(!monitor.is_online());

        remote.set_ping_result(Err(RemoteError::Status {
            status: 503,
            body: String::new(),
        }));
        assert!(probe.check_once().await);
        assert!(monitor.is_online());
    }
}
