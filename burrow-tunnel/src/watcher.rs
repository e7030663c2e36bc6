//! Interface watcher
//!
//! Owns the subscription to host change notifications for the lifetime of
//! one tunnel. Before the adapter exists it just supervises the
//! notification stream; once configured it fans events out to per-family
//! MTU monitors, runs the dynamic diagnostics, and tells the orchestrator
//! the tunnel is fully started. If the notification stream dies underneath
//! us, that is an internal error the orchestrator treats like a stop
//! request with an attached failure.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use burrow_conf::Config;
use burrow_net::{AddressFamily, ChangeNotifier, InterfaceLuid, NetworkState};

use crate::error::{Error, FailureClass, ServiceFailure};
use crate::mtu::MtuMonitor;
use crate::pitfalls;

/// Events the watcher reports to the orchestrator's control loop.
#[derive(Debug)]
pub enum WatcherEvent {
    /// The tunnel is configured and monitoring is live.
    Started,
    /// An internal failure; triggers teardown with the carried failure.
    Error(ServiceFailure),
}

pub struct InterfaceWatcher {
    net: Arc<dyn NetworkState>,
    notifier: Arc<dyn ChangeNotifier>,
    events_tx: mpsc::Sender<WatcherEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl InterfaceWatcher {
    /// Start watching. The returned receiver delivers [`WatcherEvent`]s to
    /// the orchestrator.
    pub fn start(
        net: Arc<dyn NetworkState>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> (Self, mpsc::Receiver<WatcherEvent>) {
        let (events_tx, events_rx) = mpsc::channel(8);

        // Supervise the notification stream itself: a closed stream means
        // we can no longer track the default route.
        let mut supervision_rx = notifier.subscribe();
        let supervisor_tx = events_tx.clone();
        let supervisor = tokio::spawn(async move {
            loop {
                match supervision_rx.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        let failure = ServiceFailure::new(
                            FailureClass::NetworkWatch,
                            Error::Watcher("network change notification stream closed".into()),
                        );
                        let _ = supervisor_tx.send(WatcherEvent::Error(failure)).await;
                        break;
                    }
                }
            }
        });

        let watcher = InterfaceWatcher {
            net,
            notifier,
            events_tx,
            tasks: vec![supervisor],
        };
        (watcher, events_rx)
    }

    /// Attach the live tunnel: start per-family MTU monitors (unless the
    /// config pins an MTU), kick off the dynamic diagnostics, and signal
    /// `Started`.
    pub fn configure(&mut self, config: &Config, tunnel: InterfaceLuid) {
        for family in [AddressFamily::V4, AddressFamily::V6] {
            match config.interface.mtu {
                None => {
                    let monitor = Arc::new(MtuMonitor::new(self.net.clone(), family, tunnel));
                    let events = self.notifier.subscribe();
                    self.tasks.push(tokio::spawn(monitor.run(events)));
                }
                Some(mtu) => {
                    // A declared MTU wins over default-route tracking.
                    if let Err(err) = self.net.set_interface_mtu(tunnel, family, mtu.into()) {
                        tracing::warn!("failed to apply configured {} MTU: {}", family, err);
                    }
                }
            }

            pitfalls::evaluate_dynamic(self.net.clone(), family, config.clone(), tunnel);
        }

        let tx = self.events_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let _ = tx.send(WatcherEvent::Started).await;
        }));
    }

    /// Stop all monitoring tasks. Used during teardown.
    pub async fn destroy(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_net::mock::{MockNetworkState, MockNotifier};

    #[tokio::test]
    async fn test_configure_signals_started() {
        let net = Arc::new(MockNetworkState::new());
        let notifier = Arc::new(MockNotifier::new());
        let (mut watcher, mut events) = InterfaceWatcher::start(net, notifier);
        watcher.configure(&Config::default(), InterfaceLuid(1));

        match events.recv().await {
            Some(WatcherEvent::Started) => {}
            other => panic!("expected Started, got {other:?}"),
        }
        watcher.destroy().await;
    }

    #[tokio::test]
    async fn test_configured_mtu_applied_instead_of_monitoring() {
        let net = Arc::new(MockNetworkState::new());
        let notifier = Arc::new(MockNotifier::new());
        let (mut watcher, mut events) = InterfaceWatcher::start(net.clone(), notifier);

        let mut config = Config::default();
        config.interface.mtu = Some(1380);
        watcher.configure(&config, InterfaceLuid(1));

        assert!(matches!(events.recv().await, Some(WatcherEvent::Started)));
        let writes = net.mtu_writes();
        assert!(writes.contains(&(InterfaceLuid(1), AddressFamily::V4, 1380)));
        assert!(writes.contains(&(InterfaceLuid(1), AddressFamily::V6, 1380)));
        watcher.destroy().await;
    }

    #[tokio::test]
    async fn test_closed_notifier_reports_error() {
        let net = Arc::new(MockNetworkState::new());
        let notifier = Arc::new(MockNotifier::new());
        let (watcher, mut events) = InterfaceWatcher::start(net, notifier.clone());

        notifier.close();
        match events.recv().await {
            Some(WatcherEvent::Error(failure)) => {
                assert_eq!(failure.class, FailureClass::NetworkWatch);
            }
            other => panic!("expected Error, got {other:?}"),
        }
        watcher.destroy().await;
    }
}
