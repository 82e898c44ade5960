//! Periodic forwarding of the remote stages.

use super::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Drains the registry's remote stages every `interval`, and once more on
/// shutdown.
pub struct RemoteForwarder {
    task: JoinHandle<()>,
}

impl RemoteForwarder {
    pub fn start(registry: Arc<Registry>, interval: Duration, shutdown: &watch::Receiver<bool>) -> Self {
        Self {
            task: tokio::spawn(forward(registry, interval, shutdown.clone())),
        }
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Remote forwarder task failed: {}", e);
        }
    }
}

async fn forward(registry: Arc<Registry>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let forwarded = registry.forward_staged().await;
                if forwarded > 0 {
                    debug!(forwarded, "Forwarded staged records");
                }
            }
        }
    }

    let forwarded = registry.forward_staged().await;
    debug!(forwarded, "Remote forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{RemoteSender, Role, WorkerRef, WorkerSelector};
    use crate::core::Result;
    use crate::metrics::catalog::service;
    use crate::metrics::{DownSampling, RemoteMessage};
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct CountingSender {
        sent: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl RemoteSender for CountingSender {
        async fn send(&self, _address: SocketAddr, _message: RemoteMessage) -> Result<()> {
            *self.sent.lock() += 1;
            Ok(())
        }
    }

    fn registry(sender: &Arc<CountingSender>) -> Arc<Registry> {
        let role = Role::new(service::NAME, DownSampling::Minute, WorkerSelector::HashCode);
        let address: SocketAddr = "10.0.0.2:11800".parse().unwrap();
        Arc::new(
            Registry::builder()
                .role(role, vec![WorkerRef::Remote { address, instance: 0 }])
                .unwrap()
                .remote_sender(Arc::clone(sender) as Arc<dyn RemoteSender>)
                .build(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_on_tick() {
        let sender = Arc::new(CountingSender::default());
        let registry = registry(&sender);
        let (stop, shutdown) = watch::channel(false);
        let forwarder = RemoteForwarder::start(Arc::clone(&registry), Duration::from_millis(100), &shutdown);

        let metric = service::define().build("a", 202401010930);
        registry.dispatch("service_metric.minute", metric).await.unwrap();
        assert_eq!(*sender.sent.lock(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*sender.sent.lock(), 1);
        assert_eq!(registry.staged(), 0);

        stop.send(true).unwrap();
        forwarder.join().await;
    }

    #[tokio::test]
    async fn test_forwards_remaining_records_on_shutdown() {
        let sender = Arc::new(CountingSender::default());
        let registry = registry(&sender);
        let (stop, shutdown) = watch::channel(false);
        let forwarder = RemoteForwarder::start(Arc::clone(&registry), Duration::from_secs(3600), &shutdown);

        for entity in ["a", "b", "c"] {
            let metric = service::define().build(entity, 202401010930);
            registry.dispatch("service_metric.minute", metric).await.unwrap();
        }

        stop.send(true).unwrap();
        forwarder.join().await;
        assert_eq!(*sender.sent.lock(), 3);
    }
}
