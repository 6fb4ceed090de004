use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::ServiceIdentity;
use crate::record::{RecordSettings, RemoteRecord};
use crate::rpc::RemoteServiceProxy;
pub use crate::mdns::browser::DiscoveryEvent;

/// Immutable, insertion-ordered view of the registered records.
pub type Snapshot = Arc<[Arc<RemoteRecord>]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(ServiceIdentity),
    Removed(ServiceIdentity),
}

/// Commands sent to the registry task
enum RegistryCommand {
    Add {
        identity: ServiceIdentity,
        address: String,
        proxy: Arc<dyn RemoteServiceProxy>,
        reply: oneshot::Sender<bool>,
    },
    Remove(ServiceIdentity, oneshot::Sender<bool>),
    Dispose(oneshot::Sender<()>),
}

/// Handle to the registry task. The task is the only writer; readers use
/// the published snapshot.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
    snapshot: watch::Receiver<Snapshot>,
    events: broadcast::Sender<RegistryEvent>,
    stopped: CancellationToken,
}

impl RegistryHandle {
    pub fn spawn(settings: RecordSettings) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);
        let (snapshot_tx, snapshot) = watch::channel::<Snapshot>(Arc::from(Vec::new()));
        let (events, _) = broadcast::channel(256);
        let stopped = CancellationToken::new();

        let task_events = events.clone();
        let task_stopped = stopped.clone();
        tokio::spawn(async move {
            let mut records: Vec<Arc<RemoteRecord>> = Vec::new();
            let publish = |records: &[Arc<RemoteRecord>]| {
                snapshot_tx.send_replace(Arc::from(records.to_vec()));
            };

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    RegistryCommand::Add { identity, address, proxy, reply } => {
                        // mDNS re-resolves the same portal repeatedly
                        if records.iter().any(|r| *r.identity() == identity) {
                            let _ = reply.send(false);
                            continue;
                        }
                        tracing::info!("Registered portal {} at {}", identity, address);
                        records.push(Arc::new(RemoteRecord::new(identity.clone(), address, proxy, settings)));
                        publish(&records);
                        let _ = task_events.send(RegistryEvent::Added(identity));
                        let _ = reply.send(true);
                    }
                    RegistryCommand::Remove(identity, reply) => {
                        let Some(position) = records.iter().position(|r| *r.identity() == identity) else {
                            let _ = reply.send(false);
                            continue;
                        };
                        let record = records.remove(position);
                        publish(&records);
                        record.dispose();
                        tracing::info!("Unregistered portal {}", identity);
                        let _ = task_events.send(RegistryEvent::Removed(identity));
                        let _ = reply.send(true);
                    }
                    RegistryCommand::Dispose(reply) => {
                        for record in records.drain(..) {
                            record.dispose();
                        }
                        publish(&records);
                        tracing::info!("Registry shutting down");
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            task_stopped.cancel();
        });

        Self { tx, snapshot, events, stopped }
    }

    /// Register a portal. Returns false when the identity is already known.
    /// The record is in the snapshot by the time this returns.
    pub async fn add(
        &self,
        identity: ServiceIdentity,
        address: String,
        proxy: Arc<dyn RemoteServiceProxy>,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Add { identity, address, proxy, reply })
            .await?;
        Ok(rx.await?)
    }

    /// Unregister and dispose a portal. Returns false when it was not registered.
    pub async fn remove(&self, identity: ServiceIdentity) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Remove(identity, reply)).await?;
        Ok(rx.await?)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn find(&self, identity: &ServiceIdentity) -> Option<Arc<RemoteRecord>> {
        self.snapshot.borrow().iter().find(|r| r.identity() == identity).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Feed discovery events into the registry until `cancel` fires or the
    /// registry is disposed.
    pub fn start_discovery(
        &self,
        mut events: mpsc::Receiver<DiscoveryEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = events.recv() => {
                        let outcome = match event {
                            DiscoveryEvent::Added { identity, address, proxy } => {
                                registry.add(identity, address, proxy).await.map(drop)
                            }
                            DiscoveryEvent::Removed(identity) => {
                                registry.remove(identity).await.map(drop)
                            }
                        };
                        if let Err(e) = outcome {
                            tracing::error!("Failed to apply discovery event: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => break,
                    _ = registry.stopped.cancelled() => break,
                }
            }
            tracing::info!("Discovery stopped");
        })
    }

    /// Dispose every record and stop the registry task. Later calls are no-ops.
    pub async fn dispose(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RegistryCommand::Dispose(reply)).await.is_err() {
            return Ok(());
        }
        rx.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProxy;

    fn portal() -> Arc<dyn RemoteServiceProxy> {
        ScriptedProxy::new(&["Ring1"])
    }

    fn names(snapshot: &Snapshot) -> Vec<&str> {
        snapshot.iter().map(|r| r.identity().as_str()).collect()
    }

    #[tokio::test]
    async fn test_add_is_visible_on_return() {
        let registry = RegistryHandle::spawn(RecordSettings::default());

        assert!(registry.add("a".into(), "10.0.0.1:9400".into(), portal()).await.unwrap());
        assert_eq!(names(&registry.snapshot()), vec!["a"]);
        assert!(registry.find(&"a".into()).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_and_removes() {
        let registry = RegistryHandle::spawn(RecordSettings::default());
        for i in 0..8 {
            let id = format!("old-{i}");
            registry.add(id.as_str().into(), "10.0.1.1:9400".into(), portal()).await.unwrap();
        }

        let done = CancellationToken::new();
        let reader = {
            let registry = registry.clone();
            let done = done.clone();
            tokio::spawn(async move {
                while !done.is_cancelled() {
                    let snapshot = registry.snapshot();
                    let unique: std::collections::HashSet<&str> = names(&snapshot).into_iter().collect();
                    assert_eq!(unique.len(), snapshot.len(), "Identities are unique in every snapshot");
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut writers = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            writers.push(tokio::spawn(async move {
                let id = format!("new-{i}");
                registry.add(id.as_str().into(), "10.0.2.1:9400".into(), portal()).await.unwrap();
                assert!(registry.find(&id.as_str().into()).is_some(), "Add is visible on return");
                assert!(names(&registry.snapshot()).contains(&id.as_str()));

                let old = format!("old-{i}");
                registry.remove(old.as_str().into()).await.unwrap();
                assert!(registry.find(&old.as_str().into()).is_none(), "Remove is visible on return");
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }
        done.cancel();
        reader.await.unwrap();

        let mut present = names(&registry.snapshot())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        present.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("new-{i}")).collect();
        assert_eq!(present, expected);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_ignored() {
        let registry = RegistryHandle::spawn(RecordSettings::default());

        registry.add("a".into(), "10.0.0.1:9400".into(), portal()).await.unwrap();
        registry.add("b".into(), "10.0.0.2:9400".into(), portal()).await.unwrap();
        let first = registry.find(&"a".into()).unwrap();

        assert!(!registry.add("a".into(), "10.0.0.9:9400".into(), portal()).await.unwrap());
        assert_eq!(names(&registry.snapshot()), vec!["a", "b"]);
        let kept = registry.find(&"a".into()).unwrap();
        assert!(Arc::ptr_eq(&first, &kept), "Existing record must survive re-resolution");
        assert_eq!(kept.status().address, "10.0.0.1:9400");
    }

    #[tokio::test]
    async fn test_snapshot_is_immutable() {
        let registry = RegistryHandle::spawn(RecordSettings::default());
        registry.add("a".into(), "10.0.0.1:9400".into(), portal()).await.unwrap();

        let before = registry.snapshot();
        assert!(registry.remove("a".into()).await.unwrap());

        assert_eq!(names(&before), vec!["a"]);
        assert!(registry.snapshot().is_empty());
        assert!(!registry.remove("a".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_discovery_events_drive_registry() {
        let registry = RegistryHandle::spawn(RecordSettings::default());
        let mut changes = registry.subscribe();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let discovery = registry.start_discovery(rx, cancel.clone());

        tx.send(DiscoveryEvent::Added {
            identity: "a".into(),
            address: "10.0.0.1:9400".into(),
            proxy: portal(),
        })
        .await
        .unwrap();
        assert_eq!(changes.recv().await.unwrap(), RegistryEvent::Added("a".into()));

        tx.send(DiscoveryEvent::Removed("a".into())).await.unwrap();
        assert_eq!(changes.recv().await.unwrap(), RegistryEvent::Removed("a".into()));
        assert!(registry.snapshot().is_empty());

        cancel.cancel();
        discovery.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_empties_and_stops() {
        let registry = RegistryHandle::spawn(RecordSettings::default());
        let (_tx, rx) = mpsc::channel(8);
        let discovery = registry.start_discovery(rx, CancellationToken::new());
        registry.add("a".into(), "10.0.0.1:9400".into(), portal()).await.unwrap();

        registry.dispose().await.unwrap();
        assert!(registry.snapshot().is_empty());
        discovery.await.unwrap();

        assert!(registry.add("b".into(), "10.0.0.2:9400".into(), portal()).await.is_err());
        registry.dispose().await.unwrap();
    }
}
