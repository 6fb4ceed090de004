use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use shared::types::ServiceIdentity;
use crate::rpc::{JsonRpcProxy, RemoteServiceProxy};

/// Portal appearance and disappearance, as seen on the network.
pub enum DiscoveryEvent {
    Added {
        identity: ServiceIdentity,
        address: String,
        proxy: Arc<dyn RemoteServiceProxy>,
    },
    Removed(ServiceIdentity),
}

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of its receiver so it can be pushed back after
/// every event.
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

/// Browse every configured service type and forward portal events until cancelled.
pub async fn run_browser(
    daemon: ServiceDaemon,
    service_types: Vec<String>,
    tx: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();
    for (idx, service_type) in service_types.iter().enumerate() {
        let receiver = daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;
        tracing::info!("Browsing for {}", service_type);
        type_futures.push(make_recv_future(idx, receiver));
    }

    loop {
        tokio::select! {
            Some((idx, rx, result)) = type_futures.next() => {
                match result {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some(event) = convert_service_info(&info) {
                            if let Err(e) = tx.send(event).await {
                                tracing::error!("Failed to send discovery event: {}", e);
                            }
                        }
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                        tracing::info!("Portal removed: {}", fullname);
                        if let Err(e) = tx.send(DiscoveryEvent::Removed(ServiceIdentity::new(fullname))).await {
                            tracing::error!("Failed to send discovery event: {}", e);
                        }
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Ok(_) => {
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Err(e) => {
                        tracing::warn!("Browser for {} disconnected: {}", service_types[idx], e);
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    for service_type in &service_types {
        if let Err(e) = daemon.stop_browse(service_type) {
            tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
        }
    }
    Ok(())
}

fn convert_service_info(info: &ServiceInfo) -> Option<DiscoveryEvent> {
    let Some(address) = endpoint_for(info.get_addresses().iter().copied(), info.get_port()) else {
        tracing::debug!("Skipping portal {} - no addresses", info.get_fullname());
        return None;
    };

    tracing::info!("Portal resolved: {} at {}", info.get_fullname(), address);
    Some(DiscoveryEvent::Added {
        identity: ServiceIdentity::new(info.get_fullname()),
        proxy: Arc::new(JsonRpcProxy::new(address.clone())),
        address,
    })
}

/// Socket address to dial, preferring IPv4 and the lowest address so the
/// choice is stable across re-resolves.
fn endpoint_for(addresses: impl Iterator<Item = IpAddr>, port: u16) -> Option<String> {
    addresses
        .min_by_key(|ip| (ip.is_ipv6(), *ip))
        .map(|ip| SocketAddr::new(ip, port).to_string())
}
