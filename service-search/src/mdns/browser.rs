use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use crate::error::{Result, SearchError};

/// What a browse reports about advertised instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Found(String),
    Removed(String),
}

/// Addresses and raw TXT metadata of a resolved instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedService {
    pub addresses: Vec<IpAddr>,
    pub txt: HashMap<String, Vec<u8>>,
}

/// Local-network service browsing and resolution.
///
/// Instance names are reported without the service type suffix.
#[async_trait]
pub trait ServiceBrowser: Send + Sync + 'static {
    /// Starts browsing. The returned channel closes when the browse ends,
    /// whether through `stop_browse` or a failure.
    fn browse(&self, service_type: &str) -> Result<flume::Receiver<BrowseEvent>>;

    fn stop_browse(&self, service_type: &str);

    async fn resolve(
        &self,
        service_type: &str,
        instance: &str,
        timeout: Duration,
    ) -> Result<ResolvedService>;
}

/// `ServiceBrowser` on top of an mdns-sd daemon.
///
/// mdns-sd resolves every instance it finds on its own, so resolving here
/// means waiting for the daemon to hand over the record for that instance.
#[derive(Clone)]
pub struct MdnsServiceBrowser {
    daemon: ServiceDaemon,
    /// Resolved records keyed by full instance name
    resolved: Arc<DashMap<String, ResolvedService>>,
    resolved_notify: Arc<Notify>,
    /// One listener task per browsed service type
    listeners: Arc<DashMap<String, CancellationToken>>,
}

impl MdnsServiceBrowser {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self {
            daemon,
            resolved: Arc::new(DashMap::new()),
            resolved_notify: Arc::new(Notify::new()),
            listeners: Arc::new(DashMap::new()),
        }
    }

    fn spawn_listener(
        &self,
        service_type: &str,
        forward: Option<flume::Sender<BrowseEvent>>,
    ) -> Result<()> {
        let receiver = self
            .daemon
            .browse(service_type)
            .map_err(|e| SearchError::Browse {
                service_type: service_type.to_string(),
                reason: e.to_string(),
            })?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.listeners.insert(service_type.to_string(), cancel.clone()) {
            previous.cancel();
        }

        tokio::spawn(listen(
            receiver,
            forward,
            service_type.to_string(),
            self.resolved.clone(),
            self.resolved_notify.clone(),
            cancel,
        ));
        Ok(())
    }
}

#[async_trait]
impl ServiceBrowser for MdnsServiceBrowser {
    fn browse(&self, service_type: &str) -> Result<flume::Receiver<BrowseEvent>> {
        tracing::info!("Browsing for {}", service_type);
        let (tx, rx) = flume::unbounded();
        self.spawn_listener(service_type, Some(tx))?;
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) {
        if let Some((_, cancel)) = self.listeners.remove(service_type) {
            cancel.cancel();
        }
        if let Err(e) = self.daemon.stop_browse(service_type) {
            tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
        }
        self.resolved.retain(|fullname, _| !fullname.ends_with(service_type));
    }

    async fn resolve(
        &self,
        service_type: &str,
        instance: &str,
        timeout: Duration,
    ) -> Result<ResolvedService> {
        // A narrowed search resolves without browsing first
        if !self.listeners.contains_key(service_type) {
            self.spawn_listener(service_type, None)?;
        }

        let fullname = format!("{}.{}", instance, service_type);
        let wait = async {
            loop {
                let notified = self.resolved_notify.notified();
                if let Some(resolved) = self.resolved.get(&fullname) {
                    return resolved.clone();
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SearchError::Resolve {
                instance: instance.to_string(),
                reason: format!("no answer within {:?}", timeout),
            })
    }
}

async fn listen(
    receiver: flume::Receiver<ServiceEvent>,
    forward: Option<flume::Sender<BrowseEvent>>,
    service_type: String,
    resolved: Arc<DashMap<String, ResolvedService>>,
    resolved_notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    let send = |event: BrowseEvent| {
        if let Some(tx) = &forward {
            let _ = tx.send(event);
        }
    };

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceFound(_, fullname)) => {
                        send(BrowseEvent::Found(instance_name(&fullname, &service_type)));
                    }
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        tracing::debug!("Resolved {}", info.get_fullname());
                        resolved.insert(info.get_fullname().to_string(), convert_service_info(&info));
                        resolved_notify.notify_waiters();
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        resolved.remove(&fullname);
                        send(BrowseEvent::Removed(instance_name(&fullname, &service_type)));
                    }
                    Ok(ServiceEvent::SearchStopped(_)) => {
                        tracing::debug!("Browse for {} stopped", service_type);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Browse receiver for {} disconnected: {}", service_type, e);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// "Living Room._samsungmsf._tcp.local." -> "Living Room"
fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(fullname)
        .to_string()
}

fn convert_service_info(info: &ServiceInfo) -> ResolvedService {
    let txt = info
        .get_properties()
        .iter()
        .map(|prop| {
            let value = prop.val().map(<[u8]>::to_vec).unwrap_or_default();
            (prop.key().to_string(), value)
        })
        .collect();

    ResolvedService {
        addresses: info.get_addresses().iter().copied().collect(),
        txt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("tv-42._samsungmsf._tcp.local.", "_samsungmsf._tcp.local."),
            "tv-42"
        );
        assert_eq!(instance_name("odd", "_samsungmsf._tcp.local."), "odd");
    }

    #[test]
    fn test_convert_service_info() {
        let properties = HashMap::from([
            ("se".to_string(), "http://10.0.0.5:8001/api/v2/".to_string()),
            ("id".to_string(), "tv-42".to_string()),
        ]);
        let info = ServiceInfo::new(
            "_samsungmsf._tcp.local.",
            "tv-42",
            "tv.local.",
            "10.0.0.5",
            8001,
            properties,
        )
        .unwrap();

        let resolved = convert_service_info(&info);
        assert_eq!(resolved.addresses, vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolved.txt.get("id").map(Vec::as_slice), Some(b"tv-42".as_slice()));
        assert_eq!(
            resolved.txt.get("se").map(Vec::as_slice),
            Some(b"http://10.0.0.5:8001/api/v2/".as_slice())
        );
    }
}
