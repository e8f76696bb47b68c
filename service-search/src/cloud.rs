//! Discovery through a cloud directory of registered services
//!
//! The directory is polled on an interval; the provider diffs each listing
//! against the previous one and reports ids that appeared or vanished.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use shared::types::DiscoveryKind;
use tokio_util::sync::CancellationToken;
use crate::error::{Result, SearchError};
use crate::provider::{DiscoveryProvider, ProviderContext, ProviderEvents, StopReason};

/// One service registered with the directory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub uri: String,
}

#[async_trait]
pub trait CloudDirectory: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<DirectoryEntry>>;
}

/// Directory answering `GET <url>` with a JSON array of entries
#[derive(Clone)]
pub struct HttpCloudDirectory {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpCloudDirectory {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CloudDirectory for HttpCloudDirectory {
    async fn list(&self) -> Result<Vec<DirectoryEntry>> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SearchError::from_reqwest(&self.url, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::HttpStatus {
                uri: self.url.clone(),
                status: status.as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| SearchError::from_reqwest(&self.url, self.timeout, e))
    }
}

#[derive(Debug, Clone)]
pub struct CloudProviderConfig {
    pub poll_interval: Duration,
}

impl Default for CloudProviderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Reports services registered in a cloud directory.
pub struct CloudDiscoveryProvider<D: CloudDirectory> {
    inner: Arc<Inner<D>>,
}

struct Inner<D> {
    directory: Arc<D>,
    events: ProviderEvents,
    target_id: Option<String>,
    config: CloudProviderConfig,
    searching: AtomicBool,
    generation: AtomicU64,
    cancel: Mutex<CancellationToken>,
    /// id -> uri as of the last listing
    known: DashMap<String, String>,
}

impl<D: CloudDirectory> CloudDiscoveryProvider<D> {
    pub fn new(directory: Arc<D>, config: CloudProviderConfig, ctx: ProviderContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                directory,
                events: ctx.events,
                target_id: ctx.target_id,
                config,
                searching: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                cancel: Mutex::new(CancellationToken::new()),
                known: DashMap::new(),
            }),
        }
    }

    pub fn factory(
        directory: Arc<D>,
        config: CloudProviderConfig,
    ) -> impl FnOnce(ProviderContext) -> Box<dyn DiscoveryProvider> + Send + 'static {
        move |ctx: ProviderContext| -> Box<dyn DiscoveryProvider> {
            Box::new(Self::new(directory, config, ctx))
        }
    }
}

impl<D: CloudDirectory> DiscoveryProvider for CloudDiscoveryProvider<D> {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Cloud
    }

    fn search(&self) {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        std::mem::replace(&mut *inner.lock_cancel(), cancel.clone()).cancel();

        inner.searching.store(true, Ordering::SeqCst);
        inner.known.clear();

        tokio::spawn(poll_loop(inner.clone(), generation, cancel));
    }

    fn stop(&self) {
        let inner = &self.inner;
        if inner.searching.swap(false, Ordering::SeqCst) {
            inner.lock_cancel().cancel();
        } else {
            inner.generation.fetch_add(1, Ordering::SeqCst);
            inner.lock_cancel().cancel();
            inner.known.clear();
            inner.events.stopped(StopReason::Requested);
        }
    }

    fn is_searching(&self) -> bool {
        self.inner.searching.load(Ordering::SeqCst)
    }

    fn report_resolution_failure(&self, service_id: &str, kind: DiscoveryKind) {
        if kind == DiscoveryKind::Cloud {
            // Forget it so the next listing reports it again
            self.inner.known.remove(service_id);
        }
    }
}

impl<D: CloudDirectory> Inner<D> {
    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn poll(&self, generation: u64) {
        let entries = match self.directory.list().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Cloud directory poll failed");
                return;
            }
        };
        if !self.is_current(generation) {
            return;
        }

        let entries: Vec<DirectoryEntry> = entries
            .into_iter()
            .filter(|e| self.target_id.as_ref().map_or(true, |id| &e.id == id))
            .collect();
        let listed: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();

        let vanished: Vec<String> = self
            .known
            .iter()
            .filter(|entry| !listed.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in vanished {
            self.known.remove(&id);
            tracing::debug!(id, "Service left cloud directory");
            self.events.lost(id, DiscoveryKind::Cloud);
        }

        for entry in entries {
            let changed = self
                .known
                .get(&entry.id)
                .map_or(true, |uri| *uri != entry.uri);
            if changed {
                self.known.insert(entry.id.clone(), entry.uri.clone());
                self.events.found(entry.id, entry.uri, DiscoveryKind::Cloud);
            }
        }
    }
}

async fn poll_loop<D: CloudDirectory>(inner: Arc<Inner<D>>, generation: u64, cancel: CancellationToken) {
    tracing::info!(interval = ?inner.config.poll_interval, "Polling cloud directory");
    inner.events.started();

    let mut interval = tokio::time::interval(inner.config.poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                tokio::select! {
                    _ = inner.poll(generation) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    if inner.is_current(generation) {
        inner.known.clear();
        inner.events.stopped(StopReason::Requested);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use crate::provider::ProviderEvent;

    /// Serves scripted listings, then keeps repeating the last one.
    #[derive(Default)]
    struct FakeDirectory {
        script: Mutex<VecDeque<Result<Vec<DirectoryEntry>>>>,
        last: Mutex<Vec<DirectoryEntry>>,
    }

    impl FakeDirectory {
        fn push(&self, listing: Result<Vec<DirectoryEntry>>) {
            self.script.lock().unwrap().push_back(listing);
        }
    }

    #[async_trait]
    impl CloudDirectory for FakeDirectory {
        async fn list(&self) -> Result<Vec<DirectoryEntry>> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(listing)) => {
                    *self.last.lock().unwrap() = listing.clone();
                    Ok(listing)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    fn entry(id: &str) -> DirectoryEntry {
        DirectoryEntry {
            id: id.to_string(),
            uri: format!("https://cloud.example/{}/api/v2/", id),
        }
    }

    fn found(id: &str) -> ProviderEvent {
        ProviderEvent::Found(shared::types::ServiceRef {
            service_id: id.to_string(),
            endpoint_uri: format!("https://cloud.example/{}/api/v2/", id),
            kind: DiscoveryKind::Cloud,
        })
    }

    fn lost(id: &str) -> ProviderEvent {
        ProviderEvent::Lost {
            service_id: id.to_string(),
            kind: DiscoveryKind::Cloud,
        }
    }

    fn provider(
        directory: &Arc<FakeDirectory>,
        target_id: Option<&str>,
    ) -> (CloudDiscoveryProvider<FakeDirectory>, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (events, rx) = ProviderEvents::channel();
        let config = CloudProviderConfig {
            poll_interval: Duration::from_millis(20),
        };
        let ctx = ProviderContext {
            events,
            target_id: target_id.map(str::to_string),
        };
        (CloudDiscoveryProvider::new(directory.clone(), config, ctx), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ProviderEvent>) -> ProviderEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for provider event")
            .expect("provider event channel closed")
    }

    #[tokio::test]
    async fn test_listing_changes_become_found_and_lost() {
        let directory = Arc::new(FakeDirectory::default());
        directory.push(Ok(vec![entry("a"), entry("b")]));
        directory.push(Ok(vec![entry("b")]));
        let (provider, mut rx) = provider(&directory, None);

        provider.search();
        assert!(provider.is_searching());
        assert_eq!(next(&mut rx).await, ProviderEvent::Started);
        assert_eq!(next(&mut rx).await, found("a"));
        assert_eq!(next(&mut rx).await, found("b"));
        assert_eq!(next(&mut rx).await, lost("a"));

        // Unchanged listings report nothing
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_target_id_filters_listing() {
        let directory = Arc::new(FakeDirectory::default());
        directory.push(Ok(vec![entry("a"), entry("tv-42")]));
        let (provider, mut rx) = provider(&directory, Some("tv-42"));

        provider.search();
        assert_eq!(next(&mut rx).await, ProviderEvent::Started);
        assert_eq!(next(&mut rx).await, found("tv-42"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolution_failure_rereports() {
        let directory = Arc::new(FakeDirectory::default());
        directory.push(Ok(vec![entry("a")]));
        let (provider, mut rx) = provider(&directory, None);

        provider.search();
        assert_eq!(next(&mut rx).await, ProviderEvent::Started);
        assert_eq!(next(&mut rx).await, found("a"));

        provider.report_resolution_failure("a", DiscoveryKind::Cloud);
        assert_eq!(next(&mut rx).await, found("a"));
    }

    #[tokio::test]
    async fn test_poll_error_keeps_known_services() {
        let directory = Arc::new(FakeDirectory::default());
        directory.push(Ok(vec![entry("a")]));
        directory.push(Err(SearchError::Timeout(Duration::from_secs(5))));
        directory.push(Ok(vec![entry("a"), entry("b")]));
        let (provider, mut rx) = provider(&directory, None);

        provider.search();
        assert_eq!(next(&mut rx).await, ProviderEvent::Started);
        assert_eq!(next(&mut rx).await, found("a"));
        assert_eq!(next(&mut rx).await, found("b"));
    }

    #[tokio::test]
    async fn test_stop_reports_once() {
        let directory = Arc::new(FakeDirectory::default());
        let (provider, mut rx) = provider(&directory, None);

        provider.search();
        assert_eq!(next(&mut rx).await, ProviderEvent::Started);
        provider.stop();
        assert!(!provider.is_searching());
        assert_eq!(next(&mut rx).await, ProviderEvent::Stopped(StopReason::Requested));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
