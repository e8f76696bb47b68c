//! The search orchestrator
//!
//! A single task owns every piece of search state. Public calls, provider
//! callbacks and the completions of descriptor fetches and liveness probes
//! all arrive as [`Command`]s on one queue and are applied in order, so the
//! found/lost pipelines never race with each other or with start/stop.
//! Network I/O runs on separate tasks whose results are queued back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use shared::protocol::{DESCRIPTOR_TIMEOUT, PROBE_TIMEOUT};
use shared::types::{canonical_uri, Descriptor, DiscoveryKind, ServiceRecord, ServiceRef};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use crate::descriptor::{DescriptorFetcher, HttpDescriptorFetcher};
use crate::error::{Result, SearchError};
use crate::events::{EventBus, SearchEvent, Subscription, SubscriptionHandle, Topic};
use crate::hash;
use crate::provider::{
    DiscoveryProvider, ProviderContext, ProviderEvent, ProviderEvents, ProviderFactory, StopReason,
};

/// Timeouts applied by the orchestrator to external calls
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub descriptor_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            descriptor_timeout: DESCRIPTOR_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

/// Commands processed by the search task
enum Command {
    Start,
    Stop,
    GetServices(oneshot::Sender<Vec<ServiceRecord>>),
    IsSearching(oneshot::Sender<bool>),
    Provider(usize, ProviderEvent),
    Resolved {
        uri: String,
        sighting: ServiceRef,
        result: Result<Descriptor>,
    },
    Probed {
        record: ServiceRecord,
        session: u64,
        alive: bool,
    },
    Shutdown,
}

/// Assembles a [`ServiceSearch`] from provider factories.
pub struct ServiceSearchBuilder {
    target_id: Option<String>,
    config: SearchConfig,
    fetcher: Option<Arc<dyn DescriptorFetcher>>,
    factories: Vec<ProviderFactory>,
    delivery: Option<Handle>,
}

impl ServiceSearchBuilder {
    fn new() -> Self {
        Self {
            target_id: None,
            config: SearchConfig::default(),
            fetcher: None,
            factories: Vec::new(),
            delivery: None,
        }
    }

    /// Narrow the search to one known service id.
    pub fn target_id(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`HttpDescriptorFetcher`].
    pub fn fetcher(mut self, fetcher: Arc<dyn DescriptorFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn provider<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(ProviderContext) -> Box<dyn DiscoveryProvider> + Send + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    /// Runtime that `on(...)` callbacks run on. Defaults to the runtime
    /// `spawn` is called from.
    pub fn delivery(mut self, handle: Handle) -> Self {
        self.delivery = Some(handle);
        self
    }

    /// Builds the providers and spawns the search task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> ServiceSearch {
        let (tx, rx) = mpsc::unbounded_channel::<Command>();

        let providers: Vec<Box<dyn DiscoveryProvider>> = self
            .factories
            .into_iter()
            .enumerate()
            .map(|(index, factory)| {
                let provider_tx = tx.clone();
                let events = ProviderEvents::new(move |event| {
                    let _ = provider_tx.send(Command::Provider(index, event));
                });
                factory(ProviderContext {
                    events,
                    target_id: self.target_id.clone(),
                })
            })
            .collect();

        let bus = EventBus::new(self.delivery.unwrap_or_else(Handle::current));
        let (fingerprint_tx, fingerprint_rx) = watch::channel(hash::compute_hash(&[]));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpDescriptorFetcher::new()));

        tracing::info!(
            providers = providers.len(),
            target_id = self.target_id.as_deref().unwrap_or("-"),
            "Service search created"
        );

        let state = SearchState {
            providers,
            unresolved: HashSet::new(),
            resolved: HashSet::new(),
            cache: Vec::new(),
            started: false,
            stop_requested: false,
            session: 0,
            config: self.config,
            fetcher,
            tx: tx.clone(),
            bus: bus.clone(),
            fingerprint_tx,
        };
        tokio::spawn(run(state, rx));

        ServiceSearch {
            tx,
            bus,
            fingerprint_rx,
        }
    }

    /// Runs a narrowed search until `id` is found, the search stops, or
    /// `within` elapses. The search is shut down afterwards.
    pub async fn find_by_id(self, id: impl Into<String>, within: Duration) -> Result<ServiceRecord> {
        let id = id.into();
        let search = self.target_id(id.clone()).spawn();
        let mut events = search.subscribe(&[Topic::ServiceFound, Topic::Stopped]);
        search.start()?;

        let outcome = tokio::time::timeout(within, async {
            while let Some(event) = events.recv().await {
                match event {
                    SearchEvent::ServiceFound(record) if record.id == id => return Some(record),
                    SearchEvent::Stopped => return None,
                    _ => {}
                }
            }
            None
        })
        .await;

        search.unsubscribe(events.handle());
        let _ = search.stop();
        let _ = search.shutdown();

        match outcome {
            Ok(Some(record)) => Ok(record),
            _ => Err(SearchError::NotFound(id)),
        }
    }
}

/// Handle to a running search
#[derive(Clone)]
pub struct ServiceSearch {
    tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    fingerprint_rx: watch::Receiver<String>,
}

impl ServiceSearch {
    pub fn builder() -> ServiceSearchBuilder {
        ServiceSearchBuilder::new()
    }

    /// Start every provider that is not already searching
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Stop all providers and forget every known service
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Current services, in the order they were found
    pub async fn services(&self) -> Result<Vec<ServiceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetServices(reply))?;
        rx.await.map_err(|_| SearchError::Closed)
    }

    /// True while any provider is searching
    pub async fn is_searching(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::IsSearching(reply))?;
        rx.await.map_err(|_| SearchError::Closed)
    }

    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.bus.subscribe(topics)
    }

    pub fn on<F>(&self, topic: Topic, callback: F) -> SubscriptionHandle
    where
        F: FnMut(SearchEvent) + Send + 'static,
    {
        self.bus.on(topic, callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    /// Fingerprint of the cached services, updated on every change
    pub fn fingerprint(&self) -> watch::Receiver<String> {
        self.fingerprint_rx.clone()
    }

    /// Stop the providers and end the search task
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| SearchError::Closed)
    }
}

struct SearchState {
    providers: Vec<Box<dyn DiscoveryProvider>>,
    /// Canonical URIs with a descriptor fetch in flight
    unresolved: HashSet<String>,
    /// Canonical URIs of cached records
    resolved: HashSet<String>,
    cache: Vec<ServiceRecord>,
    started: bool,
    stop_requested: bool,
    /// Bumped on every flush; probes from an earlier session are ignored
    session: u64,
    config: SearchConfig,
    fetcher: Arc<dyn DescriptorFetcher>,
    tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    fingerprint_tx: watch::Sender<String>,
}

/// Search event loop
async fn run(mut state: SearchState, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Start => state.start(),
            Command::Stop => state.stop(),
            Command::GetServices(reply) => {
                let _ = reply.send(state.cache.clone());
            }
            Command::IsSearching(reply) => {
                let _ = reply.send(state.is_searching());
            }
            Command::Provider(index, event) => state.on_provider_event(index, event),
            Command::Resolved {
                uri,
                sighting,
                result,
            } => state.on_resolved(uri, sighting, result),
            Command::Probed {
                record,
                session,
                alive,
            } => state.on_probed(record, session, alive),
            Command::Shutdown => {
                for provider in state.providers.iter().filter(|p| p.is_searching()) {
                    provider.stop();
                }
                tracing::info!("Service search shutting down");
                break;
            }
        }
    }
}

impl SearchState {
    fn is_searching(&self) -> bool {
        self.providers.iter().any(|p| p.is_searching())
    }

    fn start(&mut self) {
        self.stop_requested = false;
        for provider in self.providers.iter().filter(|p| !p.is_searching()) {
            provider.search();
        }
    }

    fn stop(&mut self) {
        self.stop_requested = true;
        self.flush();

        let mut stopping = false;
        for provider in self.providers.iter().filter(|p| p.is_searching()) {
            provider.stop();
            stopping = true;
        }

        // Nobody left to report back
        if !stopping && self.started {
            self.started = false;
            self.bus.publish(SearchEvent::Stopped);
        }
    }

    fn on_provider_event(&mut self, index: usize, event: ProviderEvent) {
        match event {
            ProviderEvent::Started => self.on_provider_started(index),
            ProviderEvent::Stopped(reason) => self.on_provider_stopped(index, reason),
            ProviderEvent::Found(sighting) => self.on_found(sighting),
            ProviderEvent::Lost { service_id, kind } => self.on_lost(&service_id, kind),
        }
    }

    fn on_provider_started(&mut self, index: usize) {
        if self.stop_requested {
            tracing::debug!(provider = index, "Provider started after stop was requested");
            return;
        }
        if !self.started {
            self.started = true;
            tracing::info!("Search started");
            self.bus.publish(SearchEvent::Started);
        }
    }

    fn on_provider_stopped(&mut self, index: usize, reason: StopReason) {
        let Some(kind) = self.providers.get(index).map(|p| p.kind()) else {
            return;
        };
        tracing::debug!(provider = index, %kind, ?reason, "Provider stopped");

        // Results from a dead backend must not linger
        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.id.clone())
            .collect();
        for id in stale {
            self.on_lost(&id, kind);
        }

        if self.is_searching() {
            return;
        }

        if self.started {
            self.started = false;
            self.flush();
            tracing::info!("Search stopped");
            self.bus.publish(SearchEvent::Stopped);
        }

        if !self.stop_requested && reason == StopReason::Failure {
            tracing::info!("Restarting search after provider failure");
            for provider in self.providers.iter().filter(|p| !p.is_searching()) {
                provider.search();
            }
        }
    }

    fn on_found(&mut self, sighting: ServiceRef) {
        if self.stop_requested {
            return;
        }

        let uri = canonical_uri(&sighting.endpoint_uri);
        if self.resolved.contains(&uri) || self.unresolved.contains(&uri) {
            tracing::debug!(uri, "Ignoring known service");
            return;
        }

        tracing::debug!(uri, id = sighting.service_id, kind = %sighting.kind, "Resolving service");
        self.unresolved.insert(uri.clone());

        let fetcher = self.fetcher.clone();
        let timeout = self.config.descriptor_timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = fetch_with_timeout(fetcher.as_ref(), &uri, timeout).await;
            let _ = tx.send(Command::Resolved {
                uri,
                sighting,
                result,
            });
        });
    }

    fn on_resolved(&mut self, uri: String, sighting: ServiceRef, result: Result<Descriptor>) {
        // Flushed by stop() while the fetch was in flight
        if !self.unresolved.remove(&uri) {
            tracing::debug!(uri, "Discarding stale resolution");
            return;
        }

        match result {
            Ok(descriptor) => {
                let record = ServiceRecord::from_descriptor(&uri, sighting.kind, descriptor);
                if self.cache.contains(&record) {
                    tracing::debug!(uri, id = record.id, "Service already cached");
                    return;
                }

                tracing::info!(id = record.id, name = record.name, uri, kind = %record.kind, "Service found");
                self.resolved.insert(uri);
                self.cache.push(record.clone());
                self.publish_fingerprint();
                self.bus.publish(SearchEvent::ServiceFound(record));
            }
            Err(e) => {
                tracing::warn!(uri, id = sighting.service_id, error = %e, "Failed to resolve service");
                for provider in self.providers.iter().filter(|p| p.is_searching()) {
                    provider.report_resolution_failure(&sighting.service_id, sighting.kind);
                }
            }
        }
    }

    fn on_lost(&mut self, service_id: &str, kind: DiscoveryKind) {
        let Some(record) = self
            .cache
            .iter()
            .find(|r| r.same_service(service_id, kind))
            .cloned()
        else {
            return;
        };

        match kind {
            DiscoveryKind::Cloud => self.remove_record(&record),
            DiscoveryKind::Lan => {
                // Advertisements blink; only a failed probe counts as a loss
                tracing::debug!(id = record.id, uri = record.uri, "Probing possibly lost service");
                let fetcher = self.fetcher.clone();
                let timeout = self.config.probe_timeout;
                let tx = self.tx.clone();
                let session = self.session;
                tokio::spawn(async move {
                    let alive = fetch_with_timeout(fetcher.as_ref(), &record.uri, timeout)
                        .await
                        .is_ok();
                    let _ = tx.send(Command::Probed {
                        record,
                        session,
                        alive,
                    });
                });
            }
        }
    }

    fn on_probed(&mut self, record: ServiceRecord, session: u64, alive: bool) {
        if session != self.session {
            tracing::debug!(id = record.id, "Discarding probe from an earlier session");
            return;
        }
        if alive {
            tracing::debug!(id = record.id, "Service still reachable");
            return;
        }
        self.remove_record(&record);
    }

    fn remove_record(&mut self, record: &ServiceRecord) {
        let Some(pos) = self
            .cache
            .iter()
            .position(|r| r == record && r.uri == record.uri)
        else {
            return;
        };

        let removed = self.cache.remove(pos);
        self.resolved.remove(&removed.uri);
        tracing::info!(id = removed.id, uri = removed.uri, kind = %removed.kind, "Service lost");
        self.publish_fingerprint();
        self.bus.publish(SearchEvent::ServiceLost(removed));
    }

    fn flush(&mut self) {
        self.session += 1;
        self.unresolved.clear();
        self.resolved.clear();
        if !self.cache.is_empty() {
            self.cache.clear();
            self.publish_fingerprint();
        }
    }

    fn publish_fingerprint(&self) {
        let _ = self.fingerprint_tx.send(hash::compute_hash(&self.cache));
    }
}

async fn fetch_with_timeout(
    fetcher: &dyn DescriptorFetcher,
    uri: &str,
    timeout: Duration,
) -> Result<Descriptor> {
    match tokio::time::timeout(timeout, fetcher.fetch(uri, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(SearchError::Timeout(timeout)),
    }
}
