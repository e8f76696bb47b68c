use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use dashmap::{DashMap, DashSet};
use shared::protocol::{RESOLVE_RETRY_TIMEOUT, RESOLVE_TIMEOUT, SERVICE_TYPE, TXT_ENDPOINT, TXT_ID};
use shared::types::DiscoveryKind;
use tokio_util::sync::CancellationToken;
use crate::mdns::browser::{BrowseEvent, ResolvedService, ServiceBrowser};
use crate::provider::{DiscoveryProvider, ProviderContext, ProviderEvents, StopReason};

#[derive(Debug, Clone)]
pub struct MdnsProviderConfig {
    pub service_type: String,
    /// First resolve attempt
    pub resolve_timeout: Duration,
    /// The single retry after a failed resolve
    pub retry_timeout: Duration,
    /// Restart the browse when it fails instead of reporting a stop
    pub auto_restart: bool,
    pub restart_delay: Duration,
}

impl Default for MdnsProviderConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            resolve_timeout: RESOLVE_TIMEOUT,
            retry_timeout: RESOLVE_RETRY_TIMEOUT,
            auto_restart: true,
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Discovers services advertised over mDNS on the local network.
pub struct MdnsDiscoveryProvider<B: ServiceBrowser> {
    inner: Arc<Inner<B>>,
}

struct Inner<B> {
    browser: Arc<B>,
    events: ProviderEvents,
    target_id: Option<String>,
    config: MdnsProviderConfig,
    searching: AtomicBool,
    /// Bumped on every search/stop so superseded tasks exit quietly
    generation: AtomicU64,
    cancel: Mutex<CancellationToken>,
    /// Advertised names with a resolve in progress
    in_flight: DashSet<String>,
    /// Advertised name -> service id, for names reported as found
    held: DashMap<String, String>,
    /// Names whose first resolve failed
    retried: DashSet<String>,
}

enum BrowseEnd {
    Cancelled,
    Failed,
}

impl<B: ServiceBrowser> MdnsDiscoveryProvider<B> {
    pub fn new(browser: Arc<B>, config: MdnsProviderConfig, ctx: ProviderContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                browser,
                events: ctx.events,
                target_id: ctx.target_id,
                config,
                searching: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                cancel: Mutex::new(CancellationToken::new()),
                in_flight: DashSet::new(),
                held: DashMap::new(),
                retried: DashSet::new(),
            }),
        }
    }

    /// Provider factory for [`crate::ServiceSearchBuilder::provider`]
    pub fn factory(
        browser: Arc<B>,
        config: MdnsProviderConfig,
    ) -> impl FnOnce(ProviderContext) -> Box<dyn DiscoveryProvider> + Send + 'static {
        move |ctx: ProviderContext| -> Box<dyn DiscoveryProvider> {
            Box::new(Self::new(browser, config, ctx))
        }
    }
}

impl<B: ServiceBrowser> DiscoveryProvider for MdnsDiscoveryProvider<B> {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Lan
    }

    fn search(&self) {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        inner.replace_cancel(cancel.clone()).cancel();

        if inner.searching.swap(true, Ordering::SeqCst) {
            tracing::debug!("Restarting mDNS search");
        }
        inner.clear();

        tokio::spawn(run_search(inner.clone(), generation, cancel));
    }

    fn stop(&self) {
        let inner = &self.inner;
        if inner.searching.swap(false, Ordering::SeqCst) {
            // The search task reports the stop
            inner.lock_cancel().cancel();
        } else {
            inner.generation.fetch_add(1, Ordering::SeqCst);
            inner.lock_cancel().cancel();
            inner.clear();
            inner.events.stopped(StopReason::Requested);
        }
    }

    fn is_searching(&self) -> bool {
        self.inner.searching.load(Ordering::SeqCst)
    }

    fn report_resolution_failure(&self, service_id: &str, kind: DiscoveryKind) {
        if kind != DiscoveryKind::Lan {
            return;
        }
        self.inner.held.retain(|_, id| id != service_id);
    }
}

impl<B: ServiceBrowser> Inner<B> {
    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn replace_cancel(&self, cancel: CancellationToken) -> CancellationToken {
        std::mem::replace(&mut *self.lock_cancel(), cancel)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn clear(&self) {
        self.in_flight.clear();
        self.held.clear();
        self.retried.clear();
    }

    fn finish(&self, generation: u64, reason: StopReason) {
        if !self.is_current(generation) {
            return;
        }
        if reason != StopReason::Requested {
            self.searching.store(false, Ordering::SeqCst);
        }
        self.clear();
        self.events.stopped(reason);
    }

    fn on_resolved(&self, name: &str, resolved: ResolvedService) {
        if self.in_flight.remove(name).is_none() {
            tracing::debug!("{} was removed while resolving", name);
            return;
        }

        if resolved.addresses.is_empty() {
            tracing::debug!("Skipping {} - no addresses", name);
            return;
        }

        let Some((id, endpoint)) = parse_metadata(&resolved.txt) else {
            tracing::debug!("Skipping {} - TXT record lacks endpoint or id", name);
            return;
        };

        self.held.insert(name.to_string(), id.clone());
        self.events.found(id, endpoint, DiscoveryKind::Lan);
    }

    fn on_removed(&self, name: &str) {
        let held = self.held.remove(name).map(|(_, id)| id);
        let in_flight = self.in_flight.remove(name).is_some();

        match held {
            Some(id) => self.events.lost(id, DiscoveryKind::Lan),
            None if in_flight => self.events.lost(name.to_string(), DiscoveryKind::Lan),
            None => {}
        }
    }
}

async fn run_search<B: ServiceBrowser>(inner: Arc<Inner<B>>, generation: u64, cancel: CancellationToken) {
    if let Some(id) = inner.target_id.clone() {
        // Skip the browse and resolve the named instance directly
        inner.events.started();
        handle_found(&inner, id, cancel.clone());
        cancel.cancelled().await;
        // Resolving started a browse underneath
        if inner.is_current(generation) {
            inner.browser.stop_browse(&inner.config.service_type);
        }
        inner.finish(generation, StopReason::Requested);
        return;
    }

    loop {
        match browse_once(&inner, &cancel).await {
            BrowseEnd::Cancelled => {
                // Leave the browse alone if a newer search started it
                if inner.is_current(generation) {
                    inner.browser.stop_browse(&inner.config.service_type);
                }
                inner.finish(generation, StopReason::Requested);
                return;
            }
            BrowseEnd::Failed if inner.config.auto_restart => {
                tracing::warn!("mDNS browse failed, restarting");
                if inner.is_current(generation) {
                    inner.clear();
                    inner.events.stopped(StopReason::Failure);
                }
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.restart_delay) => {}
                    _ = cancel.cancelled() => {
                        inner.finish(generation, StopReason::Requested);
                        return;
                    }
                }
            }
            BrowseEnd::Failed => {
                tracing::warn!("mDNS browse failed");
                inner.finish(generation, StopReason::Failure);
                return;
            }
        }
    }
}

async fn browse_once<B: ServiceBrowser>(inner: &Arc<Inner<B>>, cancel: &CancellationToken) -> BrowseEnd {
    let receiver = match inner.browser.browse(&inner.config.service_type) {
        Ok(receiver) => receiver,
        Err(e) => {
            tracing::warn!("{}", e);
            return BrowseEnd::Failed;
        }
    };
    inner.events.started();

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(BrowseEvent::Found(name)) => handle_found(inner, name, cancel.clone()),
                    Ok(BrowseEvent::Removed(name)) => {
                        tracing::debug!("Service removed: {}", name);
                        inner.on_removed(&name);
                    }
                    Err(_) => return BrowseEnd::Failed,
                }
            }
            _ = cancel.cancelled() => return BrowseEnd::Cancelled,
        }
    }
}

/// Resolves a newly seen advertisement, retrying once with a longer timeout.
fn handle_found<B: ServiceBrowser>(inner: &Arc<Inner<B>>, name: String, cancel: CancellationToken) {
    if !inner.in_flight.insert(name.clone()) {
        tracing::debug!("Ignoring {} - already resolving", name);
        return;
    }

    let inner = inner.clone();
    tokio::spawn(async move {
        let mut timeout = inner.config.resolve_timeout;
        loop {
            let result = tokio::select! {
                result = inner.browser.resolve(&inner.config.service_type, &name, timeout) => result,
                _ = cancel.cancelled() => return,
            };

            match result {
                Ok(resolved) => {
                    inner.retried.remove(&name);
                    inner.on_resolved(&name, resolved);
                    return;
                }
                Err(e) if inner.target_id.is_some() => {
                    tracing::warn!("Giving up on {}: {}", name, e);
                    inner.in_flight.remove(&name);
                    if !cancel.is_cancelled() && inner.searching.swap(false, Ordering::SeqCst) {
                        inner.browser.stop_browse(&inner.config.service_type);
                        inner.events.stopped(StopReason::Exhausted);
                    }
                    return;
                }
                Err(e) if inner.retried.insert(name.clone()) => {
                    tracing::debug!("Retrying {} after: {}", name, e);
                    timeout = inner.config.retry_timeout;
                }
                Err(e) => {
                    tracing::debug!("Dropping {} after: {}", name, e);
                    inner.retried.remove(&name);
                    inner.in_flight.remove(&name);
                    return;
                }
            }
        }
    });
}

/// Extracts (service id, endpoint URI) from TXT metadata.
fn parse_metadata(txt: &HashMap<String, Vec<u8>>) -> Option<(String, String)> {
    let endpoint = std::str::from_utf8(txt.get(TXT_ENDPOINT)?).ok()?;
    let id = std::str::from_utf8(txt.get(TXT_ID)?).ok()?;
    Some((id.to_string(), endpoint.to_string()))
}
