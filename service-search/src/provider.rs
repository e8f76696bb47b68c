//! The contract between discovery backends and the search that owns them

use std::fmt;
use std::sync::Arc;
use shared::types::{DiscoveryKind, ServiceRef};
use tokio::sync::mpsc;

/// Why a provider stopped searching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// The underlying watch failed
    Failure,
    /// A narrowed search gave up on its only target
    Exhausted,
}

/// A callback from a provider to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Started,
    Stopped(StopReason),
    Found(ServiceRef),
    Lost { service_id: String, kind: DiscoveryKind },
}

/// Sink a provider reports its events into.
///
/// Providers never see the search state; every event they emit is handed
/// off to the owner, which decides what it means.
#[derive(Clone)]
pub struct ProviderEvents {
    sink: Arc<dyn Fn(ProviderEvent) + Send + Sync>,
}

impl ProviderEvents {
    pub fn new(sink: impl Fn(ProviderEvent) + Send + Sync + 'static) -> Self {
        Self { sink: Arc::new(sink) }
    }

    /// A sink that forwards into a channel, for driving a provider on its own.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (events, rx)
    }

    pub fn started(&self) {
        (self.sink)(ProviderEvent::Started);
    }

    pub fn stopped(&self, reason: StopReason) {
        (self.sink)(ProviderEvent::Stopped(reason));
    }

    pub fn found(&self, service_id: String, endpoint_uri: String, kind: DiscoveryKind) {
        (self.sink)(ProviderEvent::Found(ServiceRef {
            service_id,
            endpoint_uri,
            kind,
        }));
    }

    pub fn lost(&self, service_id: String, kind: DiscoveryKind) {
        (self.sink)(ProviderEvent::Lost { service_id, kind });
    }
}

impl fmt::Debug for ProviderEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEvents").finish_non_exhaustive()
    }
}

/// A pluggable backend that watches one transport for services.
///
/// All methods must return promptly; the actual watching happens on tasks the
/// provider spawns, and results come back through its [`ProviderEvents`].
pub trait DiscoveryProvider: Send + Sync {
    fn kind(&self) -> DiscoveryKind;

    /// Begin (or restart) watching. Calling this while already searching
    /// cancels the current watch and starts a fresh one.
    fn search(&self);

    /// Stop watching. Must eventually report `Stopped`, even if the
    /// provider was never started.
    fn stop(&self);

    fn is_searching(&self) -> bool;

    /// A sighting this provider reported could not be resolved.
    fn report_resolution_failure(&self, service_id: &str, kind: DiscoveryKind);
}

/// Everything a provider gets at construction
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub events: ProviderEvents,
    /// Restricts the search to a single known service id
    pub target_id: Option<String>,
}

/// Builds one provider for a search.
pub type ProviderFactory = Box<dyn FnOnce(ProviderContext) -> Box<dyn DiscoveryProvider> + Send>;
