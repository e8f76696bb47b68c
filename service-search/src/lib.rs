//! Discovery of multiscreen services on the local network and in the cloud
//!
//! A [`ServiceSearch`] owns a set of [`DiscoveryProvider`]s, merges what they
//! report into one de-duplicated list of resolved services, and notifies
//! subscribers as services appear and disappear.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mdns_sd::ServiceDaemon;
//! use service_search::{MdnsDiscoveryProvider, MdnsProviderConfig, MdnsServiceBrowser};
//! use service_search::{SearchEvent, ServiceSearch, Topic};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let browser = Arc::new(MdnsServiceBrowser::new(ServiceDaemon::new()?));
//!     let search = ServiceSearch::builder()
//!         .provider(MdnsDiscoveryProvider::factory(browser, MdnsProviderConfig::default()))
//!         .spawn();
//!
//!     let mut events = search.subscribe(&Topic::ALL);
//!     search.start()?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let SearchEvent::ServiceFound(service) = event {
//!             println!("{} at {}", service.name, service.uri);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cloud;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod hash;
pub mod mdns;
pub mod provider;
pub mod search;

pub use cloud::{CloudDirectory, CloudDiscoveryProvider, CloudProviderConfig, DirectoryEntry, HttpCloudDirectory};
pub use descriptor::{get_by_uri, DescriptorFetcher, HttpDescriptorFetcher};
pub use error::{Result, SearchError};
pub use events::{EventBus, SearchEvent, Subscription, SubscriptionHandle, Topic};
pub use mdns::{MdnsDiscoveryProvider, MdnsProviderConfig, MdnsServiceBrowser, ServiceBrowser};
pub use provider::{DiscoveryProvider, ProviderContext, ProviderEvent, ProviderEvents, ProviderFactory, StopReason};
pub use search::{SearchConfig, ServiceSearch, ServiceSearchBuilder};
pub use shared::types::{DiscoveryKind, ServiceRecord, ServiceRef};
