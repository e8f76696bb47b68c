//! Local-network discovery over mDNS / DNS-SD

pub mod browser;
pub mod provider;

pub use browser::{BrowseEvent, MdnsServiceBrowser, ResolvedService, ServiceBrowser};
pub use provider::{MdnsDiscoveryProvider, MdnsProviderConfig};
