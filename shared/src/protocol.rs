use std::time::Duration;

/// mDNS service type advertised by multiscreen-capable devices
pub const SERVICE_TYPE: &str = "_samsungmsf._tcp.local.";

/// TXT record key carrying the service endpoint URI
pub const TXT_ENDPOINT: &str = "se";
/// TXT record key carrying the service id
pub const TXT_ID: &str = "id";

/// Name used when a descriptor does not carry one
pub const DEFAULT_SERVICE_NAME: &str = "Unknown Device";

pub const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(5);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);
pub const RESOLVE_RETRY_TIMEOUT: Duration = Duration::from_secs(15);
