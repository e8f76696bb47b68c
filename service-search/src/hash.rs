use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{DiscoveryKind, ServiceRecord};

/// Hash only identity and location; names and timestamps may change between
/// resolutions without the service set changing.
#[derive(Serialize)]
struct HashView<'a> {
    kind: DiscoveryKind,
    id: &'a str,
    uri: &'a str,
}

/// Computes a SHA-256 fingerprint of the cached services.
/// Records are sorted by (kind, id) so insertion order does not matter.
pub fn compute_hash(services: &[ServiceRecord]) -> String {
    let mut views: Vec<HashView<'_>> = services
        .iter()
        .map(|s| HashView {
            kind: s.kind,
            id: &s.id,
            uri: &s.uri,
        })
        .collect();
    views.sort_by(|a, b| (a.kind, a.id).cmp(&(b.kind, b.id)));

    let mut hasher = Sha256::new();
    for view in &views {
        // serde_json cannot fail on this shape
        if let Ok(line) = serde_json::to_string(view) {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
    }
    hex::encode(hasher.finalize())
}
