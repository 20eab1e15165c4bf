//! Process identity.
//!
//! A process id is derived from the request content unless the caller supplies
//! one, so two identical submissions at different instants never collide.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Identifies one logical process for its entire lifetime.
pub type ProcessId = String;

/// Identifies a container in the engine.
pub type ContainerId = String;

/// SHA-256 over image, version, requester and creation instant, hex encoded.
pub fn derive_process_id(
    image: &str,
    version: Option<&str>,
    requester_id: Option<&str>,
    created_at: DateTime<Utc>,
) -> ProcessId {
    let mut hasher = Sha256::new();
    for part in [
        image,
        version.unwrap_or(""),
        requester_id.unwrap_or(""),
        &created_at.timestamp_nanos_opt().unwrap_or_default().to_string(),
    ] {
        hasher.update(part.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
