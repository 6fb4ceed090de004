use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shared::types::EventKind;
use crate::record::RecordStatus;

/// Only fields that describe remote state; last_check moves every tick.
#[derive(Serialize)]
struct HashView<'a> {
    identity: &'a str,
    address: &'a str,
    service_okay: bool,
    initialized: bool,
    watermarks: Vec<&'a [Option<DateTime<Utc>>; EventKind::COUNT]>,
}

/// SHA-256 over the record statuses, sorted by identity so that registry
/// order does not matter.
pub fn compute_digest(statuses: &[RecordStatus]) -> Result<String, serde_json::Error> {
    let mut indices: Vec<usize> = (0..statuses.len()).collect();
    indices.sort_by(|&a, &b| statuses[a].identity.cmp(&statuses[b].identity));

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let s = &statuses[i];
            HashView {
                identity: s.identity.as_str(),
                address: &s.address,
                service_okay: s.service_okay,
                initialized: s.initialized,
                watermarks: s.watermarks.iter().map(|row| row.slots()).collect(),
            }
        })
        .collect();

    let json = serde_json::to_vec(&views)?;
    Ok(hex::encode(Sha256::digest(&json)))
}
