use chrono::{DateTime, Utc};
use shared::types::{EventKind, FreshnessVector};
use crate::error::RemoteError;
use super::fetch::FetchCache;

/// Cheap per-category cache of last-event timestamps.
///
/// Interpreting the vector is up to the owner; the oracle only fetches it.
pub struct FreshnessOracle {
    cache: FetchCache<FreshnessVector>,
}

impl FreshnessOracle {
    pub fn new(cache: FetchCache<FreshnessVector>) -> Self {
        Self { cache }
    }

    pub async fn refresh(&self) -> Result<FreshnessVector, RemoteError> {
        self.cache.refresh().await
    }

    pub fn latest(&self) -> Option<FreshnessVector> {
        self.cache.peek()
    }
}

/// Per (category, event kind) timestamp up to which heavy caches are known
/// to be current. Slots only ever move forward.
#[derive(Debug, Clone, Default)]
pub struct Watermarks {
    seen: Vec<FreshnessVector>,
}

impl Watermarks {
    pub fn new(categories: usize) -> Self {
        Self {
            seen: vec![FreshnessVector::default(); categories],
        }
    }

    pub fn last_seen(&self, category: usize, kind: EventKind) -> Option<DateTime<Utc>> {
        self.seen.get(category).and_then(|row| row.get(kind))
    }

    /// True when `remote` is newer than anything recorded for the slot.
    pub fn has_advanced(&self, category: usize, kind: EventKind, remote: DateTime<Utc>) -> bool {
        if category >= self.seen.len() {
            return false;
        }
        match self.last_seen(category, kind) {
            Some(seen) => remote > seen,
            None => true,
        }
    }

    /// Move the slot to `remote`. Returns false, leaving the slot alone, unless
    /// `remote` is strictly newer.
    pub fn advance(&mut self, category: usize, kind: EventKind, remote: DateTime<Utc>) -> bool {
        if !self.has_advanced(category, kind, remote) {
            return false;
        }
        let row = &mut self.seen[category];
        *row = row.with(kind, Some(remote));
        true
    }

    pub fn rows(&self) -> &[FreshnessVector] {
        &self.seen
    }
}
