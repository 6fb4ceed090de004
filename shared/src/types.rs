use std::collections::HashMap;
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::{CHANNEL_EVENT, INPUT_CHANNEL_EVENT, MPS_EVENT};

/// Unique name of a remote portal instance, e.g. "mps-1._mps-portal._tcp.local."
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceIdentity(String);

impl ServiceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ServiceIdentity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for ServiceIdentity {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Kinds of remote activity tracked by the last-event-time table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// The MPS channel set or a channel's connection state changed
    Channel,
    /// The input channel set or an input's connection state changed
    InputChannel,
    /// An MPS trip was latched
    Trip,
}

impl EventKind {
    pub const COUNT: usize = 3;
    pub const ALL: [EventKind; Self::COUNT] = [EventKind::Channel, EventKind::InputChannel, EventKind::Trip];

    pub fn index(self) -> usize {
        match self {
            EventKind::Channel => 0,
            EventKind::InputChannel => 1,
            EventKind::Trip => 2,
        }
    }

    /// Key used for this kind in the remote last-event-time table
    pub fn wire_key(self) -> &'static str {
        match self {
            EventKind::Channel => CHANNEL_EVENT,
            EventKind::InputChannel => INPUT_CHANNEL_EVENT,
            EventKind::Trip => MPS_EVENT,
        }
    }
}

/// Last-event timestamp per event kind for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessVector([Option<DateTime<Utc>>; EventKind::COUNT]);

impl FreshnessVector {
    pub fn new(slots: [Option<DateTime<Utc>>; EventKind::COUNT]) -> Self {
        Self(slots)
    }

    /// Build from the wire table. Missing keys read as absent, unknown keys are ignored.
    pub fn from_table(table: &HashMap<String, Option<DateTime<Utc>>>) -> Self {
        let mut slots = [None; EventKind::COUNT];
        for kind in EventKind::ALL {
            slots[kind.index()] = table.get(kind.wire_key()).copied().flatten();
        }
        Self(slots)
    }

    pub fn get(&self, kind: EventKind) -> Option<DateTime<Utc>> {
        self.0[kind.index()]
    }

    pub fn with(mut self, kind: EventKind, timestamp: Option<DateTime<Utc>>) -> Self {
        self.0[kind.index()] = timestamp;
        self
    }

    pub fn slots(&self) -> &[Option<DateTime<Utc>>; EventKind::COUNT] {
        &self.0
    }
}

/// A single signal that fired as part of a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub signal: String,
    pub timestamp: DateTime<Utc>,
}

/// A latched MPS trip with the signals that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    pub timestamp: DateTime<Utc>,
    pub signal_events: Vec<SignalEvent>,
}

/// A monitored process variable and whether the portal is connected to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_from_table_ignores_unknown_keys() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let table = HashMap::from([
            (MPS_EVENT.to_string(), Some(t1)),
            (CHANNEL_EVENT.to_string(), None),
            ("bogus".to_string(), Some(t1)),
        ]);

        let vector = FreshnessVector::from_table(&table);

        assert_eq!(vector.get(EventKind::Trip), Some(t1));
        assert_eq!(vector.get(EventKind::Channel), None);
        assert_eq!(vector.get(EventKind::InputChannel), None, "Missing key should read as absent");
    }

    #[test]
    fn test_event_kind_wire_format() {
        let json = serde_json::to_string(&EventKind::InputChannel).unwrap();
        assert_eq!(json, "\"input-channel\"");
        for (position, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), position);
        }
    }

    #[test]
    fn test_identity_is_transparent() {
        let identity = ServiceIdentity::new("mps-1._mps-portal._tcp.local.");
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, "\"mps-1._mps-portal._tcp.local.\"");
    }
}
