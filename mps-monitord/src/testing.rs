//! Scripted in-memory portal for tests.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use shared::protocol::*;
use shared::types::{ChannelInfo, EventKind, FreshnessVector, TripEvent};
use crate::error::RemoteError;
use crate::rpc::RemoteServiceProxy;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

#[derive(Default)]
struct Script {
    categories: Vec<String>,
    freshness: Vec<FreshnessVector>,
    trip_summaries: HashMap<usize, String>,
    input_channels: HashMap<usize, Vec<ChannelInfo>>,
    fail_categories: bool,
    fail_freshness: bool,
    fail_freshness_of: Option<usize>,
    fail_heavy: bool,
    fail_commands: bool,
    calls: HashMap<(&'static str, Option<usize>), usize>,
}

pub struct ScriptedProxy {
    script: Mutex<Script>,
}

impl ScriptedProxy {
    pub fn new(categories: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script {
                categories: categories.iter().map(|c| c.to_string()).collect(),
                freshness: vec![FreshnessVector::default(); categories.len()],
                ..Default::default()
            }),
        })
    }

    pub fn set_freshness(&self, category: usize, kind: EventKind, timestamp: Option<DateTime<Utc>>) {
        let mut script = self.script.lock();
        let row = script.freshness[category];
        script.freshness[category] = row.with(kind, timestamp);
    }

    pub fn set_trip_summary(&self, category: usize, text: &str) {
        self.script.lock().trip_summaries.insert(category, text.to_string());
    }

    pub fn set_input_channels(&self, category: usize, channels: Vec<ChannelInfo>) {
        self.script.lock().input_channels.insert(category, channels);
    }

    pub fn fail_categories(&self, fail: bool) {
        self.script.lock().fail_categories = fail;
    }

    pub fn fail_freshness(&self, fail: bool) {
        self.script.lock().fail_freshness = fail;
    }

    /// Fail freshness reads of one category only
    pub fn fail_freshness_of(&self, category: Option<usize>) {
        self.script.lock().fail_freshness_of = category;
    }

    pub fn fail_heavy(&self, fail: bool) {
        self.script.lock().fail_heavy = fail;
    }

    pub fn fail_commands(&self, fail: bool) {
        self.script.lock().fail_commands = fail;
    }

    /// Calls of `method` across all categories
    pub fn calls(&self, method: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|((m, _), _)| *m == method)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn calls_for(&self, method: &str, category: usize) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|((m, c), _)| *m == method && *c == Some(category))
            .map(|(_, n)| *n)
            .sum()
    }

    /// Count the call, failing it when the script says so
    fn check(&self, method: &'static str, category: Option<usize>) -> Result<usize, RemoteError> {
        let mut script = self.script.lock();
        let fail = match method {
            METHOD_CATEGORIES => script.fail_categories,
            METHOD_LAST_EVENT_TIMES => {
                script.fail_freshness || (category.is_some() && script.fail_freshness_of == category)
            }
            METHOD_RELOAD_SIGNALS | METHOD_SHUTDOWN => script.fail_commands,
            METHOD_HOST_NAME | METHOD_LAUNCH_TIME | METHOD_PROCESS_ID | METHOD_LOGS_STATISTICS => false,
            _ => script.fail_heavy,
        };
        let count = script.calls.entry((method, category)).or_insert(0);
        *count += 1;
        if fail {
            return Err(RemoteError::Disconnected {
                endpoint: format!("scripted:{method}"),
            });
        }
        Ok(*count)
    }
}

#[async_trait]
impl RemoteServiceProxy for ScriptedProxy {
    async fn host_name(&self) -> Result<String, RemoteError> {
        self.check(METHOD_HOST_NAME, None)?;
        Ok("mps-host".to_string())
    }

    async fn launch_time(&self) -> Result<DateTime<Utc>, RemoteError> {
        self.check(METHOD_LAUNCH_TIME, None)?;
        Ok(at(-3600))
    }

    async fn process_id(&self) -> Result<u32, RemoteError> {
        self.check(METHOD_PROCESS_ID, None)?;
        Ok(4242)
    }

    async fn logs_statistics(&self) -> Result<bool, RemoteError> {
        self.check(METHOD_LOGS_STATISTICS, None)?;
        Ok(true)
    }

    async fn categories(&self) -> Result<Vec<String>, RemoteError> {
        self.check(METHOD_CATEGORIES, None)?;
        Ok(self.script.lock().categories.clone())
    }

    async fn last_event_timestamps(&self, category: usize) -> Result<FreshnessVector, RemoteError> {
        self.check(METHOD_LAST_EVENT_TIMES, Some(category))?;
        Ok(self.script.lock().freshness[category])
    }

    async fn first_hit_summary(&self, category: usize) -> Result<String, RemoteError> {
        let n = self.check(METHOD_FIRST_HIT_TEXT, Some(category))?;
        Ok(format!("first hits {category} #{n}"))
    }

    async fn trip_summary(&self, category: usize) -> Result<String, RemoteError> {
        let n = self.check(METHOD_TRIP_SUMMARY, Some(category))?;
        let script = self.script.lock();
        Ok(script
            .trip_summaries
            .get(&category)
            .cloned()
            .unwrap_or_else(|| format!("trips {category} #{n}")))
    }

    async fn latest_events(&self, category: usize) -> Result<Vec<TripEvent>, RemoteError> {
        self.check(METHOD_LATEST_EVENTS, Some(category))?;
        let timestamp = self.script.lock().freshness[category]
            .get(EventKind::Trip)
            .unwrap_or_else(|| at(0));
        Ok(vec![TripEvent {
            timestamp,
            signal_events: Vec::new(),
        }])
    }

    async fn channel_info(&self, category: usize) -> Result<Vec<ChannelInfo>, RemoteError> {
        self.check(METHOD_CHANNEL_INFO, Some(category))?;
        Ok(vec![ChannelInfo {
            name: format!("MPS:{category}:Latch"),
            connected: true,
        }])
    }

    async fn input_channel_info(&self, category: usize) -> Result<Vec<ChannelInfo>, RemoteError> {
        self.check(METHOD_INPUT_CHANNEL_INFO, Some(category))?;
        Ok(self
            .script
            .lock()
            .input_channels
            .get(&category)
            .cloned()
            .unwrap_or_default())
    }

    async fn reload_signals(&self, category: usize) -> Result<(), RemoteError> {
        self.check(METHOD_RELOAD_SIGNALS, Some(category))?;
        Ok(())
    }

    async fn shutdown(&self, _code: i32) -> Result<(), RemoteError> {
        self.check(METHOD_SHUTDOWN, None)?;
        Ok(())
    }
}
