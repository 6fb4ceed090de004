pub mod json;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::types::{ChannelInfo, FreshnessVector, TripEvent};
use crate::error::RemoteError;

pub use json::JsonRpcProxy;

/// Remote surface of an MPS portal.
///
/// Every call may block for as long as the network does; callers are
/// expected to impose their own timeout.
#[async_trait]
pub trait RemoteServiceProxy: Send + Sync {
    async fn host_name(&self) -> Result<String, RemoteError>;

    async fn launch_time(&self) -> Result<DateTime<Utc>, RemoteError>;

    async fn process_id(&self) -> Result<u32, RemoteError>;

    async fn logs_statistics(&self) -> Result<bool, RemoteError>;

    /// Ordered category (MPS latch type) names
    async fn categories(&self) -> Result<Vec<String>, RemoteError>;

    /// Cheap freshness probe for one category
    async fn last_event_timestamps(&self, category: usize) -> Result<FreshnessVector, RemoteError>;

    async fn first_hit_summary(&self, category: usize) -> Result<String, RemoteError>;

    async fn trip_summary(&self, category: usize) -> Result<String, RemoteError>;

    async fn latest_events(&self, category: usize) -> Result<Vec<TripEvent>, RemoteError>;

    async fn channel_info(&self, category: usize) -> Result<Vec<ChannelInfo>, RemoteError>;

    async fn input_channel_info(&self, category: usize) -> Result<Vec<ChannelInfo>, RemoteError>;

    async fn reload_signals(&self, category: usize) -> Result<(), RemoteError>;

    async fn shutdown(&self, code: i32) -> Result<(), RemoteError>;
}
