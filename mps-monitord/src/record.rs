use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shared::types::{ChannelInfo, EventKind, FreshnessVector, ServiceIdentity, TripEvent};
use crate::cache::fetch::{CacheListener, FetchCache};
use crate::cache::freshness::{FreshnessOracle, Watermarks};
use crate::error::RemoteError;
use crate::rpc::RemoteServiceProxy;

/// One cached aspect of a portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Facet {
    HostName,
    LaunchTime,
    ProcessId,
    LogsStatistics,
    Categories,
    Freshness,
    FirstHitSummary,
    TripSummary,
    LatestEvents,
    Channels,
    InputChannels,
}

/// Heavy facets that must be refetched when `kind` advances.
pub fn dependents(kind: EventKind) -> &'static [Facet] {
    match kind {
        EventKind::Channel => &[Facet::Channels],
        EventKind::InputChannel => &[Facet::InputChannels],
        EventKind::Trip => &[Facet::LatestEvents, Facet::FirstHitSummary, Facet::TripSummary],
    }
}

/// A cache of `identity` finished a fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordUpdate {
    pub identity: ServiceIdentity,
    /// `None` for record-level facets
    pub category: Option<usize>,
    pub facet: Facet,
}

pub type UpdateListener = Arc<dyn Fn(&RecordUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct RecordSettings {
    pub fetch_timeout: Option<Duration>,
}

impl Default for RecordSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Some(Duration::from_secs(15)),
        }
    }
}

/// Outcome of one refresh pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub initialized: bool,
    pub categories_checked: usize,
    pub oracle_failures: usize,
    pub facets_refetched: usize,
    pub facet_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity: ServiceIdentity,
    pub host: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub process_id: Option<u32>,
    pub logs_statistics: Option<bool>,
    pub service_okay: bool,
    pub last_check: Option<DateTime<Utc>>,
}

/// Status readable without touching the network.
#[derive(Debug, Clone, Serialize)]
pub struct RecordStatus {
    pub identity: ServiceIdentity,
    pub address: String,
    pub service_okay: bool,
    pub initialized: bool,
    pub watermarks: Vec<FreshnessVector>,
}

/// Routes cache notifications to the record's single listener.
struct Notifier {
    identity: ServiceIdentity,
    listener: Mutex<Option<UpdateListener>>,
}

impl Notifier {
    fn cache_listener(self: &Arc<Self>, category: Option<usize>, facet: Facet) -> CacheListener {
        let notifier = self.clone();
        Arc::new(move || {
            notifier.notify(&RecordUpdate {
                identity: notifier.identity.clone(),
                category,
                facet,
            });
        })
    }

    fn notify(&self, update: &RecordUpdate) {
        // Never call out with the lock held: the listener may take other locks
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(update);
        }
    }
}

fn category_cache<T, F, Fut>(
    name: &'static str,
    proxy: &Arc<dyn RemoteServiceProxy>,
    index: usize,
    fetch: F,
) -> FetchCache<T>
where
    T: Clone + Send + 'static,
    F: Fn(Arc<dyn RemoteServiceProxy>, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
{
    let proxy = proxy.clone();
    FetchCache::new(name, move || fetch(proxy.clone(), index))
}

struct CategoryCaches {
    name: String,
    oracle: FreshnessOracle,
    first_hit: FetchCache<String>,
    trip_summary: FetchCache<String>,
    latest_events: FetchCache<Vec<TripEvent>>,
    channels: FetchCache<Vec<ChannelInfo>>,
    input_channels: FetchCache<Vec<ChannelInfo>>,
}

impl CategoryCaches {
    fn new(
        index: usize,
        name: String,
        proxy: &Arc<dyn RemoteServiceProxy>,
        settings: RecordSettings,
        notifier: &Arc<Notifier>,
    ) -> Self {
        let timeout = settings.fetch_timeout;
        let listener = |facet| notifier.cache_listener(Some(index), facet);

        let oracle = category_cache("last-event-times", proxy, index, |p, c| async move {
            p.last_event_timestamps(c).await
        });
        let first_hit = category_cache("first-hit-summary", proxy, index, |p, c| async move {
            p.first_hit_summary(c).await
        });
        let trip_summary = category_cache("trip-summary", proxy, index, |p, c| async move {
            p.trip_summary(c).await
        });
        let latest_events = category_cache("latest-events", proxy, index, |p, c| async move {
            p.latest_events(c).await
        });
        let channels = category_cache("channel-info", proxy, index, |p, c| async move {
            p.channel_info(c).await
        });
        // Inputs come back unordered
        let input_channels = category_cache("input-channel-info", proxy, index, |p, c| async move {
            let mut channels = p.input_channel_info(c).await?;
            channels.sort_by(|a, b| a.name.cmp(&b.name));
            Ok::<_, RemoteError>(channels)
        });

        Self {
            name,
            oracle: FreshnessOracle::new(
                oracle.with_timeout(timeout).with_listener(listener(Facet::Freshness)),
            ),
            first_hit: first_hit.with_timeout(timeout).with_listener(listener(Facet::FirstHitSummary)),
            trip_summary: trip_summary.with_timeout(timeout).with_listener(listener(Facet::TripSummary)),
            latest_events: latest_events.with_timeout(timeout).with_listener(listener(Facet::LatestEvents)),
            channels: channels.with_timeout(timeout).with_listener(listener(Facet::Channels)),
            input_channels: input_channels.with_timeout(timeout).with_listener(listener(Facet::InputChannels)),
        }
    }

    async fn refresh_facet(&self, facet: Facet) -> Result<(), RemoteError> {
        match facet {
            Facet::FirstHitSummary => self.first_hit.refresh().await.map(drop),
            Facet::TripSummary => self.trip_summary.refresh().await.map(drop),
            Facet::LatestEvents => self.latest_events.refresh().await.map(drop),
            Facet::Channels => self.channels.refresh().await.map(drop),
            Facet::InputChannels => self.input_channels.refresh().await.map(drop),
            Facet::Freshness => self.oracle.refresh().await.map(drop),
            Facet::HostName
            | Facet::LaunchTime
            | Facet::ProcessId
            | Facet::LogsStatistics
            | Facet::Categories => Ok(()),
        }
    }
}

/// Local mirror of one remote portal.
///
/// Identity facets are fetched lazily. Category facets are gated by the
/// per-category freshness oracle: a heavy cache is refetched only when the
/// oracle's timestamp for one of its event kinds moves past the watermark.
pub struct RemoteRecord {
    identity: ServiceIdentity,
    address: String,
    proxy: Arc<dyn RemoteServiceProxy>,
    settings: RecordSettings,
    notifier: Arc<Notifier>,
    host: FetchCache<String>,
    launch_time: FetchCache<DateTime<Utc>>,
    process_id: FetchCache<u32>,
    logs_statistics: FetchCache<bool>,
    category_names: FetchCache<Vec<String>>,
    categories: OnceLock<Vec<CategoryCaches>>,
    init_lock: tokio::sync::Mutex<()>,
    refresh_lock: tokio::sync::Mutex<()>,
    watermarks: Mutex<Watermarks>,
    service_okay: AtomicBool,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

impl RemoteRecord {
    pub fn new(
        identity: ServiceIdentity,
        address: String,
        proxy: Arc<dyn RemoteServiceProxy>,
        settings: RecordSettings,
    ) -> Self {
        let notifier = Arc::new(Notifier {
            identity: identity.clone(),
            listener: Mutex::new(None),
        });
        let timeout = settings.fetch_timeout;
        let listener = |facet| notifier.cache_listener(None, facet);

        let p = proxy.clone();
        let host = FetchCache::new("host-name", move || {
            let p = p.clone();
            async move { p.host_name().await }
        });
        let p = proxy.clone();
        let launch_time = FetchCache::new("launch-time", move || {
            let p = p.clone();
            async move { p.launch_time().await }
        });
        let p = proxy.clone();
        let process_id = FetchCache::new("process-id", move || {
            let p = p.clone();
            async move { p.process_id().await }
        });
        let p = proxy.clone();
        let logs_statistics = FetchCache::new("logs-statistics", move || {
            let p = p.clone();
            async move { p.logs_statistics().await }
        });
        let p = proxy.clone();
        let category_names = FetchCache::new("categories", move || {
            let p = p.clone();
            async move { p.categories().await }
        });

        Self {
            host: host.with_timeout(timeout).with_listener(listener(Facet::HostName)),
            launch_time: launch_time.with_timeout(timeout).with_listener(listener(Facet::LaunchTime)),
            process_id: process_id.with_timeout(timeout).with_listener(listener(Facet::ProcessId)),
            logs_statistics: logs_statistics
                .with_timeout(timeout)
                .with_listener(listener(Facet::LogsStatistics)),
            category_names: category_names
                .with_timeout(timeout)
                .with_listener(listener(Facet::Categories)),
            identity,
            address,
            proxy,
            settings,
            notifier: notifier.clone(),
            categories: OnceLock::new(),
            init_lock: tokio::sync::Mutex::new(()),
            refresh_lock: tokio::sync::Mutex::new(()),
            watermarks: Mutex::new(Watermarks::default()),
            service_okay: AtomicBool::new(false),
            last_check: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn service_okay(&self) -> bool {
        self.service_okay.load(Ordering::SeqCst)
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.categories.get().is_some()
    }

    /// Register the single update listener, replacing any previous one.
    pub fn set_update_listener(&self, listener: UpdateListener) {
        *self.notifier.listener.lock() = Some(listener);
    }

    pub fn clear_update_listener(&self) {
        *self.notifier.listener.lock() = None;
    }

    /// Release everything that reaches outside the record.
    pub fn dispose(&self) {
        self.clear_update_listener();
        tracing::debug!("Disposed record {}", self.identity);
    }

    /// Category caches, fetching the category list on first use. Stays
    /// uninitialized (and is retried on the next call) when that fetch fails.
    async fn ensure_initialized(&self) -> Option<&[CategoryCaches]> {
        if let Some(categories) = self.categories.get() {
            return Some(categories);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(categories) = self.categories.get() {
            return Some(categories);
        }

        let names = match self.category_names.refresh().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!("Portal {} not initialized: {}", self.identity, e);
                return None;
            }
        };

        let caches: Vec<CategoryCaches> = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| CategoryCaches::new(index, name, &self.proxy, self.settings, &self.notifier))
            .collect();
        *self.watermarks.lock() = Watermarks::new(caches.len());
        tracing::info!("Initialized {} with {} categories", self.identity, caches.len());

        Some(self.categories.get_or_init(|| caches))
    }

    async fn category(&self, index: usize) -> Option<&CategoryCaches> {
        self.ensure_initialized().await?.get(index)
    }

    /// One differential refresh pass over every category.
    pub async fn refresh(&self) -> RefreshReport {
        let _guard = self.refresh_lock.lock().await;
        let mut report = RefreshReport::default();

        let Some(categories) = self.ensure_initialized().await else {
            self.service_okay.store(false, Ordering::SeqCst);
            return report;
        };
        report.initialized = true;
        self.refresh_identity().await;

        for (index, caches) in categories.iter().enumerate() {
            report.categories_checked += 1;
            let vector = match caches.oracle.refresh().await {
                Ok(vector) => vector,
                Err(e) => {
                    // Watermarks stay put so the next good read compares against the same baseline
                    self.service_okay.store(false, Ordering::SeqCst);
                    report.oracle_failures += 1;
                    tracing::warn!("Freshness check of {}/{} failed: {}", self.identity, caches.name, e);
                    continue;
                }
            };
            self.service_okay.store(true, Ordering::SeqCst);
            self.apply_freshness(index, caches, &vector, &mut report).await;
        }

        if categories.is_empty() {
            self.service_okay.store(true, Ordering::SeqCst);
        }
        if report.oracle_failures < report.categories_checked || categories.is_empty() {
            *self.last_check.lock() = Some(Utc::now());
        }

        tracing::debug!(
            "Refreshed {}: {} categories, {} oracle failures, {} facets refetched",
            self.identity,
            report.categories_checked,
            report.oracle_failures,
            report.facets_refetched
        );
        report
    }

    async fn apply_freshness(
        &self,
        index: usize,
        caches: &CategoryCaches,
        vector: &FreshnessVector,
        report: &mut RefreshReport,
    ) {
        for kind in EventKind::ALL {
            let Some(remote) = vector.get(kind) else {
                continue;
            };
            let advanced = self.watermarks.lock().has_advanced(index, kind, remote);
            if !advanced {
                continue;
            }

            for facet in dependents(kind) {
                report.facets_refetched += 1;
                // Best effort: a failed heavy fetch keeps its old value
                if caches.refresh_facet(*facet).await.is_err() {
                    report.facet_failures += 1;
                }
            }
            self.watermarks.lock().advance(index, kind, remote);
        }
    }

    /// Retry identity facets that have never been fetched successfully.
    async fn refresh_identity(&self) {
        let _ = self.host.refresh_unless_fresh().await;
        let _ = self.launch_time.refresh_unless_fresh().await;
        let _ = self.process_id.refresh_unless_fresh().await;
        let _ = self.logs_statistics.refresh_unless_fresh().await;
    }

    pub async fn identity_summary(&self) -> IdentitySummary {
        IdentitySummary {
            identity: self.identity.clone(),
            host: self.host.value().await.unwrap_or_else(|| self.address.clone()),
            launch_time: self.launch_time.value().await,
            process_id: self.process_id.value().await,
            logs_statistics: self.logs_statistics.value().await,
            service_okay: self.service_okay(),
            last_check: self.last_check(),
        }
    }

    pub async fn categories(&self) -> Option<Vec<String>> {
        let categories = self.ensure_initialized().await?;
        Some(categories.iter().map(|c| c.name.clone()).collect())
    }

    pub async fn first_hit_summary(&self, category: usize) -> Option<String> {
        self.category(category).await?.first_hit.value().await
    }

    pub async fn trip_summary(&self, category: usize) -> Option<String> {
        self.category(category).await?.trip_summary.value().await
    }

    pub async fn latest_events(&self, category: usize) -> Option<Vec<TripEvent>> {
        self.category(category).await?.latest_events.value().await
    }

    /// Most recent trip, if any
    pub async fn latest_event(&self, category: usize) -> Option<TripEvent> {
        self.latest_events(category).await?.into_iter().next()
    }

    pub async fn channels(&self, category: usize) -> Option<Vec<ChannelInfo>> {
        self.category(category).await?.channels.value().await
    }

    pub async fn input_channels(&self, category: usize) -> Option<Vec<ChannelInfo>> {
        self.category(category).await?.input_channels.value().await
    }

    /// Last freshness vector read for `category`
    pub fn freshness(&self, category: usize) -> Option<FreshnessVector> {
        self.categories.get()?.get(category)?.oracle.latest()
    }

    /// Time of the newest trip the heavy caches are current with
    pub fn last_event_time(&self, category: usize) -> Option<DateTime<Utc>> {
        self.watermarks.lock().last_seen(category, EventKind::Trip)
    }

    pub fn status(&self) -> RecordStatus {
        RecordStatus {
            identity: self.identity.clone(),
            address: self.address.clone(),
            service_okay: self.service_okay(),
            initialized: self.is_initialized(),
            watermarks: self.watermarks.lock().rows().to_vec(),
        }
    }

    /// Ask the portal to reload its signal list for `category`. Failures are logged only.
    pub async fn request_reload(&self, category: usize) {
        let outcome = self
            .fire_and_forget("reload-signals", self.proxy.reload_signals(category))
            .await;
        match outcome {
            Ok(()) => tracing::info!("Requested signal reload of {} category {}", self.identity, category),
            Err(e) => tracing::warn!("Signal reload of {} category {} failed: {}", self.identity, category, e),
        }
    }

    pub async fn request_reload_all(&self) {
        let Some(categories) = self.ensure_initialized().await else {
            tracing::warn!("Cannot reload {}: category list unavailable", self.identity);
            return;
        };
        for index in 0..categories.len() {
            self.request_reload(index).await;
        }
    }

    /// Ask the portal process to exit with `code`. Failures are logged only.
    pub async fn request_shutdown(&self, code: i32) {
        match self.fire_and_forget("shutdown", self.proxy.shutdown(code)).await {
            Ok(()) => tracing::info!("Requested shutdown of {} with code {}", self.identity, code),
            Err(e) => tracing::warn!("Shutdown of {} failed: {}", self.identity, e),
        }
    }

    async fn fire_and_forget<F>(&self, operation: &'static str, call: F) -> Result<(), RemoteError>
    where
        F: Future<Output = Result<(), RemoteError>>,
    {
        match self.settings.fetch_timeout {
            Some(after) => tokio::time::timeout(after, call)
                .await
                .unwrap_or(Err(RemoteError::Timeout { operation, after })),
            None => call.await,
        }
    }
}
