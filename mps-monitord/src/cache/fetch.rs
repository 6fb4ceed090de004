use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use crate::error::RemoteError;

/// Called once per completed fetch attempt, successful or not.
pub type CacheListener = Arc<dyn Fn() + Send + Sync>;

type Fetcher<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T, RemoteError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Unfetched,
    Fresh,
    Error,
}

struct Slot<T> {
    state: CacheState,
    value: Option<T>,
}

/// Single-value cache over one remote fetch.
///
/// Refreshes are serialized per instance. The stored value only ever comes
/// from a completed fetch; a failed fetch keeps whatever was there before.
pub struct FetchCache<T> {
    name: &'static str,
    fetcher: Fetcher<T>,
    timeout: Option<Duration>,
    refresh_lock: tokio::sync::Mutex<()>,
    slot: Mutex<Slot<T>>,
    listener: Mutex<Option<CacheListener>>,
}

impl<T: Clone + Send + 'static> FetchCache<T> {
    pub fn new<F, Fut>(name: &'static str, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        Self {
            name,
            fetcher: Box::new(move || fetch().boxed()),
            timeout: None,
            refresh_lock: tokio::sync::Mutex::new(()),
            slot: Mutex::new(Slot {
                state: CacheState::Unfetched,
                value: None,
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_listener(self, listener: CacheListener) -> Self {
        self.set_listener(Some(listener));
        self
    }

    /// Replace the listener. At most one is registered at a time.
    pub fn set_listener(&self, listener: Option<CacheListener>) {
        *self.listener.lock() = listener;
    }

    pub fn state(&self) -> CacheState {
        self.slot.lock().state
    }

    /// Last fetched value without triggering a fetch
    pub fn peek(&self) -> Option<T> {
        self.slot.lock().value.clone()
    }

    /// Fetch now and return the new value.
    pub async fn refresh(&self) -> Result<T, RemoteError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Fetch only when the last attempt did not succeed.
    pub async fn refresh_unless_fresh(&self) -> Result<(), RemoteError> {
        let _guard = self.refresh_lock.lock().await;
        if self.state() == CacheState::Fresh {
            return Ok(());
        }
        self.refresh_locked().await.map(|_| ())
    }

    /// Current value, fetching first if nothing was ever fetched.
    pub async fn value(&self) -> Option<T> {
        if self.state() == CacheState::Unfetched {
            let _guard = self.refresh_lock.lock().await;
            // Another reader may have fetched while we waited
            if self.state() == CacheState::Unfetched {
                let _ = self.refresh_locked().await;
            }
        }
        self.peek()
    }

    async fn refresh_locked(&self) -> Result<T, RemoteError> {
        let fetch = (self.fetcher)();
        let outcome = match self.timeout {
            Some(after) => match tokio::time::timeout(after, fetch).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RemoteError::Timeout {
                    operation: self.name,
                    after,
                }),
            },
            None => fetch.await,
        };

        let result = {
            let mut slot = self.slot.lock();
            match outcome {
                Ok(value) => {
                    slot.value = Some(value.clone());
                    slot.state = CacheState::Fresh;
                    Ok(value)
                }
                Err(e) => {
                    slot.state = CacheState::Error;
                    Err(e)
                }
            }
        };

        match &result {
            Err(e) if e.is_transport() => tracing::warn!("Fetch of {} failed: {}", self.name, e),
            Err(e) => tracing::error!("Fetch of {} returned unusable data: {}", self.name, e),
            Ok(_) => {}
        }
        self.notify();
        result
    }

    fn notify(&self) {
        // Clone out so the listener runs without our lock held
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn transport_error() -> RemoteError {
        RemoteError::Disconnected {
            endpoint: "test".to_string(),
        }
    }

    /// Cache whose n-th successful fetch yields n; fails while `fail` is set.
    fn counting_cache(calls: Arc<AtomicUsize>, fail: Arc<AtomicBool>) -> FetchCache<usize> {
        FetchCache::new("counter", move || {
            let calls = calls.clone();
            let fail = fail.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if fail.load(Ordering::SeqCst) {
                    Err(transport_error())
                } else {
                    Ok(n)
                }
            }
        })
    }

    fn counting_listener(count: Arc<AtomicUsize>) -> CacheListener {
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_refresh_success_notifies_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notified = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone(), Arc::new(AtomicBool::new(false)))
            .with_listener(counting_listener(notified.clone()));

        assert_eq!(cache.state(), CacheState::Unfetched);
        assert_eq!(cache.refresh().await.unwrap(), 1);

        assert_eq!(cache.state(), CacheState::Fresh);
        assert_eq!(cache.peek(), Some(1));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        let notified = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone(), fail.clone())
            .with_listener(counting_listener(notified.clone()));

        cache.refresh().await.unwrap();
        fail.store(true, Ordering::SeqCst);
        assert!(cache.refresh().await.is_err());

        assert_eq!(cache.state(), CacheState::Error);
        assert_eq!(cache.peek(), Some(1), "Failed fetch must not overwrite the value");
        assert_eq!(notified.load(Ordering::SeqCst), 2, "Listener fires per attempt");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_value_fetches_only_when_unfetched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone(), Arc::new(AtomicBool::new(false)));

        assert_eq!(cache.value().await, Some(1));
        assert_eq!(cache.value().await, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_value_after_error_does_not_refetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone(), Arc::new(AtomicBool::new(true)));

        assert_eq!(cache.value().await, None);
        assert_eq!(cache.value().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_reads_fetch_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone(), Arc::new(AtomicBool::new(false)));

        let (a, b) = tokio::join!(cache.value(), cache.value());
        assert_eq!(a, Some(1));
        assert_eq!(b, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refreshes_are_serialized() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let notified = Arc::new(AtomicUsize::new(0));
        let cache = {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            FetchCache::new("slow", move || {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, RemoteError>(now)
                }
            })
            .with_listener(counting_listener(notified.clone()))
        };

        let (a, b, c) = tokio::join!(cache.refresh(), cache.refresh(), cache.refresh());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_marks_error() {
        let cache = FetchCache::new("stuck", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RemoteError>(0u8)
        })
        .with_timeout(Some(Duration::from_millis(20)));

        let err = cache.refresh().await.unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { operation: "stuck", .. }));
        assert_eq!(cache.state(), CacheState::Error);
    }

    #[tokio::test]
    async fn test_refresh_unless_fresh_retries_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let cache = counting_cache(calls.clone(), fail.clone());

        assert!(cache.refresh_unless_fresh().await.is_err());
        fail.store(false, Ordering::SeqCst);
        cache.refresh_unless_fresh().await.unwrap();
        cache.refresh_unless_fresh().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2, "Fresh cache should not refetch");
        assert_eq!(cache.peek(), Some(2));
    }
}
