//! Per-route rate limit buckets shared by every request of a client.
//!
//! Each normalized route owns an async mutex around its bucket. The dispatcher
//! holds that lock from the pre-emptive check until the response headers have
//! been written back, so two concurrent calls to the same route cannot both
//! slip past an exhausted bucket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use serde::Deserialize;
use tokio::sync::OwnedMutexGuard;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const GLOBAL_HEADER: &str = "x-ratelimit-global";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Path segments whose ids identify a distinct bucket rather than a resource.
const MAJOR_PARAMETERS: [&str; 3] = ["channels", "guilds", "webhooks"];

/// Last known allowance for one route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which `remaining` refills.
    pub reset_at_ms: u64,
}

impl RateLimitBucket {
    /// Reads the limit, remaining and reset headers. Returns `None` unless
    /// all three are present and well formed.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let limit = header_str(headers, LIMIT_HEADER)?.parse().ok()?;
        let remaining = header_str(headers, REMAINING_HEADER)?.parse().ok()?;
        let reset_secs: f64 = header_str(headers, RESET_HEADER)?.parse().ok()?;
        if !reset_secs.is_finite() || reset_secs < 0.0 {
            return None;
        }

        Some(Self {
            limit,
            remaining,
            reset_at_ms: (reset_secs * 1000.0).round() as u64,
        })
    }

    /// `remaining` only counts until the reset instant has passed.
    pub fn is_exhausted(&self, now_ms: u64) -> bool {
        self.remaining == 0 && now_ms < self.reset_at_ms
    }

    pub fn wait_duration(&self, now_ms: u64) -> Option<Duration> {
        self.is_exhausted(now_ms)
            .then(|| Duration::from_millis(self.reset_at_ms - now_ms))
    }
}

/// Shared store of route buckets plus the global throttle deadline.
#[derive(Debug, Default)]
pub struct BucketStore {
    routes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<RateLimitBucket>>>>>,
    global_until_ms: Mutex<Option<u64>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive use of the route `endpoint` normalizes to.
    pub async fn lock(&self, endpoint: &str) -> RouteGuard {
        let key = route_key(endpoint);
        let slot = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(routes.entry(key.clone()).or_default())
        };
        RouteGuard {
            key,
            bucket: slot.lock_owned().await,
        }
    }

    /// Copy of the bucket currently stored for `endpoint`.
    pub async fn bucket(&self, endpoint: &str) -> Option<RateLimitBucket> {
        *self.lock(endpoint).await.bucket
    }

    pub fn set_global_until(&self, until_ms: u64) {
        let mut global = self
            .global_until_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *global = Some((*global).map_or(until_ms, |current| current.max(until_ms)));
    }

    pub fn global_wait(&self, now_ms: u64) -> Option<Duration> {
        let global = self
            .global_until_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (*global)
            .filter(|until| now_ms < *until)
            .map(|until| Duration::from_millis(until - now_ms))
    }
}

/// Exclusive access to one route's bucket.
#[derive(Debug)]
pub struct RouteGuard {
    key: String,
    bucket: OwnedMutexGuard<Option<RateLimitBucket>>,
}

impl RouteGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket(&self) -> Option<RateLimitBucket> {
        *self.bucket
    }

    pub fn wait_duration(&self, now_ms: u64) -> Option<Duration> {
        (*self.bucket).and_then(|bucket| bucket.wait_duration(now_ms))
    }

    pub fn update(&mut self, bucket: RateLimitBucket) {
        *self.bucket = Some(bucket);
    }
}

/// Collapses resource ids so requests sharing a server bucket share a key.
///
/// Ids directly after `channels`, `guilds` or `webhooks` are kept because the
/// server buckets those per id.
pub fn route_key(endpoint: &str) -> String {
    let path = endpoint
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');

    let mut previous = "";
    let mut segments = Vec::new();
    for segment in path.split('/') {
        let is_id = !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit());
        if is_id && !MAJOR_PARAMETERS.contains(&previous) {
            segments.push(":id");
        } else {
            segments.push(segment);
        }
        previous = segment;
    }
    segments.join("/")
}

/// Throttling details from a 429 response.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Throttle {
    pub retry_after: Option<Duration>,
    pub global: bool,
}

impl Throttle {
    /// Prefers the `retry-after` header and falls back to the JSON body.
    pub fn from_response(headers: &HeaderMap, body: &str) -> Self {
        #[derive(Debug, Default, Deserialize)]
        struct ThrottleBody {
            #[serde(default)]
            retry_after: Option<f64>,
            #[serde(default)]
            global: bool,
        }

        let parsed: ThrottleBody = serde_json::from_str(body).unwrap_or_default();
        let retry_after = header_str(headers, RETRY_AFTER_HEADER)
            .and_then(|value| value.parse::<f64>().ok())
            .or(parsed.retry_after)
            .and_then(seconds_to_duration);
        let global = header_str(headers, GLOBAL_HEADER)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
            || parsed.global;

        Self {
            retry_after,
            global,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Negative and NaN hints are unusable; hints past `Duration::MAX` saturate.
fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderValue};
    use tokio::time::Instant;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn bucket_reads_all_three_headers() {
        let bucket = RateLimitBucket::from_headers(&headers(&[
            (LIMIT_HEADER, "5"),
            (REMAINING_HEADER, "0"),
            (RESET_HEADER, "1470173023.123"),
        ]))
        .expect("bucket");
        assert_eq!(bucket.limit, 5);
        assert_eq!(bucket.remaining, 0);
        assert_eq!(bucket.reset_at_ms, 1_470_173_023_123);
    }

    #[test]
    fn partial_headers_leave_bucket_unset() {
        assert_eq!(
            RateLimitBucket::from_headers(&headers(&[
                (LIMIT_HEADER, "5"),
                (REMAINING_HEADER, "4"),
            ])),
            None
        );
        assert_eq!(RateLimitBucket::from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn remaining_is_ignored_after_reset() {
        let bucket = RateLimitBucket {
            limit: 5,
            remaining: 0,
            reset_at_ms: 10_000,
        };
        assert!(bucket.is_exhausted(9_000));
        assert_eq!(bucket.wait_duration(9_000), Some(Duration::from_millis(1_000)));
        assert!(!bucket.is_exhausted(10_000));
        assert!(!bucket.is_exhausted(10_001));
        assert_eq!(bucket.wait_duration(10_001), None);

        let open = RateLimitBucket {
            remaining: 1,
            ..bucket
        };
        assert!(!open.is_exhausted(0));
    }

    #[test]
    fn route_key_keeps_major_parameters() {
        assert_eq!(
            route_key("/channels/123/messages/456"),
            "/channels/123/messages/:id"
        );
        assert_eq!(route_key("/guilds/9/members/77?limit=5"), "/guilds/9/members/:id");
        assert_eq!(route_key("/users/@me/"), "/users/@me");
        assert_eq!(
            route_key("/webhooks/42/abcToken/messages/7"),
            "/webhooks/42/abcToken/messages/:id"
        );
    }

    #[test]
    fn throttle_prefers_header_over_body() {
        let throttle = Throttle::from_response(
            &headers(&[(RETRY_AFTER_HEADER, "2")]),
            r#"{"retry_after": 9.5, "global": false}"#,
        );
        assert_eq!(throttle.retry_after, Some(Duration::from_secs(2)));
        assert!(!throttle.global);

        let throttle = Throttle::from_response(
            &headers(&[(GLOBAL_HEADER, "true")]),
            r#"{"retry_after": 0.25}"#,
        );
        assert_eq!(throttle.retry_after, Some(Duration::from_millis(250)));
        assert!(throttle.global);

        let throttle = Throttle::from_response(&HeaderMap::new(), "not json");
        assert_eq!(throttle.retry_after, None);
    }

    #[test]
    fn oversized_retry_hint_saturates() {
        let throttle = Throttle::from_response(&headers(&[(RETRY_AFTER_HEADER, "1e20")]), "");
        assert_eq!(throttle.retry_after, Some(Duration::MAX));

        let throttle = Throttle::from_response(&HeaderMap::new(), r#"{"retry_after": 1e300}"#);
        assert_eq!(throttle.retry_after, Some(Duration::MAX));

        let throttle = Throttle::from_response(&headers(&[(RETRY_AFTER_HEADER, "-3")]), "");
        assert_eq!(throttle.retry_after, None);
    }

    #[test]
    fn global_throttle_only_extends() {
        let store = BucketStore::new();
        assert_eq!(store.global_wait(0), None);
        store.set_global_until(5_000);
        store.set_global_until(2_000);
        assert_eq!(store.global_wait(4_000), Some(Duration::from_millis(1_000)));
        assert_eq!(store.global_wait(5_000), None);
    }

    #[tokio::test(start_paused = true)]
    async fn same_route_is_serialized() {
        let store = Arc::new(BucketStore::new());
        let started = Instant::now();

        let first = store.lock("/channels/1/messages/10").await;
        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let _guard = store.lock("/channels/1/messages/11").await;
                Instant::now()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(first);

        let acquired_at = contender.await.expect("join");
        assert!(acquired_at.duration_since(started) >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn distinct_routes_do_not_block_each_other() {
        let store = BucketStore::new();
        let mut first = store.lock("/channels/1/messages").await;
        first.update(RateLimitBucket {
            limit: 1,
            remaining: 0,
            reset_at_ms: u64::MAX,
        });

        let second = tokio::time::timeout(
            Duration::from_millis(50),
            store.lock("/channels/2/messages"),
        )
        .await
        .expect("independent route");
        assert_eq!(second.bucket(), None);
        drop(second);
        drop(first);

        assert_eq!(
            store.bucket("/channels/1/messages").await.map(|b| b.remaining),
            Some(0)
        );
    }
}
