use adaptive_throttle::cache::{Cache, CacheAdapter, MemoryCache};
use adaptive_throttle::clock::ManualClock;
use adaptive_throttle::error::{Result, ThrottlerError};
use adaptive_throttle::throttle_config::Consistency;
use adaptive_throttle::{RequestContext, ThrottleConfig, ThrottleEngine, ThrottleReason};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const BROWSER: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/126.0";
const AI_AGENT: &str = "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; GPTBot/1.1)";

fn engine_with(config: ThrottleConfig) -> (ThrottleEngine, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let cache = Cache::new(Arc::new(MemoryCache::new(10_000).unwrap()));
    let engine = ThrottleEngine::new(config, cache)
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    (engine, clock)
}

async fn check(engine: &ThrottleEngine, ip: &str, ua: &str) -> adaptive_throttle::ThrottleResult {
    assert_ok!(engine.check(ip, ua, &RequestContext::new()).await)
}

#[tokio::test]
async fn allows_requests_under_the_limit() {
    let (engine, _) = engine_with(ThrottleConfig::new(10, 60_000));

    for _ in 0..10 {
        let result = check(&engine, "198.51.100.1", BROWSER).await;
        assert!(!result.restricted);
        assert_eq!(result.reason, Some(ThrottleReason::Ok));
    }
}

#[tokio::test]
async fn sixth_request_over_a_limit_of_five_is_denied() {
    let (engine, _) = engine_with(ThrottleConfig::new(5, 60_000));

    for _ in 0..5 {
        assert!(!check(&engine, "198.51.100.2", BROWSER).await.restricted);
    }

    let sixth = check(&engine, "198.51.100.2", BROWSER).await;
    assert!(sixth.restricted);
    assert_eq!(sixth.reason, Some(ThrottleReason::SlidingWindow));
}

#[tokio::test]
async fn window_slides_once_old_hits_age_out() {
    let (engine, clock) = engine_with(ThrottleConfig::new(2, 1_000).with_ban(100, 60_000));

    check(&engine, "198.51.100.3", BROWSER).await;
    check(&engine, "198.51.100.3", BROWSER).await;
    assert!(check(&engine, "198.51.100.3", BROWSER).await.restricted);

    clock.advance(Duration::from_millis(1_001));
    assert!(!check(&engine, "198.51.100.3", BROWSER).await.restricted);
}

#[tokio::test]
async fn burst_limit_is_checked_before_the_window() {
    let config = ThrottleConfig::new(100, 60_000).with_burst(3, 1_000);
    let (engine, clock) = engine_with(config);

    for _ in 0..3 {
        assert!(!check(&engine, "198.51.100.4", BROWSER).await.restricted);
    }
    let fourth = check(&engine, "198.51.100.4", BROWSER).await;
    assert_eq!(fourth.reason, Some(ThrottleReason::BurstLimit));

    clock.advance(Duration::from_millis(1_001));
    assert!(!check(&engine, "198.51.100.4", BROWSER).await.restricted);
}

#[tokio::test]
async fn repeated_violations_ban_the_ip_for_every_user_agent() {
    let config = ThrottleConfig::new(1, 1_000).with_ban(2, 60_000);
    let (engine, _) = engine_with(config);

    assert!(!check(&engine, "198.51.100.5", BROWSER).await.restricted);
    assert_eq!(
        check(&engine, "198.51.100.5", BROWSER).await.reason,
        Some(ThrottleReason::SlidingWindow)
    );
    assert_eq!(
        check(&engine, "198.51.100.5", BROWSER).await.reason,
        Some(ThrottleReason::SlidingWindow)
    );

    let banned = check(&engine, "198.51.100.5", BROWSER).await;
    assert_eq!(banned.reason, Some(ThrottleReason::AutoBan));

    let other_agent = check(&engine, "198.51.100.5", "Mozilla/5.0 (Macintosh) Safari/605.1").await;
    assert_eq!(other_agent.reason, Some(ThrottleReason::AutoBan));

    let other_ip = check(&engine, "198.51.100.6", BROWSER).await;
    assert!(!other_ip.restricted);
}

#[tokio::test]
async fn ban_expiry_restores_normal_evaluation() {
    let config = ThrottleConfig::new(1, 1_000).with_ban(1, 30_000);
    let (engine, clock) = engine_with(config);

    check(&engine, "198.51.100.7", BROWSER).await;
    check(&engine, "198.51.100.7", BROWSER).await;
    assert_eq!(
        check(&engine, "198.51.100.7", BROWSER).await.reason,
        Some(ThrottleReason::AutoBan)
    );

    clock.advance(Duration::from_millis(30_001));
    let status = assert_ok!(engine.status("198.51.100.7", BROWSER).await);
    assert!(!status.banned);

    let result = check(&engine, "198.51.100.7", BROWSER).await;
    assert_eq!(result.reason, Some(ThrottleReason::Ok));
}

#[tokio::test]
async fn ai_agents_exhaust_the_window_ten_times_faster() {
    let config = ThrottleConfig::new(20, 60_000).with_burst(1_000, 1_000);
    let (engine, _) = engine_with(config);

    let first = check(&engine, "198.51.100.8", AI_AGENT).await;
    assert!(!first.restricted);
    let classification = first.ua_classification.unwrap();
    assert!(classification.is_ai);
    assert!(classification.is_bot);

    assert!(!check(&engine, "198.51.100.8", AI_AGENT).await.restricted);
    assert_eq!(
        check(&engine, "198.51.100.8", AI_AGENT).await.reason,
        Some(ThrottleReason::SlidingWindow)
    );

    for _ in 0..20 {
        assert!(!check(&engine, "198.51.100.9", BROWSER).await.restricted);
    }
    assert!(check(&engine, "198.51.100.9", BROWSER).await.restricted);
}

#[tokio::test]
async fn bypass_touches_no_state() {
    let (engine, _) = engine_with(ThrottleConfig::new(1, 60_000));

    for _ in 0..5 {
        let result = assert_ok!(
            engine
                .check("198.51.100.10", BROWSER, &RequestContext::bypassed())
                .await
        );
        assert!(!result.restricted);
        assert!(result.bypassed);
        assert_eq!(result.reason, None);
    }

    assert!(assert_ok!(engine.cache().keys(None).await).is_empty());
    assert!(!check(&engine, "198.51.100.10", BROWSER).await.restricted);
}

#[tokio::test]
async fn rotating_user_agents_are_denied_at_the_threshold() {
    let config = ThrottleConfig::new(1_000, 60_000).with_ua_rotation(3, 60_000);
    let (engine, clock) = engine_with(config);

    for i in 0..3 {
        let ua = format!("Mozilla/5.0 Rotator/{}", i);
        assert!(!check(&engine, "198.51.100.11", &ua).await.restricted);
    }

    let crossing = check(&engine, "198.51.100.11", "Mozilla/5.0 Rotator/3").await;
    assert_eq!(crossing.reason, Some(ThrottleReason::UaRotation));

    // known agents keep working, and the rejected one was not recorded
    assert!(!check(&engine, "198.51.100.11", "Mozilla/5.0 Rotator/0").await.restricted);
    let status = assert_ok!(engine.status("198.51.100.11", "Mozilla/5.0 Rotator/0").await);
    assert_eq!(status.tracked_user_agents, 3);

    clock.advance(Duration::from_millis(60_001));
    assert!(!check(&engine, "198.51.100.11", "Mozilla/5.0 Rotator/3").await.restricted);
}

#[tokio::test]
async fn wildcard_in_client_ip_cannot_reach_other_records() {
    let (engine, _) = engine_with(ThrottleConfig::new(5, 60_000));

    check(&engine, "198.51.100.12", BROWSER).await;
    check(&engine, "198.51.100.13", BROWSER).await;

    let removed = assert_ok!(engine.reset("*").await);
    assert_eq!(removed, 0);
    assert_eq!(assert_ok!(engine.cache().keys(Some("throttle:198.51.100.1*")).await).len(), 2);
}

#[tokio::test]
async fn reset_leaves_longer_ipv6_neighbours_alone() {
    let (engine, _) = engine_with(ThrottleConfig::new(1, 60_000));

    check(&engine, "2001:db8::1", BROWSER).await;
    check(&engine, "2001:db8::1:5", BROWSER).await;
    assert_eq!(
        check(&engine, "2001:db8::1:5", BROWSER).await.reason,
        Some(ThrottleReason::SlidingWindow)
    );

    // record + rotation set of 2001:db8::1 only
    assert_eq!(assert_ok!(engine.reset("2001:db8::1").await), 2);

    let neighbour = assert_ok!(engine.status("2001:db8::1:5", BROWSER).await);
    assert_eq!(neighbour.window_usage, 1);
    assert_eq!(neighbour.violations, 1);
    assert_eq!(
        check(&engine, "2001:db8::1:5", BROWSER).await.reason,
        Some(ThrottleReason::SlidingWindow)
    );
}

#[tokio::test]
async fn reset_of_a_key_family_name_touches_no_other_ip() {
    let (engine, _) = engine_with(ThrottleConfig::new(5, 60_000));

    check(&engine, "10.0.0.1", BROWSER).await;
    check(&engine, "10.0.0.2", BROWSER).await;

    assert_eq!(assert_ok!(engine.reset("ua").await), 0);
    assert_eq!(assert_ok!(engine.reset("ban").await), 0);

    let rotation_sets = assert_ok!(engine.cache().keys(Some("throttle:ua:*")).await);
    assert_eq!(rotation_sets.len(), 2);
    assert_eq!(assert_ok!(engine.status("10.0.0.1", BROWSER).await).tracked_user_agents, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn strict_consistency_admits_exactly_the_limit() {
    let config = ThrottleConfig::new(10, 60_000)
        .with_burst(1_000, 1_000)
        .with_consistency(Consistency::Strict);
    let (engine, _) = engine_with(config);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .check("198.51.100.14", BROWSER, &RequestContext::new())
                    .await
            })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        if !result.restricted {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
}

struct FailingAdapter;

#[async_trait]
impl CacheAdapter for FailingAdapter {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Err(ThrottlerError::AdapterOperation("connection reset".into()))
    }

    async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<bool> {
        Err(ThrottlerError::AdapterOperation("connection reset".into()))
    }

    async fn delete(&self, _key: &str) -> Result<usize> {
        Err(ThrottlerError::AdapterOperation("connection reset".into()))
    }

    async fn has(&self, _key: &str) -> Result<bool> {
        Err(ThrottlerError::AdapterOperation("connection reset".into()))
    }

    async fn clear(&self) -> Result<usize> {
        Err(ThrottlerError::AdapterOperation("connection reset".into()))
    }

    async fn keys(&self, _pattern: Option<&str>) -> Result<Vec<String>> {
        Err(ThrottlerError::AdapterOperation("connection reset".into()))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn store_failures_propagate_from_check() {
    let engine = ThrottleEngine::new(
        ThrottleConfig::new(5, 60_000),
        Cache::new(Arc::new(FailingAdapter)),
    )
    .unwrap();

    let err = assert_err!(engine.check("198.51.100.15", BROWSER, &RequestContext::new()).await);
    assert!(matches!(err, ThrottlerError::AdapterOperation(_)));
    assert!(err.is_store_failure());

    // decisions that never reach the store still succeed
    let invalid = assert_ok!(engine.check("", BROWSER, &RequestContext::new()).await);
    assert_eq!(invalid.reason, Some(ThrottleReason::InvalidIdentity));
    let bypassed = assert_ok!(
        engine
            .check("198.51.100.15", BROWSER, &RequestContext::bypassed())
            .await
    );
    assert!(bypassed.bypassed);
}

struct SlowAdapter {
    inner: MemoryCache,
    delay: Duration,
}

#[async_trait]
impl CacheAdapter for SlowAdapter {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<usize> {
        self.inner.delete(key).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.inner.has(key).await
    }

    async fn clear(&self) -> Result<usize> {
        self.inner.clear().await
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}

#[tokio::test]
async fn slow_store_calls_time_out() {
    let adapter = SlowAdapter {
        inner: MemoryCache::new(100).unwrap(),
        delay: Duration::from_millis(500),
    };
    let config = ThrottleConfig::new(5, 60_000).with_store_timeout(Duration::from_millis(20));
    let engine = ThrottleEngine::new(config, Cache::new(Arc::new(adapter))).unwrap();

    let err = assert_err!(engine.check("198.51.100.16", BROWSER, &RequestContext::new()).await);
    assert!(matches!(err, ThrottlerError::StoreTimeout(_)));
    assert!(err.is_store_failure());
}
