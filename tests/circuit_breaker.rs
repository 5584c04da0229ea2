//! Circuit breaker behavior for Discord bot reconnection, exercised through
//! the public manager surface.

use omnihub::channels::discord_manager::{
    backoff_delay, CircuitBreaker, DiscordBotManager, FAILURE_THRESHOLD, MAX_CONNECT_ATTEMPTS,
};
use omnihub::config::{ChannelKind, InstanceConfig};
use omnihub::router::{MessageRouter, UserStore};
use omnihub::trace::TraceService;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn breaker_opens_on_third_consecutive_failure_and_blocks() {
    let mut breaker = CircuitBreaker::new();

    for i in 1..FAILURE_THRESHOLD {
        breaker.record_failure();
        assert!(
            !breaker.is_open(),
            "breaker must stay closed after failure {i}"
        );
        assert!(breaker.allows_attempt());
    }

    breaker.record_failure();
    assert!(breaker.is_open(), "third failure opens the breaker");
    assert!(!breaker.allows_attempt(), "open breaker blocks attempts");
    assert!(breaker.next_retry_in().is_some());
}

#[test]
fn breaker_closes_on_first_success_after_failures() {
    let mut breaker = CircuitBreaker::new();
    for _ in 0..FAILURE_THRESHOLD {
        breaker.record_failure();
    }
    assert!(breaker.is_open());

    breaker.record_success();
    assert!(!breaker.is_open());
    assert_eq!(breaker.consecutive_failures(), 0);

    // The failure count restarts from zero: two more failures don't re-open.
    breaker.record_failure();
    breaker.record_failure();
    assert!(!breaker.is_open());
}

#[test]
fn breaker_half_opens_after_recovery_timeout() {
    let mut breaker = CircuitBreaker::with_thresholds(3, Duration::from_millis(40));
    for _ in 0..3 {
        breaker.record_failure();
    }
    assert!(!breaker.allows_attempt());

    std::thread::sleep(Duration::from_millis(50));

    // One probe allowed once the timeout elapses.
    assert!(breaker.allows_attempt());
    // A failed probe re-opens immediately at the threshold.
    breaker.record_failure();
    assert!(breaker.is_open());
    assert!(!breaker.allows_attempt());
}

#[test]
fn permanent_failure_never_recovers() {
    let mut breaker = CircuitBreaker::with_thresholds(3, Duration::from_millis(1));
    breaker.open_permanently();
    std::thread::sleep(Duration::from_millis(20));
    assert!(!breaker.allows_attempt());
    assert!(breaker.next_retry_in().is_none());
}

#[test]
fn reconnect_backoff_is_exponential_capped_and_jittered() {
    // 2^attempt seconds with up to 10% jitter, capped at 60s.
    for (attempt, floor_secs, ceil_millis) in
        [(1u32, 2u64, 2200u64), (2, 4, 4400), (5, 32, 35200)]
    {
        let delay = backoff_delay(attempt);
        assert!(
            delay >= Duration::from_secs(floor_secs),
            "attempt {attempt} below base"
        );
        assert!(
            delay <= Duration::from_millis(ceil_millis),
            "attempt {attempt} above base + 10% jitter"
        );
    }

    let capped = backoff_delay(30);
    assert!(capped >= Duration::from_secs(60));
    assert!(capped <= Duration::from_secs(66));

    assert!(MAX_CONNECT_ATTEMPTS == 5);
}

#[tokio::test]
async fn manager_tracks_independent_bots() {
    let tmp = TempDir::new().unwrap();
    let router = Arc::new(MessageRouter::new(Arc::new(
        UserStore::open(&tmp.path().join("users.db")).unwrap(),
    )));
    let manager = DiscordBotManager::new(
        router,
        Arc::new(TraceService::disabled()),
        tmp.path().to_path_buf(),
    );

    let make = |name: &str| InstanceConfig {
        name: name.into(),
        channel_type: ChannelKind::Discord,
        discord_bot_token: Some(format!("fake-token-{name}")),
        ..InstanceConfig::default()
    };

    assert!(manager.start_bot(make("bot-a")).await);
    assert!(manager.start_bot(make("bot-b")).await);
    assert_eq!(manager.all_statuses().len(), 2);

    // Stopping one bot never disturbs the other.
    assert!(manager.stop_bot("bot-a").await);
    assert!(manager.bot_status("bot-a").is_none());
    assert!(manager.bot_status("bot-b").is_some());

    manager.shutdown().await;
    assert!(manager.all_statuses().is_empty());
}
