//! Idle sweep integration tests
//!
//! Runs the engine with its background sweep loop actually started and
//! verifies that idle sessions get condensed on the clock, that disabling
//! the idle threshold turns the sweep off, and that shutdown honors the
//! grace period for in-flight work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use mnemosyne::config::{Config, SchedulerConfig};
use mnemosyne::engine::MemoryEngine;
use mnemosyne::prompt::ChatRequest;
use mnemosyne::session::TurnCounter;
use mnemosyne::testing::{MockEmbedder, MockSummarizer, MockVectorStore};

struct Fixture {
    summarizer: Arc<MockSummarizer>,
    store: Arc<MockVectorStore>,
    engine: MemoryEngine,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn fixture(scheduler: SchedulerConfig) -> Fixture {
    init_tracing();
    let embedder = Arc::new(MockEmbedder::new(8));
    let summarizer = Arc::new(MockSummarizer::new("idle summary"));
    let store = Arc::new(MockVectorStore::new());
    let counter = Arc::new(TurnCounter::open_in_memory().await.unwrap());

    let config = Config {
        scheduler,
        ..Config::default()
    };
    let engine = MemoryEngine::new(
        config,
        embedder,
        summarizer.clone(),
        store.clone(),
        counter,
    );

    Fixture {
        summarizer,
        store,
        engine,
    }
}

fn sweep_config() -> SchedulerConfig {
    SchedulerConfig {
        // High enough that the inline trigger never fires in these tests
        pair_threshold: 100,
        check_interval_secs: 1,
        idle_threshold_secs: 60,
        shutdown_grace_secs: 2,
        max_concurrent_summaries: 4,
    }
}

async fn exchange(fx: &Fixture, session: &str, prompt: &str, response: &str) {
    let mut request = ChatRequest::new(prompt);
    fx.engine
        .on_incoming_message(session, None, &mut request)
        .await;
    fx.engine.on_outgoing_message(session, None, response).await;
}

fn backdate(fx: &Fixture, session: &str, hours: i64) {
    fx.engine
        .sessions()
        .set_last_summary_time(session, Utc::now() - ChronoDuration::hours(hours));
}

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

#[tokio::test]
async fn test_sweep_condenses_idle_session() {
    let fx = fixture(sweep_config()).await;

    exchange(&fx, "s1", "remember this", "will do").await;
    backdate(&fx, "s1", 2);

    fx.engine.start().await;

    let store = fx.store.clone();
    assert!(
        wait_for(move || store.contents().len() == 1, Duration::from_secs(5)).await,
        "Idle session was never summarized"
    );
    assert_eq!(fx.store.contents(), vec!["idle summary".to_string()]);
    assert_eq!(fx.engine.counter().get("s1").await.unwrap(), 0);

    // The sweep transcript covers exactly the unsummarized exchange
    let transcripts = fx.summarizer.transcripts();
    assert!(transcripts[0].contains("user:remember this"));
    assert!(transcripts[0].contains("assistant:will do"));

    fx.engine.shutdown().await;
}

#[tokio::test]
async fn test_sweep_fires_once_per_idle_window() {
    let fx = fixture(sweep_config()).await;

    exchange(&fx, "s1", "one thing", "noted").await;
    backdate(&fx, "s1", 2);

    fx.engine.start().await;

    let store = fx.store.clone();
    assert!(wait_for(move || store.contents().len() == 1, Duration::from_secs(5)).await);

    // With the counter reset and the summary time refreshed, further
    // sweep passes leave the session alone
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(fx.store.contents().len(), 1);
    assert_eq!(fx.summarizer.call_count(), 1);

    fx.engine.shutdown().await;
}

#[tokio::test]
async fn test_sweep_disabled_when_threshold_nonpositive() {
    let mut config = sweep_config();
    config.idle_threshold_secs = 0;
    let fx = fixture(config).await;

    exchange(&fx, "s1", "never swept", "ok").await;
    backdate(&fx, "s1", 48);

    fx.engine.start().await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(fx.summarizer.call_count(), 0);
    assert_eq!(fx.engine.counter().get("s1").await.unwrap(), 2);

    fx.engine.shutdown().await;
}

#[tokio::test]
async fn test_sweep_handles_sessions_independently() {
    let fx = fixture(sweep_config()).await;

    exchange(&fx, "idle", "old topic", "ok").await;
    exchange(&fx, "active", "fresh topic", "ok").await;
    backdate(&fx, "idle", 2);
    // "active" keeps its creation-time summary timestamp

    fx.engine.start().await;

    let store = fx.store.clone();
    assert!(wait_for(move || store.contents().len() == 1, Duration::from_secs(5)).await);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(fx.store.contents().len(), 1);
    assert_eq!(fx.engine.counter().get("idle").await.unwrap(), 0);
    assert_eq!(fx.engine.counter().get("active").await.unwrap(), 2);

    fx.engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_sweep_summary() {
    let fx = fixture(sweep_config()).await;
    fx.summarizer.set_delay(Some(Duration::from_millis(300)));

    exchange(&fx, "s1", "slow one", "ok").await;
    backdate(&fx, "s1", 2);

    fx.engine.start().await;

    // Wait until the sweep has picked the session up
    let summarizer = fx.summarizer.clone();
    assert!(wait_for(move || summarizer.call_count() == 1, Duration::from_secs(5)).await);

    // Shutdown overlaps the delayed summary; the grace period lets it land
    fx.engine.shutdown().await;
    assert_eq!(fx.store.contents().len(), 1);
}
