//! Summarization scheduling
//!
//! Two triggers feed the same background summary routine: an inline count
//! check after each completed exchange, and a periodic sweep that catches
//! sessions left idle since their last summary. Summaries run as bounded
//! background tasks; the counter is reset when a task is scheduled, not
//! when it succeeds, so a failed summary drops that window's turns (the
//! loss is visible in logs).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{MnemosyneError, Result};
use crate::prompt::format_transcript;
use crate::session::{SessionStore, TurnCounter};
use crate::storage::{NewMemory, VectorStore};
use crate::summarizer::SummaryProvider;

/// Removes the session's in-flight marker when the task finishes, however
/// it finishes.
struct InFlightGuard {
    map: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

pub struct SummaryScheduler {
    sessions: Arc<SessionStore>,
    counter: Arc<TurnCounter>,
    embedder: Arc<dyn EmbeddingProvider>,
    summarizer: Arc<dyn SummaryProvider>,
    store: Arc<dyn VectorStore>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, ()>>,
    shutdown_tx: watch::Sender<bool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SummaryScheduler {
    pub fn new(
        sessions: Arc<SessionStore>,
        counter: Arc<TurnCounter>,
        embedder: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn SummaryProvider>,
        store: Arc<dyn VectorStore>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_summaries.max(1)));

        Self {
            sessions,
            counter,
            embedder,
            summarizer,
            store,
            config,
            semaphore,
            in_flight: Arc::new(DashMap::new()),
            shutdown_tx,
            sweep_handle: Mutex::new(None),
        }
    }

    /// Inline trigger, run after each completed exchange. Reconciles the
    /// counter against the session history first; a corrected counter skips
    /// this round's threshold check entirely.
    pub async fn check_inline(&self, session_id: &str, persona_id: Option<String>) -> Result<()> {
        let history_len = self.sessions.history_len(session_id) as i64;
        if !self.counter.reconcile(session_id, history_len).await? {
            return Ok(());
        }

        let count = self.counter.get(session_id).await?;
        if count < self.config.pair_threshold as i64 {
            return Ok(());
        }

        tracing::info!(session_id, count, "Turn threshold reached, summarizing");
        let turns = self
            .sessions
            .recent_turns(session_id, self.config.pair_threshold);
        let transcript = format_transcript(&turns);

        self.spawn_summary(session_id.to_string(), persona_id, transcript);
        self.counter.reset(session_id).await?;

        Ok(())
    }

    /// One pass of the idle sweep. A non-positive idle threshold disables
    /// time-based summarization.
    pub async fn sweep_once(&self) {
        if self.config.idle_threshold_secs <= 0 {
            return;
        }

        let now = Utc::now();
        for snapshot in self.sessions.snapshot() {
            let session_id = snapshot.session_id;

            let count = match self.counter.get(&session_id).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "Failed to read counter in sweep");
                    continue;
                }
            };
            if count <= 0 {
                continue;
            }

            let idle_secs = (now - snapshot.last_summary_time).num_seconds();
            if idle_secs <= self.config.idle_threshold_secs {
                continue;
            }

            tracing::info!(
                session_id,
                idle_secs,
                count,
                "Idle threshold exceeded, summarizing"
            );

            // The counter value is exactly the number of unsummarized turns
            let turns = self.sessions.recent_turns(&session_id, count as usize);
            let transcript = format_transcript(&turns);

            self.spawn_summary(session_id.clone(), snapshot.persona_id, transcript);

            if let Err(e) = self.counter.reset(&session_id).await {
                tracing::error!(session_id, error = %e, "Failed to reset counter after sweep");
            }
            self.sessions.set_last_summary_time(&session_id, now);
        }
    }

    /// Schedule a background summary for this session. At most one summary
    /// per session runs at a time; duplicates are dropped.
    fn spawn_summary(&self, session_id: String, persona_id: Option<String>, transcript: String) {
        match self.in_flight.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(session_id, "Summary already in flight, skipping");
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(());
            }
        }

        let guard = InFlightGuard {
            map: Arc::clone(&self.in_flight),
            key: session_id.clone(),
        };
        let semaphore = Arc::clone(&self.semaphore);
        let summarizer = Arc::clone(&self.summarizer);
        let embedder = Arc::clone(&self.embedder);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            if let Err(e) =
                run_summary(summarizer, embedder, store, &session_id, persona_id, transcript).await
            {
                tracing::error!(session_id, error = %e, "Background summarization failed");
            }
        });
    }

    /// Start the periodic sweep loop.
    pub async fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            tracing::info!(
                check_interval_secs = scheduler.config.check_interval_secs,
                idle_threshold_secs = scheduler.config.idle_threshold_secs,
                "Idle sweep started"
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        scheduler.sweep_once().await;
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Idle sweep stopped");
        });

        *self.sweep_handle.lock().await = Some(handle);
    }

    /// Stop the sweep loop and give in-flight summaries a bounded grace
    /// period to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.sweep_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sweep task ended abnormally");
            }
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.shutdown_grace_secs);
        while !self.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.in_flight.len();
        if remaining > 0 {
            tracing::warn!(remaining, "Shutting down with summaries still in flight");
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// The summary routine proper: validate the transcript, condense it, embed
/// the result, and persist it.
async fn run_summary(
    summarizer: Arc<dyn SummaryProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    session_id: &str,
    persona_id: Option<String>,
    transcript: String,
) -> Result<()> {
    if transcript.trim().is_empty() {
        tracing::debug!(session_id, "Empty transcript, nothing to summarize");
        return Ok(());
    }

    if !store.is_available().await {
        return Err(MnemosyneError::Storage(
            "Vector store unavailable, summary not stored".to_string(),
        ));
    }
    if !embedder.is_available().await {
        return Err(MnemosyneError::Embedding(
            "Embedding provider unavailable, summary not stored".to_string(),
        ));
    }

    let summary = summarizer.summarize(&transcript).await?;
    let embedding = embedder.embed(&summary).await?;

    let memory_id = store
        .insert(NewMemory::new(session_id, persona_id, summary, embedding))
        .await?;
    store.flush().await?;

    tracing::info!(session_id, memory_id, "Stored summarized memory");
    Ok(())
}
