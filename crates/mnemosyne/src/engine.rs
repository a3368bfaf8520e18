//! Engine orchestration
//!
//! `MemoryEngine` ties the session store, counter, retrieval pipeline, and
//! scheduler together behind two hooks: one for each incoming user message
//! and one for each outgoing assistant response. Memory failures never
//! propagate to the conversation; the hooks log and degrade to doing
//! nothing.

use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{EmbeddingProvider, RemoteEmbedder};
use crate::error::Result;
use crate::prompt::{ChatRequest, EntryContent, MemoryInjector};
use crate::retrieval::RetrievalPipeline;
use crate::scheduler::SummaryScheduler;
use crate::session::{Role, SessionStore, Turn, TurnCounter};
use crate::storage::{LanceGateway, SearchFilter, VectorStore};
use crate::summarizer::{RemoteSummarizer, SummaryProvider};

/// Persona recorded when none is known but persona scoping is active
pub const PLACEHOLDER_PERSONA: &str = "UNKNOWN_PERSONA";

pub struct MemoryEngine {
    config: Config,
    sessions: Arc<SessionStore>,
    counter: Arc<TurnCounter>,
    injector: MemoryInjector,
    retrieval: RetrievalPipeline,
    scheduler: Arc<SummaryScheduler>,
}

impl MemoryEngine {
    /// Assemble an engine from explicit components. Useful when the caller
    /// provides its own providers or storage backend.
    pub fn new(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn SummaryProvider>,
        store: Arc<dyn VectorStore>,
        counter: Arc<TurnCounter>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.memory.max_history));
        let injector = MemoryInjector::new(&config.memory);
        let retrieval = RetrievalPipeline::new(
            Arc::clone(&embedder),
            Arc::clone(&store),
            &config.memory,
        );
        let scheduler = Arc::new(SummaryScheduler::new(
            Arc::clone(&sessions),
            Arc::clone(&counter),
            embedder,
            summarizer,
            store,
            config.scheduler.clone(),
        ));

        Self {
            config,
            sessions,
            counter,
            injector,
            retrieval,
            scheduler,
        }
    }

    /// Open an engine with the stock backends: LanceDB storage, SQLite
    /// counters, and remote embedding/summarization providers.
    pub async fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir)?;

        let store: Arc<dyn VectorStore> = Arc::new(
            LanceGateway::open(
                &config.storage.data_dir.join("vectors"),
                &config.storage.collection,
                config.embedding.dimension,
            )
            .await?,
        );
        let counter = Arc::new(
            TurnCounter::open(&config.storage.data_dir.join("turn_counts.db")).await?,
        );
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(RemoteEmbedder::new(&config.embedding)?);
        let summarizer: Arc<dyn SummaryProvider> =
            Arc::new(RemoteSummarizer::new(&config.summarizer)?);

        tracing::info!(
            data_dir = %config.storage.data_dir.display(),
            collection = %config.storage.collection,
            "Memory engine opened"
        );

        Ok(Self::new(config, embedder, summarizer, store, counter))
    }

    /// Start background work (the idle sweep).
    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    /// Stop background work, letting in-flight summaries finish within the
    /// configured grace period.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    /// Hook for each incoming user message, called before the request is
    /// sent to the LLM. Cleans stale memory blocks, records the turn, and
    /// splices in whatever relevant memories can be retrieved. Never fails;
    /// on any internal error the request goes out with no memories.
    pub async fn on_incoming_message(
        &self,
        session_id: &str,
        persona_id: Option<&str>,
        request: &mut ChatRequest,
    ) {
        if session_id.is_empty() {
            tracing::warn!("Empty session id, skipping memory processing");
            return;
        }

        let persona = self.resolve_persona(persona_id);

        if self.sessions.get_or_init(session_id, &seed_turns(request)) {
            tracing::debug!(session_id, "Session seeded from request context");
        }
        self.sessions.set_persona(session_id, persona.clone());

        // Scrub before anything else so even early returns leave the
        // request clean
        self.injector.cleanup(request);

        if request.prompt.trim().is_empty() {
            tracing::debug!(session_id, "Blank prompt, skipping retrieval");
            return;
        }

        self.sessions
            .append(session_id, Turn::user(request.prompt.clone()));
        if let Err(e) = self.counter.increment(session_id).await {
            tracing::error!(session_id, error = %e, "Failed to count user turn");
        }

        let mut filter = SearchFilter::new().with_session_id(session_id);
        if self.config.memory.persona_filtering {
            if let Some(persona) = &persona {
                filter = filter.with_persona_id(persona.clone());
            }
        }

        let hits = match self.retrieval.retrieve(&request.prompt, &filter).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Retrieval failed, continuing without memories");
                Vec::new()
            }
        };

        self.injector.inject(request, &hits);
    }

    /// Hook for each outgoing assistant response. Records the turn and
    /// runs the inline summarization check. Never fails.
    pub async fn on_outgoing_message(
        &self,
        session_id: &str,
        persona_id: Option<&str>,
        response: &str,
    ) {
        if session_id.is_empty() {
            tracing::warn!("Empty session id, skipping memory processing");
            return;
        }

        self.sessions
            .append(session_id, Turn::assistant(response.to_string()));
        if let Err(e) = self.counter.increment(session_id).await {
            tracing::error!(session_id, error = %e, "Failed to count assistant turn");
        }

        let persona = self.resolve_persona(persona_id);
        if let Err(e) = self.scheduler.check_inline(session_id, persona).await {
            tracing::error!(session_id, error = %e, "Inline summarization check failed");
        }
    }

    /// Resolve the effective persona: the conversation's persona, then the
    /// configured default, then the placeholder when persona scoping is
    /// active, then none.
    fn resolve_persona(&self, conversation_persona: Option<&str>) -> Option<String> {
        if let Some(persona) = conversation_persona {
            if !persona.is_empty() {
                return Some(persona.to_string());
            }
        }
        if let Some(default) = &self.config.memory.default_persona_id {
            return Some(default.clone());
        }
        if self.config.memory.persona_filtering {
            return Some(PLACEHOLDER_PERSONA.to_string());
        }
        None
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn counter(&self) -> &TurnCounter {
        &self.counter
    }
}

/// Turns derivable from a request's context, used to seed a session the
/// first time it is seen.
fn seed_turns(request: &ChatRequest) -> Vec<Turn> {
    request
        .context
        .iter()
        .filter(|entry| matches!(entry.role, Role::User | Role::Assistant))
        .filter_map(|entry| match &entry.content {
            EntryContent::Text(text) => Some(Turn::new(entry.role, text.clone())),
            EntryContent::Rich(_) => None,
        })
        .collect()
}
