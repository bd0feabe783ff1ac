//! Builds and owns the core components.
//!
//! The registry is created once at startup and shared behind an `Arc`; tests build
//! their own with scripted models and in-memory stores.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::{handler_fn, EventBus, EventPayload, Priority, INTERRUPT, RESPONSE_READY, SYSTEM_SHUTDOWN};
use crate::config::{CoreConfig, LlmMode, ShortTermBackend};
use crate::dialog::{DialogOrchestrator, SummarySelection};
use crate::error::CoreResult;
use crate::llm::{LanguageModel, LlmBackend};
use crate::memory::{
    InMemoryListStore, MemoryManager, ShortTermMemory, ShortTermStore, SledListStore,
    SqliteSummaryStore, Summarizer, SummaryStore,
};
use crate::router::TokenRouter;

const ROUTER_OWNER: &str = "TokenRouter";

pub struct RegistryBuilder {
    config: CoreConfig,
    models: HashMap<LlmMode, Arc<dyn LanguageModel>>,
    short_term_store: Option<Arc<dyn ShortTermStore>>,
    summary_store: Option<Arc<dyn SummaryStore>>,
    long_term_enabled: bool,
}

impl RegistryBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            models: HashMap::new(),
            short_term_store: None,
            summary_store: None,
            long_term_enabled: true,
        }
    }

    /// Use `model` wherever `mode` is configured instead of building a backend.
    pub fn with_model(mut self, mode: LlmMode, model: Arc<dyn LanguageModel>) -> Self {
        self.models.insert(mode, model);
        self
    }

    pub fn with_short_term_store(mut self, store: Arc<dyn ShortTermStore>) -> Self {
        self.short_term_store = Some(store);
        self
    }

    pub fn with_summary_store(mut self, store: Arc<dyn SummaryStore>) -> Self {
        self.summary_store = Some(store);
        self.long_term_enabled = true;
        self
    }

    /// Run with short-term memory only; compression reports `Disabled`.
    pub fn without_long_term(mut self) -> Self {
        self.summary_store = None;
        self.long_term_enabled = false;
        self
    }

    fn model_for(&mut self, mode: LlmMode) -> CoreResult<Arc<dyn LanguageModel>> {
        if let Some(model) = self.models.get(&mode) {
            return Ok(Arc::clone(model));
        }
        let model: Arc<dyn LanguageModel> = Arc::new(LlmBackend::from_config(mode, &self.config.llm)?);
        self.models.insert(mode, Arc::clone(&model));
        Ok(model)
    }

    /// Validate the config, build every component and register bus handlers.
    pub fn build(mut self) -> CoreResult<Arc<CoreRegistry>> {
        self.config.validate()?;

        let bus = Arc::new(EventBus::with_history_capacity(self.config.bus.history_capacity));
        let model = self.model_for(self.config.llm.mode)?;
        let summarizer_model = match self.config.memory.summarizer_mode {
            Some(mode) => self.model_for(mode)?,
            None => Arc::clone(&model),
        };

        let short_store: Arc<dyn ShortTermStore> = match self.short_term_store.take() {
            Some(store) => store,
            None => match self.config.memory.backend {
                ShortTermBackend::Memory => Arc::new(InMemoryListStore::new()),
                ShortTermBackend::Sled => Arc::new(SledListStore::open(self.config.short_term_path())?),
            },
        };
        let short_term = Arc::new(ShortTermMemory::new(
            short_store,
            self.config.memory.key_prefix.clone(),
            self.config.memory.capacity,
        ));

        let long_term: Option<Arc<dyn SummaryStore>> = match (self.summary_store.take(), self.long_term_enabled) {
            (Some(store), _) => Some(store),
            (None, true) => match SqliteSummaryStore::new(self.config.summary_db_path()) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(target: "chino::memory", error = %e, "summary store unavailable, long-term memory disabled");
                    None
                }
            },
            (None, false) => None,
        };
        let summarizer = long_term
            .as_ref()
            .map(|_| Arc::new(Summarizer::new(summarizer_model)));

        let memory = MemoryManager::new(
            Arc::clone(&bus),
            short_term,
            long_term,
            summarizer,
            self.config.memory.compression_policy(),
        );
        memory.register();

        let dialog = DialogOrchestrator::new(
            Arc::clone(&bus),
            Arc::clone(&model),
            Arc::clone(&memory),
            self.config.dialog.clone(),
            SummarySelection::from(&self.config.memory),
        );
        dialog.register();

        let router = Arc::new(TokenRouter::new(self.config.router.lanes)?);
        register_router(&bus, &router, self.config.router.passthrough);

        info!(
            target: "chino::registry",
            app = %self.config.app_name,
            llm_mode = self.config.llm.mode.as_str(),
            model = %model.name(),
            lanes = self.config.router.lanes,
            long_term = memory.long_term().is_some(),
            "🚀 core registry ready"
        );

        Ok(Arc::new(CoreRegistry {
            config: self.config,
            bus,
            model,
            memory,
            dialog,
            router,
        }))
    }
}

/// `response_ready` routes the reply; `interrupt` drops whatever is still queued.
/// In passthrough mode nothing synthesizes, so the reply is completed immediately.
fn register_router(bus: &Arc<EventBus>, router: &Arc<TokenRouter>, passthrough: bool) {
    let r = Arc::clone(router);
    bus.subscribe(
        RESPONSE_READY,
        handler_fn(move |event| {
            let r = Arc::clone(&r);
            async move {
                if let Some(reply) = event.response_ready() {
                    r.route(reply.sentences.clone(), Some(reply.response_id.clone()));
                    if passthrough {
                        r.process_all_sequential();
                    }
                }
                Ok(())
            }
        }),
        Priority::Normal,
        ROUTER_OWNER,
    );

    let r = Arc::clone(router);
    bus.subscribe(
        INTERRUPT,
        handler_fn(move |_event| {
            let r = Arc::clone(&r);
            async move {
                r.reset();
                Ok(())
            }
        }),
        Priority::High,
        ROUTER_OWNER,
    );
}

pub struct CoreRegistry {
    config: CoreConfig,
    bus: Arc<EventBus>,
    model: Arc<dyn LanguageModel>,
    memory: Arc<MemoryManager>,
    dialog: Arc<DialogOrchestrator>,
    router: Arc<TokenRouter>,
}

impl CoreRegistry {
    pub fn builder(config: CoreConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn dialog(&self) -> &Arc<DialogOrchestrator> {
        &self.dialog
    }

    pub fn router(&self) -> &Arc<TokenRouter> {
        &self.router
    }

    /// Stop the watchdog, announce shutdown, then drop every subscription.
    pub async fn shutdown(&self) {
        self.dialog.stop_watchdog();
        if let Err(e) = self.memory.short_term().flush() {
            warn!(target: "chino::memory", error = %e, "short-term flush failed");
        }
        let notified = self.bus.publish(SYSTEM_SHUTDOWN, EventPayload::Shutdown).await;
        self.bus.reset();
        info!(target: "chino::registry", notified, "core registry shut down");
    }
}
