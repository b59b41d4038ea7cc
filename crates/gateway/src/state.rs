//! Gateway composition root.
//!
//! Every subsystem lives as a field of the constructed [`Gateway`]
//! value; there are no process globals. Lifecycle: build → start →
//! shutdown.

use std::sync::Arc;

use pv_domain::chat::Role;
use pv_domain::config::Config;
use pv_domain::error::Result;
use pv_events::{EventBus, EventType};
use pv_memory::{
    ColdLayer, CypherGraph, ForgettingManager, GraphStore, HotLayer, LlmExtractor, MemGraph,
    MemoryService, MemoryStore, WarmLayer,
};
use pv_mcp_client::{McpDispatch, McpManager};
use pv_providers::{ChatClient, EmbeddingClient, OpenAiChatClient, OpenAiEmbeddingClient};
use pv_sessions::{MemorySync, SessionStore};
use pv_tools::{AgentDispatch, ToolService};

use crate::channels::ChannelRegistry;
use crate::config_service::ConfigService;
use crate::connection::ConnectionManager;
use crate::metrics::Metrics;
use crate::plugins::PluginRegistry;
use crate::runtime::Orchestrator;

/// Injected externals. [`Gateway::build`] fills these with the real
/// clients; tests substitute fakes.
pub struct GatewayDeps {
    pub chat: Arc<dyn ChatClient>,
    /// Memory-side LLM (classifier / extractor / summarizer).
    pub classifier: Arc<dyn ChatClient>,
    pub embeddings: Arc<dyn EmbeddingClient>,
    pub graph: Arc<dyn GraphStore>,
    pub agents: Option<Arc<dyn AgentDispatch>>,
}

/// The dependency container handed to every subsystem by reference.
pub struct Gateway {
    pub config: Arc<ConfigService>,
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    pub memory: Arc<MemoryService>,
    pub tools: Arc<ToolService>,
    pub mcp: Arc<McpManager>,
    pub agents: Option<Arc<dyn AgentDispatch>>,
    pub orchestrator: Arc<Orchestrator>,
    pub connections: Arc<ConnectionManager>,
    pub channels: Arc<ChannelRegistry>,
    pub plugins: Arc<PluginRegistry>,
    pub metrics: Arc<Metrics>,
    pub chat: Arc<dyn ChatClient>,
}

/// Bridges the session store's fire-and-forget memory sync onto the
/// memory store.
struct MemoryBridge {
    store: Arc<MemoryStore>,
}

impl MemorySync for MemoryBridge {
    fn on_message(&self, session_id: &str, role: Role, content: &str, user_id: &str) {
        let store = self.store.clone();
        let session_id = session_id.to_string();
        let content = content.to_string();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if store
                .add_message(&session_id, role.as_str(), &content, &user_id, None)
                .await
            {
                store.on_message_saved(&session_id, role.as_str(), &user_id);
            }
        });
    }
}

impl Gateway {
    /// Wire the gateway with the real external clients.
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let chat: Arc<dyn ChatClient> = Arc::new(OpenAiChatClient::from_config(&config.api)?);
        let (memory_key, memory_url, memory_model) = resolve_memory_api(&config);
        let classifier: Arc<dyn ChatClient> = if config.memory.api.use_main_api {
            chat.clone()
        } else {
            Arc::new(OpenAiChatClient::new(
                memory_key.clone(),
                memory_url.clone(),
                memory_model,
            )?)
        };
        let embeddings: Arc<dyn EmbeddingClient> = Arc::new(OpenAiEmbeddingClient::new(
            memory_key,
            memory_url,
            config.memory.warm_layer.embedding_model.clone(),
        )?);

        let graph: Arc<dyn GraphStore> = if config.memory.graph.http_url.is_empty() {
            tracing::info!("no graph endpoint configured, using in-memory store");
            Arc::new(MemGraph::new())
        } else {
            let cypher = CypherGraph::new(&config.memory.graph)?;
            cypher.bootstrap_schema().await;
            Arc::new(cypher)
        };

        Self::build_with(
            config,
            GatewayDeps {
                chat,
                classifier,
                embeddings,
                graph,
                agents: None,
            },
        )
        .await
    }

    /// Wire the gateway with injected externals. Construction order
    /// follows the dependency chain: config → bus → sessions →
    /// memory → tools → orchestrator → connections.
    pub async fn build_with(config: Config, deps: GatewayDeps) -> Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let metrics = Arc::new(Metrics::new());

        let state_dir = config.sessions.state_dir.clone();
        let config_service = Arc::new(ConfigService::new(
            state_dir.join("config"),
            config.clone(),
            bus.clone(),
        )?);

        let sessions = Arc::new(SessionStore::new(
            &state_dir,
            config.conversation.max_history_rounds,
        )?);

        // ── Memory stack ──────────────────────────────────────────
        let memory_model = if config.memory.api.use_main_api || config.memory.api.model.is_empty()
        {
            None
        } else {
            Some(config.memory.api.model.clone())
        };
        let extractor = LlmExtractor::new(deps.classifier.clone(), memory_model);
        let hot = HotLayer::new(deps.graph.clone(), extractor);
        let warm = WarmLayer::new(
            deps.graph.clone(),
            deps.embeddings.clone(),
            config.memory.warm_layer.clone(),
        );
        let cold = ColdLayer::new(
            deps.graph.clone(),
            deps.classifier.clone(),
            config.memory.cold_layer.clone(),
        );
        let forgetting =
            ForgettingManager::new(deps.graph.clone(), config.memory.forgetting.clone());
        let memory_store = Arc::new(MemoryStore::new(
            deps.graph.clone(),
            hot,
            warm,
            cold,
            forgetting,
            config.memory.clone(),
        ));
        let memory = Arc::new(MemoryService::new(
            memory_store.clone(),
            bus.clone(),
            deps.classifier.clone(),
            config.memory.clone(),
        ));
        memory.subscribe();
        sessions.set_memory_sync(Arc::new(MemoryBridge {
            store: memory_store,
        }));
        {
            let write_counter = metrics.clone();
            bus.on(EventType::MemorySaved, "metrics-memory-writes", move |_record| {
                let write_counter = write_counter.clone();
                async move {
                    Metrics::incr(&write_counter.memory_writes);
                }
            });
        }

        // ── Tools ─────────────────────────────────────────────────
        let mcp = Arc::new(McpManager::from_config(&config.mcp).await);
        let mcp_dispatch: Arc<dyn McpDispatch> = mcp.clone();
        let tools = Arc::new(ToolService::new(
            bus.clone(),
            mcp_dispatch,
            deps.agents.clone(),
        ));

        // ── Channels & plugins ────────────────────────────────────
        let channels = Arc::new(ChannelRegistry::new());
        let plugins = Arc::new(PluginRegistry::new());
        plugins.discover(&config.plugins.dir, &bus, &channels);
        if channels.get("web").is_none() {
            // The web channel always exists, plugins or not.
            channels.register(Arc::new(crate::channels::WebChannel::new(bus.clone())));
        }

        // ── Orchestrator ──────────────────────────────────────────
        let orchestrator = Arc::new(Orchestrator::new(
            bus.clone(),
            sessions.clone(),
            memory.clone(),
            config_service.clone(),
            deps.chat.clone(),
            tools.clone(),
            channels.clone(),
            metrics.clone(),
        ));
        orchestrator.subscribe();

        let connections = Arc::new(ConnectionManager::new(bus.clone()));

        Ok(Arc::new(Self {
            config: config_service,
            bus,
            sessions,
            memory,
            tools,
            mcp,
            agents: deps.agents,
            orchestrator,
            connections,
            channels,
            plugins,
            metrics,
            chat: deps.chat,
        }))
    }

    pub async fn shutdown(&self) {
        self.mcp.shutdown().await;
        tracing::info!("gateway shut down");
    }
}

/// Memory API endpoint: the dedicated memory.api section when
/// configured, the main api otherwise (empty fields fall back).
fn resolve_memory_api(config: &Config) -> (String, String, String) {
    let api = &config.api;
    let memory_api = &config.memory.api;
    if memory_api.use_main_api {
        (api.api_key.clone(), api.base_url.clone(), api.model.clone())
    } else {
        let pick = |specific: &str, fallback: &str| {
            if specific.is_empty() {
                fallback.to_string()
            } else {
                specific.to_string()
            }
        };
        (
            pick(&memory_api.api_key, &api.api_key),
            pick(&memory_api.base_url, &api.base_url),
            pick(&memory_api.model, &api.model),
        )
    }
}
