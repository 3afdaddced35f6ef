//! Engine container wiring every service together.
//!
//! Services are generic over repository traits; the container pins them to
//! the in-memory adapters and builds each one exactly once:
//! config -> provider -> repositories -> bus -> thread service -> step
//! executor -> fan-out orchestrator -> execution service.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docloom_core::event::bus::ProgressBus;
use docloom_core::execution::service::ExecutionService;
use docloom_core::fanout::orchestrator::FanOutOrchestrator;
use docloom_core::llm::box_provider::BoxLlmProvider;
use docloom_core::llm::retry::RetryPolicy;
use docloom_core::repository::memory::{
    InMemoryDocumentRepository, InMemoryExecutionRepository, InMemoryThreadRepository,
};
use docloom_core::step::executor::{GenerationSettings, StepExecutor};
use docloom_core::thread::service::ThreadService;
use docloom_types::config::EngineConfig;

use crate::config::load_engine_config;
use crate::llm::create_provider;

/// Concrete type aliases for the service generics pinned to infra implementations.
pub type ConcreteThreadService = ThreadService<InMemoryThreadRepository>;

pub type ConcreteStepExecutor = StepExecutor<InMemoryDocumentRepository, InMemoryThreadRepository>;

pub type ConcreteFanOutOrchestrator = FanOutOrchestrator<InMemoryDocumentRepository, InMemoryThreadRepository>;

pub type ConcreteExecutionService =
    ExecutionService<InMemoryDocumentRepository, InMemoryThreadRepository, InMemoryExecutionRepository>;

/// Shared engine state. Cloning shares every service.
#[derive(Clone)]
pub struct EngineContainer {
    pub config: Arc<EngineConfig>,
    pub documents: Arc<InMemoryDocumentRepository>,
    pub executions: Arc<InMemoryExecutionRepository>,
    pub threads: Arc<ConcreteThreadService>,
    pub bus: ProgressBus,
    pub executor: Arc<ConcreteStepExecutor>,
    pub fanout: Arc<ConcreteFanOutOrchestrator>,
    pub execution_service: Arc<ConcreteExecutionService>,
}

impl EngineContainer {
    /// Load `config_path`, install the tracing subscriber and wire services.
    ///
    /// Call once per process; a second call fails on the tracing subscriber.
    pub async fn init(config_path: &Path) -> anyhow::Result<Self> {
        let config = load_engine_config(config_path).await;
        docloom_observe::init_tracing(&config.logging)
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
        Self::from_config(config)
    }

    /// Wire services using the provider named in `config`.
    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let provider = create_provider(&config.provider)
            .with_context(|| format!("failed to create provider '{}'", config.provider.kind))?;
        Ok(Self::with_provider(config, provider))
    }

    /// Wire services around an already-built provider.
    pub fn with_provider(config: EngineConfig, provider: BoxLlmProvider) -> Self {
        let documents = Arc::new(InMemoryDocumentRepository::new());
        let executions = Arc::new(InMemoryExecutionRepository::new());
        let threads = Arc::new(ThreadService::new(InMemoryThreadRepository::new()));
        let bus = ProgressBus::new();

        let executor = Arc::new(
            StepExecutor::new(
                Arc::new(provider),
                Arc::clone(&documents),
                Arc::clone(&threads),
                bus.clone(),
                GenerationSettings::from_config(&config.provider, &config.executor),
            )
            .with_retry_policy(RetryPolicy::from(&config.retry)),
        );

        let fanout = Arc::new(FanOutOrchestrator::new(
            Arc::clone(&executor),
            Arc::clone(&threads),
            Arc::clone(&documents),
            bus.clone(),
            config.fanout.max_concurrency,
        ));

        let execution_service = Arc::new(ExecutionService::new(
            Arc::clone(&executor),
            Arc::clone(&threads),
            Arc::clone(&executions),
            Duration::from_secs(config.events.keepalive_secs),
        ));

        tracing::info!(
            provider = executor.provider_name(),
            model = %config.provider.model,
            max_retries = config.retry.max_retries,
            fanout_concurrency = config.fanout.max_concurrency,
            "engine container ready"
        );

        Self {
            config: Arc::new(config),
            documents,
            executions,
            threads,
            bus,
            executor,
            fanout,
            execution_service,
        }
    }
}
