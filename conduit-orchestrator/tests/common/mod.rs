//! Shared fixtures for the scenario tests: a scripted provider and an
//! orchestrator wired to the in-memory store with millisecond timings.

#![allow(dead_code)]

use async_trait::async_trait;
use conduit_core::domain::execution::Execution;
use conduit_core::domain::provider::PipelineType;
use conduit_core::domain::template::{ParameterSpec, ParameterType, PipelineConfig, Template};
use conduit_core::dto::execution::{ExecutePipeline, PipelineSource};
use conduit_core::dto::provider::{CancelAck, HealthReport, ProviderStatus, RemoteState};
use conduit_orchestrator::provider::{ProviderAdapter, ProviderRegistry, ProviderSettings, SubmitRequest};
use conduit_orchestrator::store::MemoryStore;
use conduit_orchestrator::template::TemplateCatalog;
use conduit_orchestrator::{Config, Orchestrator, ProviderError};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Provider whose answers are set by the test
pub struct FakeProvider {
    name: String,
    capabilities: Vec<PipelineType>,
    healthy: AtomicBool,
    reachable: AtomicBool,
    submit_script: Mutex<VecDeque<Result<String, ProviderError>>>,
    submit_fallback: Mutex<Option<ProviderError>>,
    submits: AtomicU32,
    submit_entered: Notify,
    submit_gate: Mutex<Option<Arc<Notify>>>,
    status: Mutex<Result<ProviderStatus, ProviderError>>,
    cancel: Mutex<Result<CancelAck, ProviderError>>,
    cancels: AtomicU32,
}

impl FakeProvider {
    pub fn new(name: &str, capabilities: &[PipelineType]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            capabilities: capabilities.to_vec(),
            healthy: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            submit_script: Mutex::new(VecDeque::new()),
            submit_fallback: Mutex::new(None),
            submits: AtomicU32::new(0),
            submit_entered: Notify::new(),
            submit_gate: Mutex::new(None),
            status: Mutex::new(Ok(ProviderStatus {
                stages: Vec::new(),
                overall: RemoteState::Pending,
            })),
            cancel: Mutex::new(Ok(CancelAck::Cancelled)),
            cancels: AtomicU32::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Makes health probes fail with a transport error instead of replying
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queues answers for the next `submit()` calls
    pub fn script_submits(&self, answers: Vec<Result<String, ProviderError>>) {
        self.submit_script.lock().unwrap().extend(answers);
    }

    /// Answer once the script is used up; `None` accepts
    pub fn fail_submits_with(&self, error: ProviderError) {
        *self.submit_fallback.lock().unwrap() = Some(error);
    }

    pub fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    /// Holds every later `submit()` until the returned gate is notified once per call
    pub fn hold_submits(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.submit_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Waits until a `submit()` call has started
    pub async fn submit_started(&self) {
        self.submit_entered.notified().await;
    }

    pub fn set_status(&self, status: Result<ProviderStatus, ProviderError>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_cancel(&self, answer: Result<CancelAck, ProviderError>) {
        *self.cancel.lock().unwrap() = answer;
    }

    pub fn cancels(&self) -> u32 {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> Vec<PipelineType> {
        self.capabilities.clone()
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<String, ProviderError> {
        let attempt = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        self.submit_entered.notify_one();

        let gate = self.submit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(answer) = self.submit_script.lock().unwrap().pop_front() {
            return answer;
        }
        match self.submit_fallback.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(format!("{}-{}-{}", self.name, request.execution_id, attempt)),
        }
    }

    async fn fetch_status(&self, _: &str) -> Result<ProviderStatus, ProviderError> {
        self.status.lock().unwrap().clone()
    }

    async fn cancel(&self, _: &str) -> Result<CancelAck, ProviderError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancel.lock().unwrap().clone()
    }

    async fn health_check(&self) -> Result<HealthReport, ProviderError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unreachable("connection refused".to_string()));
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(HealthReport::healthy())
        } else {
            Ok(HealthReport::unhealthy("maintenance"))
        }
    }
}

/// Configuration with millisecond timings
pub fn test_config() -> Config {
    let mut config = Config::new("test".to_string());
    config.health_interval = Duration::from_millis(20);
    config.health_timeout = Duration::from_millis(200);
    config.health_failure_threshold = 1;
    config.retry_base_delay = Duration::from_millis(1);
    config.retry_max_delay = Duration::from_millis(4);
    config.provider_call_timeout = Duration::from_millis(200);
    config.poll_interval = Duration::from_millis(20);
    config.idle_interval = Duration::from_millis(20);
    config
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
}

pub fn harness(providers: &[(Arc<FakeProvider>, ProviderSettings)]) -> Harness {
    harness_with(test_config(), providers, Arc::new(MemoryStore::new()))
}

pub fn harness_with(
    config: Config,
    providers: &[(Arc<FakeProvider>, ProviderSettings)],
    store: Arc<MemoryStore>,
) -> Harness {
    let registry = Arc::new(ProviderRegistry::new(config.health_failure_threshold));
    for (provider, settings) in providers {
        registry.register(provider.clone(), *settings).unwrap();
    }

    let catalog = Arc::new(TemplateCatalog::from_templates([nodejs_basic()]).unwrap());
    let orchestrator = Orchestrator::new(config, store.clone(), registry, catalog);

    Harness {
        orchestrator,
        store,
    }
}

pub fn nodejs_basic() -> Template {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "language".to_string(),
        ParameterSpec {
            param_type: ParameterType::String,
            description: Some("Source language".to_string()),
            required: true,
            default: None,
            options: Some(vec![json!("javascript"), json!("typescript")]),
        },
    );

    Template {
        id: "nodejs-basic".to_string(),
        name: "Node.js basic".to_string(),
        version: 1,
        description: None,
        pipeline_type: PipelineType::FullCicd,
        parameters,
        stages: vec!["install".to_string(), "test".to_string()],
        settings: json!({"image": "node:20", "lint": "${language}"}),
        timeout_seconds: None,
        enabled: true,
        published_at: chrono::Utc::now(),
    }
}

pub fn request(pipeline_type: PipelineType) -> ExecutePipeline {
    ExecutePipeline {
        repository: "org/api".to_string(),
        branch: "main".to_string(),
        environment: "staging".to_string(),
        pipeline: PipelineSource::Config(PipelineConfig::new(pipeline_type)),
        parameters: HashMap::new(),
        priority: None,
        provider_preference: None,
    }
}

/// Runs one scheduling pass and waits for every dispatch it started
pub async fn dispatch(orchestrator: &Orchestrator) {
    for handle in orchestrator.dispatch_cycle() {
        handle.await.unwrap();
    }
}

pub async fn status(orchestrator: &Orchestrator, id: Uuid) -> Execution {
    orchestrator.get_execution_status(id).await.unwrap()
}
