//! Journey Express — versioned journey execution engine.
//!
//! Main entry point that wires the registries, the instance manager, and the
//! monitoring services together, then runs the worker pool.

use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use journey_core::clock::system_clock;
use journey_core::config::{ConfigResolver, EngineConfig};
use journey_core::error::EngineError;
use journey_core::event_bus::{EventSink, FanoutSink};
use journey_core::types::{StepCategory, StepRef, StepTypeDef, TransitionRule};
use journey_engine::{
    DefinitionRegistry, FnExecutor, InstanceManager, LockManager, StepOutput, StepRegistry,
};
use journey_monitoring::debug::DebugTracer;
use journey_monitoring::memory::MemoryStore;
use journey_monitoring::metrics::MetricsRecorder;
use journey_templates::manager::TemplateManager;
use journey_templates::models::{DefinitionPayload, TemplateSpec};

#[derive(Parser, Debug)]
#[command(name = "journeyd")]
#[command(about = "Versioned journey execution engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "JOURNEY_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// Number of worker tasks (overrides config)
    #[arg(long, env = "JOURNEY_EXPRESS__WORKERS")]
    workers: Option<usize>,

    /// Worker poll interval in milliseconds (overrides config)
    #[arg(long, env = "JOURNEY_EXPRESS__POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Register the demo template and step executors on startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journey_express=info,journey_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Journey Express starting up");

    // Load configuration
    let mut config = EngineConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.poll_interval_ms = interval;
    }

    info!(
        node_id = %config.node_id,
        workers = config.workers,
        poll_interval_ms = config.poll_interval_ms,
        lock_ttl_secs = config.lock.ttl_secs,
        "Configuration loaded"
    );

    // Shared infrastructure
    let clock = system_clock();
    let resolver = Arc::new(ConfigResolver::new(json!({
        "node_id": config.node_id,
    })));
    let locks = Arc::new(LockManager::new(clock.clone()));
    let steps = Arc::new(StepRegistry::new());
    let definitions = Arc::new(DefinitionRegistry::new(resolver.clone()));

    // Monitoring services
    let metrics = Arc::new(MetricsRecorder::new());
    let tracer = Arc::new(DebugTracer::new());
    let memory = Arc::new(MemoryStore::new(clock.clone()));
    let sink: Arc<FanoutSink> =
        Arc::new(FanoutSink::new(vec![metrics.clone() as Arc<dyn EventSink>]));

    // Engine
    let instances = Arc::new(
        InstanceManager::new(
            &config,
            definitions.clone(),
            steps.clone(),
            locks.clone(),
            clock.clone(),
        )
        .with_event_sink(sink.clone())
        .with_debug_hook(tracer.clone()),
    );
    let templates = Arc::new(
        TemplateManager::new(definitions.clone(), instances.clone(), resolver.clone())
            .with_event_sink(sink.clone()),
    );

    if cli.seed_demo {
        seed_demo(&steps, &templates)?;
    }

    // Spawn memory maintenance task
    let memory_config = config.memory.clone();
    let memory_for_maintenance = memory.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            memory_for_maintenance
                .decay_scores(memory_config.decay_factor, memory_config.score_floor);
            memory_for_maintenance.purge_expired();
        }
    });

    // Spawn the worker pool
    for worker_id in 0..config.workers {
        let instances = instances.clone();
        let poll_interval = std::time::Duration::from_millis(config.poll_interval_ms);
        tokio::spawn(async move {
            run_worker(worker_id, instances, poll_interval).await;
        });
    }

    info!(workers = config.workers, "Journey Express is ready");

    // Run until shutdown
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}

/// Poll for ready instances and race the pool for their locks. A lost race
/// is routine; the instance stays visible until a holder finishes it.
async fn run_worker(
    worker_id: usize,
    instances: Arc<InstanceManager>,
    poll_interval: std::time::Duration,
) {
    info!(worker_id, "Worker started");
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;
        for id in instances.ready_instances() {
            match instances.run_instance(id).await {
                Ok(outcome) => {
                    info!(worker_id, instance_id = %id, ?outcome, "Instance advanced");
                }
                Err(EngineError::LockContention(_)) => {}
                Err(e) if e.is_retryable() => {
                    warn!(worker_id, instance_id = %id, error = %e, "Step will be retried");
                }
                Err(e) => {
                    error!(worker_id, instance_id = %id, error = %e, "Instance failed");
                }
            }
        }
    }
}

/// Register a minimal outreach journey so a fresh node has something to run.
fn seed_demo(steps: &StepRegistry, templates: &TemplateManager) -> anyhow::Result<()> {
    steps.register_step_type(StepTypeDef {
        slug: "score-lead".into(),
        category: StepCategory::Scoring,
        executor_type: "demo_scorer".into(),
        default_config: json!({"threshold": 0.5}),
        default_timeout_ms: 5_000,
        max_retries: 2,
        is_system: false,
    })?;
    steps.register_executor(
        "demo_scorer",
        Arc::new(FnExecutor(|config: &Value, context: &Value| {
            let threshold = config
                .get("threshold")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            let score = context
                .get("engagement")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            Ok(StepOutput::with_trigger(
                json!({"score": score, "qualified": score >= threshold}),
                "scored",
            ))
        })),
    );

    let template = templates.create_template(
        TemplateSpec {
            slug: "lead-outreach".into(),
            name: "Lead Outreach".into(),
            vertical_slug: "saas".into(),
            definition: DefinitionPayload {
                initial_state: "new".into(),
                states: vec!["new".into(), "scored".into()],
                transitions: vec![TransitionRule {
                    from: "new".into(),
                    to: "scored".into(),
                    trigger: "scored".into(),
                }],
                steps: vec![StepRef {
                    slug: "score-lead".into(),
                    step_type: "score-lead".into(),
                    config: json!({}),
                    position: 0,
                }],
                default_config: json!({"channel": "email"}),
            },
            is_system: false,
        },
        "system",
    )?;
    info!(template_id = %template.id, slug = %template.slug, "Seeded demo template");
    Ok(())
}
