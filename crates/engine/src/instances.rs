//! Instance manager — owns the state machine execution loop and the step
//! dispatch sequence.
//!
//! Every mutation of a `JourneyInstance` happens while the instance lock is
//! held; the only exception is the cancellation flag, which is set lock-free
//! and committed by the next lock-holder. Workers that lose the lock race
//! get `LockContention` and are expected to back off.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use journey_core::clock::Clock;
use journey_core::config::{deep_merge, EngineConfig, ExecutorConfig};
use journey_core::error::{EngineError, EngineResult};
use journey_core::event_bus::{make_event, noop_sink, EventSink};
use journey_core::types::{
    DefinitionStats, EventType, InstanceStatus, JourneyDefinition, JourneyInstance,
    StateHistoryEntry, StepRef, StepTypeDef,
};

use crate::definitions::DefinitionRegistry;
use crate::locks::LockManager;
use crate::state_machine::InstanceLifecycle;
use crate::steps::{
    evaluate_condition, StepExecutor, StepOutput, StepRegistry, EXECUTOR_CONDITIONAL_BRANCH,
    EXECUTOR_PARALLEL_EXECUTE, EXECUTOR_WAIT_DELAY,
};

/// Callback seam into the debug tracer. The engine consults it before every
/// step dispatch; an active breakpoint captures state before execution.
pub trait DebugHook: Send + Sync {
    fn should_break(&self, instance_id: Uuid, step_slug: &str) -> bool;
    fn capture(&self, instance_id: Uuid, step_slug: &str, snapshot: &Value);
}

/// Default hook when no tracer is attached.
pub struct NoOpDebugHook;

impl DebugHook for NoOpDebugHook {
    fn should_break(&self, _instance_id: Uuid, _step_slug: &str) -> bool {
        false
    }
    fn capture(&self, _instance_id: Uuid, _step_slug: &str, _snapshot: &Value) {}
}

/// Options for instance creation.
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    pub priority: i32,
}

/// Outcome of one `process_step` call.
#[derive(Debug, Clone)]
pub enum StepAdvance {
    /// A step ran and the instance can be driven again immediately.
    Executed { step_slug: String },
    /// The instance is suspended until `wake_at`; the lock was released.
    Waiting { wake_at: DateTime<Utc> },
    Completed,
    Failed,
    Cancelled,
}

/// Core orchestration engine for journey instances.
pub struct InstanceManager {
    instances: DashMap<Uuid, JourneyInstance>,
    definitions: Arc<DefinitionRegistry>,
    steps: Arc<StepRegistry>,
    locks: Arc<LockManager>,
    lifecycle: InstanceLifecycle,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    debug_hook: Arc<dyn DebugHook>,
    lock_ttl_secs: u64,
    executor_defaults: ExecutorConfig,
}

impl InstanceManager {
    pub fn new(
        config: &EngineConfig,
        definitions: Arc<DefinitionRegistry>,
        steps: Arc<StepRegistry>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instances: DashMap::new(),
            definitions,
            steps,
            locks,
            lifecycle: InstanceLifecycle::new(),
            clock,
            event_sink: noop_sink(),
            debug_hook: Arc::new(NoOpDebugHook),
            lock_ttl_secs: config.lock.ttl_secs,
            executor_defaults: config.executor.clone(),
        }
    }

    /// Attach an event sink for the monitoring subsystem.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Attach a debug tracer hook.
    pub fn with_debug_hook(mut self, hook: Arc<dyn DebugHook>) -> Self {
        self.debug_hook = hook;
        self
    }

    // ─── Creation & lookup ─────────────────────────────────────────────────

    /// Insert a new `Pending` instance positioned at the definition's
    /// initial state.
    pub fn create_instance(
        &self,
        definition_slug: &str,
        context: Value,
        opts: InstanceOptions,
    ) -> EngineResult<JourneyInstance> {
        let definition = self.definitions.get(definition_slug)?;
        let now = self.clock.now();
        let instance = JourneyInstance {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            definition_slug: definition.slug.clone(),
            status: InstanceStatus::Pending,
            current_state: definition.initial_state.clone(),
            context,
            priority: opts.priority,
            locked_until: None,
            cancel_requested: false,
            wake_at: None,
            current_step: 0,
            state_history: Vec::new(),
            results: None,
            failure_reason: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
        };

        info!(
            instance_id = %instance.id,
            definition = %definition.slug,
            "Created journey instance"
        );
        self.emit(
            EventType::InstanceCreated,
            instance.id,
            &definition.slug,
            None,
            json!({}),
        );
        self.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    pub fn get_instance(&self, id: Uuid) -> EngineResult<JourneyInstance> {
        self.instances
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))
    }

    /// Instances a worker may pick up right now: non-terminal, unlocked,
    /// past any wake deadline; highest priority first.
    pub fn ready_instances(&self) -> Vec<Uuid> {
        let now = self.clock.now();
        let mut ready: Vec<(i32, DateTime<Utc>, Uuid)> = self
            .instances
            .iter()
            .filter(|r| {
                let inst = r.value();
                !inst.status.is_terminal()
                    && !self.locks.is_locked(inst.id)
                    && inst.wake_at.map(|w| w <= now).unwrap_or(true)
            })
            .map(|r| (r.priority, r.created_at, r.id))
            .collect();
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ready.into_iter().map(|(_, _, id)| id).collect()
    }

    // ─── Locking ───────────────────────────────────────────────────────────

    /// Claim the instance lock; mirrors the deadline onto the row.
    pub fn acquire_lock(&self, id: Uuid, ttl_secs: u64) -> bool {
        if self.locks.acquire(id, ttl_secs).is_none() {
            return false;
        }
        if let Some(mut inst) = self.instances.get_mut(&id) {
            inst.locked_until = self.locks.locked_until(id);
        }
        true
    }

    pub fn release_lock(&self, id: Uuid) {
        self.locks.release(id);
        if let Some(mut inst) = self.instances.get_mut(&id) {
            inst.locked_until = None;
        }
    }

    fn require_lock(&self, id: Uuid) -> EngineResult<()> {
        if self.locks.is_locked(id) {
            Ok(())
        } else {
            Err(EngineError::LockContention(id))
        }
    }

    // ─── Lifecycle mutations (lock required) ───────────────────────────────

    /// `Pending → Running`; records `started_at`.
    pub fn start_instance(&self, id: Uuid) -> EngineResult<JourneyInstance> {
        self.require_lock(id)?;
        let mut inst = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;

        self.lifecycle
            .assert_transition(inst.status, InstanceStatus::Running, "start")?;
        let now = self.clock.now();
        inst.status = InstanceStatus::Running;
        inst.started_at = Some(now);
        inst.updated_at = now;
        let slug = inst.definition_slug.clone();
        let snapshot = inst.clone();
        drop(inst);

        info!(instance_id = %id, "Instance started");
        self.emit(EventType::InstanceStarted, id, &slug, None, json!({}));
        Ok(snapshot)
    }

    /// Validate `(current_state, to_state, trigger)` against the definition's
    /// transition table, append exactly one history row, and move the state.
    /// On a missing edge nothing is mutated.
    pub fn transition_state(
        &self,
        id: Uuid,
        to_state: &str,
        trigger: &str,
        trigger_data: Value,
    ) -> EngineResult<JourneyInstance> {
        self.require_lock(id)?;
        let definition = {
            let inst = self.get_instance(id)?;
            if inst.status.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    from: inst.current_state,
                    to: to_state.to_string(),
                    trigger: trigger.to_string(),
                });
            }
            self.definitions.get_by_id(inst.definition_id)?
        };

        let mut inst = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;

        if definition
            .find_transition(&inst.current_state, to_state, trigger)
            .is_none()
        {
            return Err(EngineError::InvalidTransition {
                from: inst.current_state.clone(),
                to: to_state.to_string(),
                trigger: trigger.to_string(),
            });
        }

        let now = self.clock.now();
        let from = inst.current_state.clone();
        inst.state_history.push(StateHistoryEntry {
            from: from.clone(),
            to: to_state.to_string(),
            trigger: trigger.to_string(),
            trigger_data,
            timestamp: now,
        });
        inst.current_state = to_state.to_string();
        inst.updated_at = now;
        let slug = inst.definition_slug.clone();
        let snapshot = inst.clone();
        drop(inst);

        info!(instance_id = %id, %from, to = %to_state, %trigger, "State transitioned");
        self.emit(
            EventType::StateTransitioned,
            id,
            &slug,
            None,
            json!({"from": from, "to": to_state, "trigger": trigger}),
        );
        Ok(snapshot)
    }

    /// Terminal `Completed`. Idempotent: an already-terminal instance is
    /// returned as-is, since workers may race to observe completion.
    pub fn complete_instance(&self, id: Uuid, results: Value) -> EngineResult<JourneyInstance> {
        let current = self.get_instance(id)?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        self.require_lock(id)?;
        {
            let mut inst = self
                .instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
            self.lifecycle
                .assert_transition(inst.status, InstanceStatus::Completed, "complete")?;
            let now = self.clock.now();
            inst.status = InstanceStatus::Completed;
            inst.results = Some(results);
            inst.ended_at = Some(now);
            inst.updated_at = now;
        }
        self.release_lock(id);

        let snapshot = self.get_instance(id)?;
        info!(instance_id = %id, "Instance completed");
        self.emit(
            EventType::InstanceCompleted,
            id,
            &snapshot.definition_slug,
            None,
            json!({}),
        );
        Ok(snapshot)
    }

    /// Terminal `Failed` with a queryable reason. Idempotent like
    /// `complete_instance`.
    pub fn fail_instance(&self, id: Uuid, reason: &str) -> EngineResult<JourneyInstance> {
        let current = self.get_instance(id)?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        self.require_lock(id)?;
        {
            let mut inst = self
                .instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
            self.lifecycle
                .assert_transition(inst.status, InstanceStatus::Failed, "fail")?;
            let now = self.clock.now();
            inst.status = InstanceStatus::Failed;
            inst.failure_reason = Some(reason.to_string());
            inst.ended_at = Some(now);
            inst.updated_at = now;
        }
        self.release_lock(id);

        let snapshot = self.get_instance(id)?;
        warn!(instance_id = %id, %reason, "Instance failed");
        self.emit(
            EventType::InstanceFailed,
            id,
            &snapshot.definition_slug,
            None,
            json!({"reason": reason}),
        );
        Ok(snapshot)
    }

    /// Flag the instance for cancellation. Safe without the lock; the next
    /// lock-holder observes the flag before committing anything further.
    pub fn request_cancel(&self, id: Uuid) -> EngineResult<()> {
        let mut inst = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
        inst.cancel_requested = true;
        Ok(())
    }

    // ─── Execution loop ────────────────────────────────────────────────────

    /// Acquire the lock, advance the instance by one step, release the lock.
    ///
    /// Returns `LockContention` when another worker holds the instance;
    /// `ExecutorTimeout` on a retryable category after retries are exhausted
    /// (instance stays `Running`); any other failure drives the instance to
    /// `Failed` before propagating.
    pub async fn process_step(&self, id: Uuid) -> EngineResult<StepAdvance> {
        let Some(holder) = self.locks.acquire(id, self.lock_ttl_secs) else {
            return Err(EngineError::LockContention(id));
        };
        if let Some(mut inst) = self.instances.get_mut(&id) {
            inst.locked_until = self.locks.locked_until(id);
        }
        let result = self.process_step_locked(id).await;
        // Terminal paths release inside process_step_locked; the holder
        // token keeps a late release here from clearing a claim another
        // worker has since acquired.
        if self.locks.release_if_held(id, holder) {
            if let Some(mut inst) = self.instances.get_mut(&id) {
                inst.locked_until = None;
            }
        }
        result
    }

    /// Drive the instance until it suspends, terminates, or errors.
    pub async fn run_instance(&self, id: Uuid) -> EngineResult<StepAdvance> {
        loop {
            match self.process_step(id).await? {
                StepAdvance::Executed { .. } => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    async fn process_step_locked(&self, id: Uuid) -> EngineResult<StepAdvance> {
        let inst = self.get_instance(id)?;

        match inst.status {
            InstanceStatus::Completed => return Ok(StepAdvance::Completed),
            InstanceStatus::Failed => return Ok(StepAdvance::Failed),
            InstanceStatus::Cancelled => return Ok(StepAdvance::Cancelled),
            _ => {}
        }

        // Cancellation flag is committed before any further work, including
        // a pending wake deadline.
        if inst.cancel_requested {
            return self.commit_cancel(id);
        }

        if inst.status == InstanceStatus::Pending {
            self.start_instance(id)?;
        }

        let now = self.clock.now();
        if let Some(wake_at) = inst.wake_at {
            if wake_at > now {
                return Ok(StepAdvance::Waiting { wake_at });
            }
            if let Some(mut row) = self.instances.get_mut(&id) {
                row.wake_at = None;
            }
        }

        let definition = self.definitions.get_by_id(inst.definition_id)?;
        let Some(step) = definition.steps.get(inst.current_step).cloned() else {
            self.complete_instance(id, json!({"context": inst.context}))?;
            return Ok(StepAdvance::Completed);
        };

        if self.debug_hook.should_break(id, &step.slug) {
            // Capture-before-execute, then proceed.
            self.debug_hook.capture(id, &step.slug, &inst.context);
        }

        let step_type = self
            .steps
            .get_step_type(&step.step_type)
            .ok_or_else(|| EngineError::NotFound(format!("step type '{}'", step.step_type)))?;
        let mut config = step_type.default_config.clone();
        deep_merge(&mut config, &step.config);

        let outcome = match step_type.executor_type.as_str() {
            EXECUTOR_WAIT_DELAY => self.dispatch_wait_delay(id, &step, &config),
            EXECUTOR_CONDITIONAL_BRANCH => {
                self.dispatch_conditional_branch(id, &definition, &step, &config)
            }
            EXECUTOR_PARALLEL_EXECUTE => {
                self.dispatch_parallel(id, &definition, &step, &config).await
            }
            _ => {
                self.dispatch_executor(id, &definition, &step, &step_type, &config)
                    .await
            }
        };

        match outcome {
            Ok(advance) => Ok(advance),
            Err(err) if err.is_retryable() => {
                // Timed-out retryable step: instance stays Running, the
                // worker backs off and retries later.
                self.emit(
                    EventType::StepFailed,
                    id,
                    &inst.definition_slug,
                    Some(&step.slug),
                    json!({"error": err.to_string(), "retryable": true}),
                );
                Err(err)
            }
            Err(err) => {
                self.emit(
                    EventType::StepFailed,
                    id,
                    &inst.definition_slug,
                    Some(&step.slug),
                    json!({"error": err.to_string(), "retryable": false}),
                );
                self.fail_instance(id, &err.to_string())?;
                Err(err)
            }
        }
    }

    fn commit_cancel(&self, id: Uuid) -> EngineResult<StepAdvance> {
        {
            let mut inst = self
                .instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
            self.lifecycle
                .assert_transition(inst.status, InstanceStatus::Cancelled, "cancel")?;
            let now = self.clock.now();
            inst.status = InstanceStatus::Cancelled;
            inst.ended_at = Some(now);
            inst.updated_at = now;
        }
        self.release_lock(id);

        let snapshot = self.get_instance(id)?;
        info!(instance_id = %id, "Instance cancelled");
        self.emit(
            EventType::InstanceCancelled,
            id,
            &snapshot.definition_slug,
            None,
            json!({}),
        );
        Ok(StepAdvance::Cancelled)
    }

    /// `wait_delay`: suspend until a wall-clock deadline. The lock is
    /// released by `process_step`, so the waiting instance does not occupy
    /// the lock table.
    fn dispatch_wait_delay(
        &self,
        id: Uuid,
        step: &StepRef,
        config: &Value,
    ) -> EngineResult<StepAdvance> {
        let delay_ms = config.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
        let wake_at = self.clock.now() + Duration::milliseconds(delay_ms as i64);

        let slug = {
            let mut inst = self
                .instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
            inst.wake_at = Some(wake_at);
            inst.current_step += 1;
            inst.updated_at = self.clock.now();
            inst.definition_slug.clone()
        };

        info!(instance_id = %id, step = %step.slug, %wake_at, "Instance waiting");
        self.emit(
            EventType::StepExecuted,
            id,
            &slug,
            Some(&step.slug),
            json!({"delay_ms": delay_ms}),
        );
        Ok(StepAdvance::Waiting { wake_at })
    }

    /// `conditional_branch`: pick the first branch whose predicate holds and
    /// fire its trigger against the transition table.
    fn dispatch_conditional_branch(
        &self,
        id: Uuid,
        definition: &JourneyDefinition,
        step: &StepRef,
        config: &Value,
    ) -> EngineResult<StepAdvance> {
        let context = self.get_instance(id)?.context;
        let branches = config
            .get("branches")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let trigger = branches
            .iter()
            .find(|b| {
                b.get("when")
                    .and_then(Value::as_str)
                    .map(|cond| evaluate_condition(cond, &context))
                    .unwrap_or(false)
            })
            .and_then(|b| b.get("trigger").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::ExecutorFailure {
                    step: step.slug.clone(),
                    source: anyhow::anyhow!("no branch matched the instance context"),
                }
            })?;

        self.fold_output(id, &step.slug, json!({"branch": trigger}))?;
        self.apply_trigger(id, definition, &trigger)?;
        self.advance_cursor(id, 1)?;
        self.emit(
            EventType::StepExecuted,
            id,
            &definition.slug,
            Some(&step.slug),
            json!({"trigger": trigger}),
        );
        Ok(StepAdvance::Executed {
            step_slug: step.slug.clone(),
        })
    }

    /// `parallel_execute`: fan out to sibling steps, join while the instance
    /// lock is held, fold every sibling's output, then skip the siblings in
    /// the main sequence.
    async fn dispatch_parallel(
        &self,
        id: Uuid,
        definition: &JourneyDefinition,
        step: &StepRef,
        config: &Value,
    ) -> EngineResult<StepAdvance> {
        let context = self.get_instance(id)?.context;
        let sibling_slugs: Vec<String> = config
            .get("steps")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut join_set: JoinSet<(String, EngineResult<StepOutput>)> = JoinSet::new();
        for slug in &sibling_slugs {
            let sibling = definition
                .step(slug)
                .ok_or_else(|| EngineError::NotFound(format!("sibling step '{slug}'")))?
                .clone();
            let sibling_type = self
                .steps
                .get_step_type(&sibling.step_type)
                .ok_or_else(|| EngineError::NotFound(format!("step type '{}'", sibling.step_type)))?;
            let executor = self
                .steps
                .get_executor(&sibling_type.executor_type)
                .ok_or_else(|| {
                    EngineError::NotFound(format!("executor '{}'", sibling_type.executor_type))
                })?;

            let mut sibling_config = sibling_type.default_config.clone();
            deep_merge(&mut sibling_config, &sibling.config);
            let context = context.clone();
            let defaults = self.executor_defaults.clone();
            let slug = sibling.slug.clone();
            join_set.spawn(async move {
                let result =
                    run_executor(executor, &sibling_type, &sibling_config, &context, &defaults)
                        .await;
                (slug, result)
            });
        }

        let mut outputs: Vec<(String, StepOutput)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (slug, result) = joined.map_err(|e| EngineError::Internal(e.into()))?;
            outputs.push((slug, result?));
        }

        for (slug, output) in &outputs {
            self.fold_output(id, slug, output.output.clone())?;
        }
        self.fold_output(id, &step.slug, json!({"joined": sibling_slugs}))?;

        // The join step itself, then any siblings that appear next in the
        // ordered sequence, are all consumed.
        self.advance_cursor(id, 1)?;
        loop {
            let inst = self.get_instance(id)?;
            match definition.steps.get(inst.current_step) {
                Some(next) if sibling_slugs.iter().any(|s| s == &next.slug) => {
                    self.advance_cursor(id, 1)?;
                }
                _ => break,
            }
        }

        self.emit(
            EventType::StepExecuted,
            id,
            &definition.slug,
            Some(&step.slug),
            json!({"siblings": sibling_slugs}),
        );
        Ok(StepAdvance::Executed {
            step_slug: step.slug.clone(),
        })
    }

    /// Regular step: dispatch to the registered executor with timeout and
    /// retry, fold the output, and fire any trigger hint.
    async fn dispatch_executor(
        &self,
        id: Uuid,
        definition: &JourneyDefinition,
        step: &StepRef,
        step_type: &StepTypeDef,
        config: &Value,
    ) -> EngineResult<StepAdvance> {
        let context = self.get_instance(id)?.context;
        let executor = self
            .steps
            .get_executor(&step_type.executor_type)
            .ok_or_else(|| {
                EngineError::NotFound(format!("executor '{}'", step_type.executor_type))
            })?;

        let output =
            run_executor(executor, step_type, config, &context, &self.executor_defaults).await?;

        self.fold_output(id, &step.slug, output.output.clone())?;
        if let Some(trigger) = &output.next_trigger {
            self.apply_trigger(id, definition, trigger)?;
        }
        self.advance_cursor(id, 1)?;
        self.emit(
            EventType::StepExecuted,
            id,
            &definition.slug,
            Some(&step.slug),
            json!({"trigger": output.next_trigger}),
        );
        Ok(StepAdvance::Executed {
            step_slug: step.slug.clone(),
        })
    }

    /// Fire `trigger` from the instance's current state.
    fn apply_trigger(
        &self,
        id: Uuid,
        definition: &JourneyDefinition,
        trigger: &str,
    ) -> EngineResult<()> {
        let current = self.get_instance(id)?.current_state;
        let rule = definition
            .transition_for_trigger(&current, trigger)
            .ok_or_else(|| EngineError::InvalidTransition {
                from: current.clone(),
                to: "?".to_string(),
                trigger: trigger.to_string(),
            })?
            .clone();
        self.transition_state(id, &rule.to, trigger, json!({"source": "step"}))?;
        Ok(())
    }

    /// Executor output lands in `context` under the step's slug. A retried
    /// step overwrites its own slot, so folding stays idempotent.
    fn fold_output(&self, id: Uuid, step_slug: &str, output: Value) -> EngineResult<()> {
        let mut inst = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
        if !inst.context.is_object() {
            inst.context = Value::Object(serde_json::Map::new());
        }
        if let Some(obj) = inst.context.as_object_mut() {
            obj.insert(step_slug.to_string(), output);
        }
        inst.updated_at = self.clock.now();
        Ok(())
    }

    fn advance_cursor(&self, id: Uuid, by: usize) -> EngineResult<()> {
        let mut inst = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("instance {id}")))?;
        inst.current_step += by;
        Ok(())
    }

    // ─── Stats ─────────────────────────────────────────────────────────────

    /// Aggregate statistics across this definition's instances.
    pub fn get_stats(&self, definition_slug: &str) -> DefinitionStats {
        let mut stats = DefinitionStats {
            definition_slug: definition_slug.to_string(),
            total_created: 0,
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            avg_completion_time_secs: 0.0,
        };
        let mut completion_secs = 0.0;

        for entry in self.instances.iter() {
            let inst = entry.value();
            if inst.definition_slug != definition_slug {
                continue;
            }
            stats.total_created += 1;
            match inst.status {
                InstanceStatus::Pending => stats.pending += 1,
                InstanceStatus::Running => stats.running += 1,
                InstanceStatus::Completed => {
                    stats.completed += 1;
                    if let (Some(started), Some(ended)) = (inst.started_at, inst.ended_at) {
                        completion_secs += ended.signed_duration_since(started).num_seconds() as f64;
                    }
                }
                InstanceStatus::Failed => stats.failed += 1,
                InstanceStatus::Cancelled => stats.cancelled += 1,
            }
        }

        if stats.completed > 0 {
            stats.avg_completion_time_secs = completion_secs / stats.completed as f64;
        }
        stats
    }

    fn emit(
        &self,
        event_type: EventType,
        id: Uuid,
        definition_slug: &str,
        step_slug: Option<&str>,
        detail: Value,
    ) {
        self.event_sink.emit(make_event(
            event_type,
            Some(id),
            Some(definition_slug.to_string()),
            step_slug.map(str::to_string),
            detail,
        ));
    }
}

/// Enforce the timeout contract and the per-category retry policy around one
/// executor invocation. Executor errors propagate immediately; only timeouts
/// on retryable categories are re-attempted.
async fn run_executor(
    executor: Arc<dyn StepExecutor>,
    step_type: &StepTypeDef,
    config: &Value,
    context: &Value,
    defaults: &ExecutorConfig,
) -> EngineResult<StepOutput> {
    let timeout_ms = if step_type.default_timeout_ms > 0 {
        step_type.default_timeout_ms
    } else {
        defaults.default_timeout_ms
    };
    let max_retries = if step_type.category.is_retryable() {
        step_type.max_retries
    } else {
        0
    };

    let mut attempt = 0;
    loop {
        let run = executor.execute(config, context);
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), run).await {
            Ok(Ok(output)) => return Ok(output),
            Ok(Err(source)) => {
                return Err(EngineError::ExecutorFailure {
                    step: step_type.slug.clone(),
                    source,
                })
            }
            Err(_) => {
                if attempt < max_retries {
                    attempt += 1;
                    warn!(
                        step = %step_type.slug,
                        attempt,
                        "Step timed out, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(defaults.retry_backoff_ms))
                        .await;
                } else {
                    return Err(EngineError::ExecutorTimeout {
                        step: step_type.slug.clone(),
                        timeout_ms,
                    });
                }
            }
        }
    }
}
