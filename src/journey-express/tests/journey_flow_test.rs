//! Integration test for the full journey lifecycle: definitions, locked
//! execution, templates, and deterministic config resolution.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use journey_core::clock::system_clock;
    use journey_core::config::{ConfigResolver, EngineConfig};
    use journey_core::event_bus::{capture_sink, CaptureSink, EventSink};
    use journey_core::types::{
        EventType, InstanceStatus, StepCategory, StepRef, StepTypeDef, TransitionRule,
    };
    use journey_engine::{
        DefinitionRegistry, DefinitionSpec, FnExecutor, InstanceManager, InstanceOptions,
        LockManager, StepAdvance, StepOutput, StepRegistry,
    };
    use journey_templates::{DefinitionPayload, TemplateManager, TemplateSpec};

    struct Harness {
        resolver: Arc<ConfigResolver>,
        definitions: Arc<DefinitionRegistry>,
        steps: Arc<StepRegistry>,
        instances: Arc<InstanceManager>,
        events: Arc<CaptureSink>,
    }

    fn harness() -> Harness {
        let config = EngineConfig::default();
        let clock = system_clock();
        let resolver = Arc::new(ConfigResolver::default());
        let definitions = Arc::new(DefinitionRegistry::new(resolver.clone()));
        let steps = Arc::new(StepRegistry::new());
        let locks = Arc::new(LockManager::new(clock.clone()));
        let events = capture_sink();
        let instances = Arc::new(
            InstanceManager::new(
                &config,
                definitions.clone(),
                steps.clone(),
                locks,
                clock,
            )
            .with_event_sink(events.clone() as Arc<dyn EventSink>),
        );
        Harness {
            resolver,
            definitions,
            steps,
            instances,
            events,
        }
    }

    /// A three-state order journey with no executor steps, driven manually.
    fn order_definition() -> DefinitionSpec {
        DefinitionSpec {
            slug: "order-flow".into(),
            initial_state: "pending".into(),
            states: vec!["pending".into(), "processing".into(), "done".into()],
            transitions: vec![
                TransitionRule {
                    from: "pending".into(),
                    to: "processing".into(),
                    trigger: "begin".into(),
                },
                TransitionRule {
                    from: "processing".into(),
                    to: "done".into(),
                    trigger: "finish".into(),
                },
            ],
            steps: vec![],
            default_config: json!({"channel": "email"}),
            is_system: false,
        }
    }

    #[test]
    fn test_full_lifecycle_with_history_and_idempotent_completion() {
        let h = harness();
        h.definitions.create(order_definition()).unwrap();

        let instance = h
            .instances
            .create_instance("order-flow", json!({"order_id": 42}), InstanceOptions::default())
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.current_state, "pending");

        assert!(h.instances.acquire_lock(instance.id, 30));
        h.instances.start_instance(instance.id).unwrap();
        h.instances
            .transition_state(instance.id, "processing", "begin", json!({}))
            .unwrap();
        h.instances
            .transition_state(instance.id, "done", "finish", json!({"by": "ops"}))
            .unwrap();

        let completed = h
            .instances
            .complete_instance(instance.id, json!({"shipped": true}))
            .unwrap();
        assert_eq!(completed.status, InstanceStatus::Completed);
        assert_eq!(completed.state_history.len(), 2);
        assert_eq!(completed.state_history[1].to, "done");

        // Completing again is a no-op that reports the terminal row.
        let again = h
            .instances
            .complete_instance(instance.id, json!({"shipped": false}))
            .unwrap();
        assert_eq!(again.results, completed.results);
        assert_eq!(h.events.count_type(EventType::InstanceCompleted), 1);
    }

    #[test]
    fn test_invalid_transition_leaves_instance_untouched() {
        let h = harness();
        h.definitions.create(order_definition()).unwrap();
        let instance = h
            .instances
            .create_instance("order-flow", json!({}), InstanceOptions::default())
            .unwrap();

        assert!(h.instances.acquire_lock(instance.id, 30));
        h.instances.start_instance(instance.id).unwrap();

        // "finish" has no edge out of "pending".
        let err = h
            .instances
            .transition_state(instance.id, "done", "finish", json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("finish"));

        let current = h.instances.get_instance(instance.id).unwrap();
        assert_eq!(current.current_state, "pending");
        assert!(current.state_history.is_empty());
    }

    #[tokio::test]
    async fn test_executor_journey_runs_to_completion() {
        let h = harness();
        h.steps
            .register_step_type(StepTypeDef {
                slug: "qualify".into(),
                category: StepCategory::Scoring,
                executor_type: "qualifier".into(),
                default_config: json!({"threshold": 0.6}),
                default_timeout_ms: 5_000,
                max_retries: 1,
                is_system: false,
            })
            .unwrap();
        h.steps.register_executor(
            "qualifier",
            Arc::new(FnExecutor(|config: &Value, context: &Value| {
                let threshold = config["threshold"].as_f64().unwrap_or(0.5);
                let score = context["engagement"].as_f64().unwrap_or(0.0);
                Ok(StepOutput::with_trigger(
                    json!({"qualified": score >= threshold}),
                    "scored",
                ))
            })),
        );
        h.definitions
            .create(DefinitionSpec {
                slug: "lead-scoring".into(),
                initial_state: "new".into(),
                states: vec!["new".into(), "scored".into()],
                transitions: vec![TransitionRule {
                    from: "new".into(),
                    to: "scored".into(),
                    trigger: "scored".into(),
                }],
                steps: vec![StepRef {
                    slug: "qualify".into(),
                    step_type: "qualify".into(),
                    config: json!({}),
                    position: 0,
                }],
                default_config: json!({}),
                is_system: false,
            })
            .unwrap();

        let instance = h
            .instances
            .create_instance(
                "lead-scoring",
                json!({"engagement": 0.8}),
                InstanceOptions::default(),
            )
            .unwrap();

        let outcome = h.instances.run_instance(instance.id).await.unwrap();
        assert!(matches!(outcome, StepAdvance::Completed));

        let done = h.instances.get_instance(instance.id).unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.current_state, "scored");
        assert_eq!(done.context["qualify"]["qualified"], json!(true));
        assert_eq!(h.events.count_type(EventType::StepExecuted), 1);
    }

    #[test]
    fn test_template_versioning_and_clone_lineage() {
        let h = harness();
        let templates =
            TemplateManager::new(h.definitions.clone(), h.instances.clone(), h.resolver.clone());

        let v1 = templates
            .create_template(
                TemplateSpec {
                    slug: "outreach".into(),
                    name: "Outreach".into(),
                    vertical_slug: "saas".into(),
                    definition: DefinitionPayload {
                        initial_state: "new".into(),
                        states: vec!["new".into(), "sent".into()],
                        transitions: vec![TransitionRule {
                            from: "new".into(),
                            to: "sent".into(),
                            trigger: "send".into(),
                        }],
                        steps: vec![],
                        default_config: json!({"channel": "email", "retries": 2}),
                    },
                    is_system: false,
                },
                "alice",
            )
            .unwrap();
        assert_eq!(v1.version, 1);
        assert!(v1.is_latest);

        let v2 = templates
            .create_template_version(
                "outreach",
                &json!({"default_config": {"channel": "sms"}}),
                "bob",
            )
            .unwrap();
        assert_eq!(v2.version, 2);

        // Exactly one latest version, and it is the newest.
        let versions = templates.get_template_versions("outreach").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions.iter().filter(|v| v.is_latest).count(), 1);
        assert!(versions[0].is_latest);
        // The patch merged rather than replaced the defaults.
        assert_eq!(versions[0].definition.default_config["channel"], "sms");
        assert_eq!(versions[0].definition.default_config["retries"], 2);

        let clone = templates
            .clone_template(
                "outreach",
                "outreach-emea",
                &json!({"default_config": {"locale": "de"}}),
                "regional rollout",
                "carol",
            )
            .unwrap();
        assert_eq!(clone.version, 1);
        assert!(!clone.is_system);
        assert_eq!(clone.definition.default_config["channel"], "sms");
        assert_eq!(clone.definition.default_config["locale"], "de");

        // The lineage key is the stable template id, so the edge recorded
        // when cloning v2 is visible from the v1 handle too.
        assert_eq!(v2.template_id, v1.template_id);
        let history = templates.get_clone_history(v1.template_id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "regional rollout");
    }

    #[test]
    fn test_instantiation_config_is_reproducible() {
        let h = harness();
        let templates =
            TemplateManager::new(h.definitions.clone(), h.instances.clone(), h.resolver.clone());
        templates
            .create_template(
                TemplateSpec {
                    slug: "welcome".into(),
                    name: "Welcome".into(),
                    vertical_slug: "fintech".into(),
                    definition: DefinitionPayload {
                        initial_state: "new".into(),
                        states: vec!["new".into(), "greeted".into()],
                        transitions: vec![TransitionRule {
                            from: "new".into(),
                            to: "greeted".into(),
                            trigger: "greet".into(),
                        }],
                        steps: vec![],
                        default_config: json!({"tone": "formal"}),
                    },
                    is_system: false,
                },
                "alice",
            )
            .unwrap();

        let context = json!({"tone": "casual", "name": "Dana"});
        let first = templates
            .instantiate_template("welcome", context.clone(), InstanceOptions::default())
            .unwrap();
        let second = templates
            .instantiate_template("welcome", context, InstanceOptions::default())
            .unwrap();

        assert_ne!(first.instance.id, second.instance.id);
        assert_eq!(
            serde_json::to_vec(&first.personalized_context["_config"]).unwrap(),
            serde_json::to_vec(&second.personalized_context["_config"]).unwrap()
        );
        assert_eq!(first.personalized_context["_config"]["tone"], "casual");
    }

    #[test]
    fn test_lock_race_has_single_winner() {
        let h = harness();
        h.definitions.create(order_definition()).unwrap();
        let instance = h
            .instances
            .create_instance("order-flow", json!({}), InstanceOptions::default())
            .unwrap();

        let id = instance.id;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let instances = h.instances.clone();
                std::thread::spawn(move || instances.acquire_lock(id, 30))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        // The loser sees the holder's claim on the row.
        let locked = h.instances.get_instance(id).unwrap();
        assert!(locked.locked_until.is_some());
    }
}
