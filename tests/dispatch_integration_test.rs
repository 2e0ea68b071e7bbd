//! 两方端到端集成测试：配对、签名下发、双重策略、关联回复、回声过滤、重放保护

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    use taskgate::config::AppConfig;
    use taskgate::executor::{register_builtin, ActionHandler, ActionOutput, ActionRegistry};
    use taskgate::filter::FilterRejection;
    use taskgate::node::{
        spawn_connector, spawn_orchestrator, Connector, ObjectiveOutcome, Orchestrator, Reply,
    };
    use taskgate::planner::{KeywordPlanner, PlanOutcome, Planner};
    use taskgate::policy::{PolicyConfig, PolicyEngine};
    use taskgate::protocol::{
        ExecutionResult, ExecutionStatus, SignedEnvelope, StepStatus, TaskConstraints, TaskPlan,
        TaskDispatchRequest, TaskStep, WireMessage,
    };
    use taskgate::transport::{Envelope, InMemoryTransport, Transport};
    use taskgate::RejectReason;

    const WAIT: Duration = Duration::from_secs(5);

    /// 总是给出同一组步骤的规划器
    struct FixedPlanner(Vec<TaskStep>);

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn plan(&self, _objective: &str) -> PlanOutcome {
            PlanOutcome::Plan(TaskPlan::new(self.0.clone(), TaskConstraints::default()))
        }
    }

    struct CountingSummarise(Arc<AtomicUsize>);

    #[async_trait]
    impl ActionHandler for CountingSummarise {
        fn name(&self) -> &str {
            "summarise_text"
        }

        async fn handle(
            &self,
            params: Map<String, Value>,
            _previous_output: ActionOutput,
        ) -> Result<ActionOutput, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let mut out = Map::new();
            out.insert("summary".into(), params.get("text").cloned().unwrap_or(json!("")));
            Ok(out)
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn demo_tree(base: &Path) {
        let repo = base.join("demo_projects").join("alpha");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::write(repo.join("README.md"), "# alpha\n").unwrap();
    }

    struct Harness {
        transport: Arc<InMemoryTransport>,
        orchestrator: Arc<Orchestrator>,
        orchestrator_inbox: UnboundedReceiver<Envelope>,
        replies: UnboundedReceiver<Reply>,
        token: CancellationToken,
        _dir: TempDir,
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.app.owner_id = "u1".into();
        config.app.device_id = "d1".into();
        config
    }

    async fn harness(
        planner: Arc<dyn Planner>,
        actions: Option<ActionRegistry>,
        remote: PolicyConfig,
    ) -> Harness {
        taskgate::observability::try_init_for_tests();
        let dir = TempDir::new().unwrap();
        let base = dir.path().to_path_buf();
        demo_tree(&base);
        let config = config();

        let transport = Arc::new(InMemoryTransport::new());
        let orchestrator_inbox = transport.register("orchestrator").await;
        let connector_inbox = transport.register("connector").await;

        let actions = actions.unwrap_or_else(|| {
            let mut registry = ActionRegistry::new();
            register_builtin(&mut registry, &base);
            registry
        });
        let local = PolicyEngine::with_dirs(
            "local",
            PolicyConfig::local_default(),
            base.clone(),
            base.clone(),
        );
        let connector = Connector::new("connector", &config, actions, transport.clone())
            .unwrap()
            .with_policy(local);

        let (orchestrator, replies) = Orchestrator::new(
            "orchestrator",
            taskgate::identity::Identity::generate(),
            &config,
            planner,
            transport.clone(),
        )
        .unwrap();
        let orchestrator = Arc::new(orchestrator.with_policy(PolicyEngine::with_dirs(
            "remote",
            remote,
            base.clone(),
            base,
        )));

        let token = CancellationToken::new();
        spawn_connector(Arc::new(connector), connector_inbox, token.clone());

        Harness {
            transport,
            orchestrator,
            orchestrator_inbox,
            replies,
            token,
            _dir: dir,
        }
    }

    impl Harness {
        async fn next_message(&mut self) -> Envelope {
            tokio::time::timeout(WAIT, self.orchestrator_inbox.recv())
                .await
                .expect("message within timeout")
                .expect("inbox open")
        }

        async fn next_result(&mut self) -> ExecutionResult {
            match self.next_message().await.message {
                WireMessage::TaskExecutionResult(result) => result,
                other => panic!("expected execution result, got {}", other.kind()),
            }
        }

        async fn next_reply(&mut self) -> Reply {
            tokio::time::timeout(WAIT, self.replies.recv())
                .await
                .expect("reply within timeout")
                .expect("reply channel open")
        }

        async fn pair(&mut self) {
            self.orchestrator
                .request_pairing("connector", vec!["scan_directory".into()])
                .await
                .unwrap();
            let envelope = self.next_message().await;
            assert_eq!(envelope.message.kind(), "pair_device_response");
            self.orchestrator.handle_envelope(envelope).await;
            assert_eq!(
                self.orchestrator.device_address("u1", "d1").await.as_deref(),
                Some("connector")
            );
        }

        async fn dispatch(&self, sender: &str, text: &str) -> String {
            match self.orchestrator.handle_objective(sender, text).await.unwrap() {
                ObjectiveOutcome::Dispatched { task_id } => task_id,
                other => panic!("expected dispatch, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_pair_and_execute_three_step_plan() {
        let mut h = harness(
            Arc::new(KeywordPlanner::new()),
            None,
            PolicyConfig::remote_default(),
        )
        .await;
        h.pair().await;

        let task_id = h
            .dispatch("s1", "scan my projects, build the weekly report and post it to slack")
            .await;
        let result = h.next_result().await;
        assert_eq!(result.task_id, task_id);
        assert_eq!(result.status, ExecutionStatus::Completed);
        let actions: Vec<&str> = result.step_results.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(actions, vec!["scan_directory", "generate_report", "post_summary"]);
        assert!(result
            .step_results
            .iter()
            .all(|s| s.status == StepStatus::Completed));
        assert_eq!(result.outputs["scan_directory"]["repos"][0]["repo"], json!("alpha"));

        h.orchestrator
            .handle_execution_result("connector", result)
            .await;
        let reply = h.next_reply().await;
        assert_eq!(reply.origin.sender_id, "s1");
        assert!(reply.text.starts_with("# Weekly Dev Report"));
        assert!(reply.text.contains("alpha"));
    }

    #[tokio::test]
    async fn test_local_policy_rejects_action_remote_allowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut actions = ActionRegistry::new();
        actions.register(CountingSummarise(calls.clone()));

        let mut remote = PolicyConfig::remote_default();
        remote.allowed_actions.push("delete_all".into());
        let planner = FixedPlanner(vec![
            TaskStep::local("summarise_text", params(json!({"text": "hi"}))),
            TaskStep::local("delete_all", Map::new()),
        ]);
        let mut h = harness(Arc::new(planner), Some(actions), remote).await;
        h.pair().await;

        let task_id = h.dispatch("s1", "summarise and clean up").await;
        let result = h.next_result().await;
        assert_eq!(result.task_id, task_id);
        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert_eq!(result.reason, Some(RejectReason::ActionNotAllowed));
        assert!(result.step_results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        h.orchestrator.handle_execution_result("connector", result).await;
        let reply = h.next_reply().await;
        assert!(reply.text.contains(&task_id));
        assert!(reply.text.contains("action_not_allowed"));
    }

    #[tokio::test]
    async fn test_remote_policy_rejects_before_dispatch() {
        let planner = FixedPlanner(vec![TaskStep::local("rm_rf", Map::new())]);
        let mut h = harness(Arc::new(planner), None, PolicyConfig::remote_default()).await;
        h.pair().await;

        match h.orchestrator.handle_objective("s1", "run the cleanup").await.unwrap() {
            ObjectiveOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::ActionNotAllowed)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.next_reply().await.text.contains("was rejected."));
        assert_eq!(h.orchestrator.correlator().pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_unpaired_device_rejected() {
        let mut h = harness(
            Arc::new(KeywordPlanner::new()),
            None,
            PolicyConfig::remote_default(),
        )
        .await;
        match h.orchestrator.handle_objective("s1", "scan my projects").await.unwrap() {
            ObjectiveOutcome::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::DeviceNotPaired)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.next_reply().await.text.contains("device_not_paired"));
    }

    async fn send_direct(h: &Harness, request: TaskDispatchRequest) -> ExecutionResult {
        let mut inbox = h.transport.register("tester").await;
        h.transport
            .send("tester", "connector", WireMessage::TaskDispatchRequest(request))
            .await
            .unwrap();
        let envelope = tokio::time::timeout(WAIT, inbox.recv())
            .await
            .expect("result within timeout")
            .expect("inbox open");
        match envelope.message {
            WireMessage::TaskExecutionResult(result) => result,
            other => panic!("unexpected {}", other.kind()),
        }
    }

    fn signed_request(h: &Harness) -> (TaskPlan, TaskDispatchRequest) {
        let plan = TaskPlan::new(
            vec![TaskStep::local("summarise_text", params(json!({"text": "hi"})))],
            TaskConstraints::default(),
        );
        let envelope = SignedEnvelope::seal(h.orchestrator.identity(), &plan).unwrap();
        (plan, TaskDispatchRequest::new("u1", "d1", envelope))
    }

    #[tokio::test]
    async fn test_flipped_signature_never_executes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut actions = ActionRegistry::new();
        actions.register(CountingSummarise(calls.clone()));
        let mut h = harness(
            Arc::new(KeywordPlanner::new()),
            Some(actions),
            PolicyConfig::remote_default(),
        )
        .await;
        h.pair().await;

        let (plan, mut request) = signed_request(&h);
        let first = request.signature.remove(0);
        request
            .signature
            .insert(0, if first == 'a' { 'b' } else { 'a' });

        let result = send_direct(&h, request).await;
        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert_eq!(result.reason, Some(RejectReason::InvalidSignature));
        assert_eq!(result.task_id, plan.task_id);
        assert!(result.step_results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_canonical_payload_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut actions = ActionRegistry::new();
        actions.register(CountingSummarise(calls.clone()));
        let mut h = harness(
            Arc::new(KeywordPlanner::new()),
            Some(actions),
            PolicyConfig::remote_default(),
        )
        .await;
        h.pair().await;

        // 同一逻辑计划，多一个空格就不再是签名时的字节
        let (_, mut request) = signed_request(&h);
        request.task_plan_canonical = request.task_plan_canonical.replacen(':', ": ", 1);

        let result = send_direct(&h, request).await;
        assert_eq!(result.reason, Some(RejectReason::InvalidSignature));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let (_, valid) = signed_request(&h);
        assert_eq!(send_direct(&h, valid).await.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repeat_objective_within_cooldown_dropped() {
        let mut h = harness(
            Arc::new(KeywordPlanner::new()),
            None,
            PolicyConfig::remote_default(),
        )
        .await;
        h.pair().await;

        h.dispatch("s1", "scan my projects").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.orchestrator.handle_objective("s1", "scan my projects").await.unwrap(),
            ObjectiveOutcome::Filtered(FilterRejection::Cooldown)
        );
        assert_eq!(h.orchestrator.correlator().pending_len().await, 1);

        let _ = h.next_result().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(200), h.orchestrator_inbox.recv())
                .await
                .is_err(),
            "only one dispatch should reach the connector"
        );
    }

    #[tokio::test]
    async fn test_duplicate_deliveries_execute_once_and_reply_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut actions = ActionRegistry::new();
        actions.register(CountingSummarise(calls.clone()));
        let planner = FixedPlanner(vec![TaskStep::local(
            "summarise_text",
            params(json!({"text": "hello"})),
        )]);
        let mut h = harness(Arc::new(planner), Some(actions), PolicyConfig::remote_default()).await;
        h.pair().await;

        h.transport.set_duplicate_deliveries(true);
        let task_id = h.dispatch("s1", "summarise hello").await;

        let mut results = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(300), h.orchestrator_inbox.recv()).await
        {
            results.push(envelope);
        }
        assert!(results.len() >= 2);
        for envelope in results {
            h.orchestrator.handle_envelope(envelope).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let reply = h.next_reply().await;
        assert!(reply.text.contains(&task_id));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.replies.recv())
                .await
                .is_err(),
            "late duplicates must not produce a second reply"
        );
    }

    #[tokio::test]
    async fn test_forged_result_from_other_address_ignored() {
        let planner = FixedPlanner(vec![TaskStep::local(
            "summarise_text",
            params(json!({"text": "hello"})),
        )]);
        let mut h = harness(Arc::new(planner), None, PolicyConfig::remote_default()).await;
        h.pair().await;

        let task_id = h.dispatch("s1", "summarise hello").await;
        let forged = ExecutionResult {
            task_id: task_id.clone(),
            status: ExecutionStatus::Completed,
            step_results: vec![],
            outputs: params(json!({"summarise_text": {"summary": "forged"}})),
            reason: None,
        };
        h.orchestrator.handle_execution_result("attacker", forged).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.replies.recv())
                .await
                .is_err(),
            "a result from another address must not reach the sender"
        );
        assert_eq!(h.orchestrator.correlator().pending_len().await, 1);

        let result = h.next_result().await;
        h.orchestrator.handle_execution_result("connector", result).await;
        let reply = h.next_reply().await;
        assert!(reply.text.contains(&task_id));
        assert!(!reply.text.contains("forged"));
    }

    #[tokio::test]
    async fn test_results_out_of_order_reach_their_senders() {
        let planner = FixedPlanner(vec![TaskStep::local(
            "summarise_text",
            params(json!({"text": "status"})),
        )]);
        let mut h = harness(Arc::new(planner), None, PolicyConfig::remote_default()).await;
        h.pair().await;

        let senders = ["s1", "s2", "s3"];
        let (a, b, c) = tokio::join!(
            h.dispatch(senders[0], "summarise status"),
            h.dispatch(senders[1], "summarise status"),
            h.dispatch(senders[2], "summarise status"),
        );
        let task_ids = [a, b, c];

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(h.next_result().await);
        }
        results.reverse();
        for result in results {
            h.orchestrator.handle_execution_result("connector", result).await;
        }

        for _ in 0..3 {
            let reply = h.next_reply().await;
            let idx = senders
                .iter()
                .position(|s| *s == reply.origin.sender_id)
                .expect("known sender");
            assert!(reply.text.contains(&task_ids[idx]));
        }
        assert_eq!(h.orchestrator.correlator().pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_actors_end_to_end() {
        let h = harness(
            Arc::new(KeywordPlanner::new()),
            None,
            PolicyConfig::remote_default(),
        )
        .await;
        let Harness {
            orchestrator,
            orchestrator_inbox,
            mut replies,
            token,
            ..
        } = h;
        spawn_orchestrator(orchestrator.clone(), orchestrator_inbox, token.clone());

        orchestrator.request_pairing("connector", vec![]).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while orchestrator.device_address("u1", "d1").await.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("paired in time");

        orchestrator
            .handle_objective("s9", "generate the weekly report for my projects")
            .await
            .unwrap();
        let reply = tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("reply in time")
            .expect("channel open");
        assert_eq!(reply.origin.sender_id, "s9");
        assert!(reply.text.starts_with("# Weekly Dev Report"));
        token.cancel();
    }
}
