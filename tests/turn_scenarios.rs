use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use screenpilot::computer::ComputerCall;
use screenpilot::providers::{AnthropicProvider, ScriptStep, ScriptedProvider};
use screenpilot::tools::{application_tools, ApplicationControl};
use screenpilot::{
    Action, ActionVerb, Agent, AgentConfig, AnthropicConfig, AgentError, ConversationItem, DirectiveCall,
    DirectiveKind, DirectiveResult, MouseButton, Payload, ProviderKind, RecordingComputer,
    Role, SafetyCheck, SafetyGate, StopHandle, ToolRegistry, TurnOutcome, UnknownActionPolicy,
    STOPPED_MESSAGE,
};
use serde_json::{json, Map, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn screen_call(id: &str, action: Action) -> ConversationItem {
    ConversationItem::call(DirectiveCall {
        call_id: id.into(),
        kind: DirectiveKind::ScreenAction { action },
        pending_safety_checks: vec![],
    })
}

fn click(id: &str, x: i64, y: i64) -> ConversationItem {
    screen_call(id, Action::click(x, y, MouseButton::Left))
}

fn tool_call(id: &str, name: &str) -> ConversationItem {
    ConversationItem::call(DirectiveCall {
        call_id: id.into(),
        kind: DirectiveKind::ToolCall {
            name: name.into(),
            arguments: Map::new(),
        },
        pending_safety_checks: vec![],
    })
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    computer: Arc<RecordingComputer>,
    streamed: Arc<Mutex<Vec<ConversationItem>>>,
    agent: Agent,
}

impl Harness {
    fn new(provider: ScriptedProvider, computer: RecordingComputer) -> Self {
        Self::with_config(provider, computer, AgentConfig::for_provider(ProviderKind::Anthropic))
    }

    fn with_config(provider: ScriptedProvider, computer: RecordingComputer, cfg: AgentConfig) -> Self {
        let provider = Arc::new(provider);
        let computer = Arc::new(computer);
        let streamed = Arc::new(Mutex::new(Vec::new()));
        let sink = streamed.clone();
        let agent = Agent::new(provider.clone(), computer.clone(), cfg)
            .with_safety_gate(SafetyGate::acknowledge_all())
            .on_item(move |item| sink.lock().unwrap().push(item.clone()));
        Self { provider, computer, streamed, agent }
    }

    fn streamed(&self) -> Vec<ConversationItem> {
        self.streamed.lock().unwrap().clone()
    }

    fn outputs(&self) -> usize {
        self.streamed().iter().filter(|i| i.as_output().is_some()).count()
    }
}

/// Every output follows the call it answers, and every call id is answered at most once.
fn assert_linked(items: &[ConversationItem]) {
    let mut open: Vec<&str> = Vec::new();
    let mut answered: Vec<&str> = Vec::new();
    for item in items {
        if let Some(call) = item.as_call() {
            open.push(&call.call_id);
        }
        if let Some(output) = item.as_output() {
            assert!(
                open.contains(&output.call_id.as_str()),
                "output {} appended before its call",
                output.call_id
            );
            assert!(!answered.contains(&output.call_id.as_str()), "duplicate output {}", output.call_id);
            answered.push(&output.call_id);
        }
    }
}

#[tokio::test]
async fn text_reply_completes_turn() {
    let h = Harness::new(
        ScriptedProvider::replies([vec![ConversationItem::agent("Done.")]]),
        RecordingComputer::new(),
    );
    let outcome = h.agent.run_turn(vec![ConversationItem::user("hello")]).await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Completed { items: vec![ConversationItem::agent("Done.")] }
    );
    assert_eq!(h.streamed(), vec![ConversationItem::agent("Done.")]);
    assert!(h.computer.calls().is_empty());
}

#[tokio::test]
async fn click_directive_captures_once_and_loop_continues() {
    let h = Harness::new(
        ScriptedProvider::replies([vec![click("c1", 120, 340)], vec![ConversationItem::agent("Clicked.")]]),
        RecordingComputer::new().with_image(vec![7; 16]),
    );
    let outcome = h.agent.run_turn(vec![ConversationItem::user("click")]).await.unwrap();

    assert_eq!(
        h.computer.calls(),
        vec![
            ComputerCall::Click { x: 120, y: 340, button: MouseButton::Left },
            ComputerCall::Capture,
        ]
    );
    let items = outcome.items();
    assert_eq!(items.len(), 3);
    let output = items[1].as_output().unwrap();
    assert_eq!(output.call_id, "c1");
    assert!(matches!(
        &output.result,
        DirectiveResult::Screen { screenshot, current_url: None } if screenshot.data == vec![7; 16]
    ));
    assert_eq!(outcome.final_text(), Some("Clicked."));
    assert_eq!(h.provider.call_count(), 2);
    let second_request = &h.provider.requests()[1];
    assert_eq!(second_request.last().and_then(|i| i.as_output()).map(|o| o.call_id.as_str()), Some("c1"));
}

#[tokio::test]
async fn declined_safety_check_ends_turn_without_output() {
    let call = ConversationItem::call(DirectiveCall {
        call_id: "c1".into(),
        kind: DirectiveKind::ScreenAction { action: Action::click(5, 5, MouseButton::Left) },
        pending_safety_checks: vec![SafetyCheck::new("This will delete files")],
    });
    let provider = Arc::new(ScriptedProvider::replies([vec![call], vec![ConversationItem::agent("never")]]));
    let streamed = Arc::new(Mutex::new(Vec::new()));
    let sink = streamed.clone();
    let asked = Arc::new(Mutex::new(Vec::new()));
    let asked_log = asked.clone();
    let agent = Agent::new(
        provider.clone(),
        Arc::new(RecordingComputer::new()),
        AgentConfig::for_provider(ProviderKind::OpenAi),
    )
    .with_safety_gate(SafetyGate::new(move |message| {
        asked_log.lock().unwrap().push(message.to_string());
        false
    }))
    .on_item(move |item| sink.lock().unwrap().push(item.clone()));

    let err = agent.run_turn(vec![ConversationItem::user("clean up")]).await.unwrap_err();
    assert!(matches!(err, AgentError::UnacknowledgedSafetyCheck { ref message } if message == "This will delete files"));
    assert_eq!(*asked.lock().unwrap(), vec!["This will delete files"]);
    assert!(streamed.lock().unwrap().iter().all(|i| i.as_output().is_none()));
    assert_eq!(provider.call_count(), 1);
    assert_eq!(agent.state(), screenpilot::TurnState::Terminated(screenpilot::Termination::Error));
}

#[tokio::test]
async fn blocked_browser_destination_is_fatal() {
    let h = Harness::new(
        ScriptedProvider::replies([vec![click("c1", 1, 1)], vec![ConversationItem::agent("never")]]),
        RecordingComputer::browser("https://evilvideos.com/x"),
    );
    let err = h.agent.run_turn(vec![ConversationItem::user("watch")]).await.unwrap_err();
    assert!(matches!(err, AgentError::BlockedDestination { ref url } if url == "https://evilvideos.com/x"));
    assert_eq!(h.computer.calls().last(), Some(&ComputerCall::CurrentUrl));
    assert_eq!(h.outputs(), 0);
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn blocklist_covers_subdomains_in_loop() {
    for url in [
        "https://maliciousbook.com/",
        "https://www.darkwebforum.com/thread/1",
        "http://m.shadytok.com",
        "https://a.b.suspiciouspins.com/pin",
        "https://www.ilanbigio.com/",
    ] {
        let h = Harness::new(
            ScriptedProvider::replies([vec![screen_call("s1", Action::new(ActionVerb::Screenshot))]]),
            RecordingComputer::browser(url),
        );
        let err = h.agent.run_turn(vec![]).await.unwrap_err();
        assert!(matches!(err, AgentError::BlockedDestination { .. }), "{url} should be blocked");
        assert_eq!(h.outputs(), 0);
    }

    let h = Harness::new(
        ScriptedProvider::replies([
            vec![screen_call("s1", Action::new(ActionVerb::Screenshot))],
            vec![ConversationItem::agent("fine")],
        ]),
        RecordingComputer::browser("https://notevilvideos.com/"),
    );
    let outcome = h.agent.run_turn(vec![]).await.unwrap();
    let output = outcome.items()[1].as_output().unwrap();
    assert!(matches!(
        &output.result,
        DirectiveResult::Screen { current_url: Some(u), .. } if u == "https://notevilvideos.com/"
    ));
}

#[tokio::test]
async fn stop_after_directive_call_appended() {
    let handle: Arc<OnceLock<StopHandle>> = Arc::new(OnceLock::new());
    let trigger = handle.clone();
    let provider = Arc::new(ScriptedProvider::replies([
        vec![click("c1", 10, 10)],
        vec![ConversationItem::agent("never")],
    ]));
    let computer = Arc::new(RecordingComputer::new());
    let streamed = Arc::new(Mutex::new(Vec::new()));
    let sink = streamed.clone();
    let agent = Agent::new(
        provider.clone(),
        computer.clone(),
        AgentConfig::for_provider(ProviderKind::Anthropic),
    )
    .on_item(move |item| {
        sink.lock().unwrap().push(item.clone());
        if item.as_call().is_some() {
            if let Some(h) = trigger.get() {
                h.stop();
            }
        }
    });
    handle.set(agent.stop_handle()).ok().unwrap();

    let outcome = agent.run_turn(vec![ConversationItem::user("go")]).await.unwrap();
    assert!(outcome.is_stopped());
    let items = outcome.items();
    assert_eq!(items.len(), 2);
    assert!(items[0].as_call().is_some());
    assert_eq!(items[1], ConversationItem::agent(STOPPED_MESSAGE));
    let stops = streamed
        .lock()
        .unwrap()
        .iter()
        .filter(|i| i.text() == Some(STOPPED_MESSAGE))
        .count();
    assert_eq!(stops, 1);
    assert_eq!(provider.call_count(), 1);
    assert!(computer.calls().is_empty());
}

#[tokio::test]
async fn stop_during_directive_discards_its_output() {
    let handle: Arc<OnceLock<StopHandle>> = Arc::new(OnceLock::new());
    let trigger = handle.clone();
    let computer = RecordingComputer::new().on_call(move |call| {
        if matches!(call, ComputerCall::Click { .. }) {
            if let Some(h) = trigger.get() {
                h.stop();
            }
        }
    });
    let h = Harness::new(
        ScriptedProvider::replies([
            vec![click("c1", 1, 1), click("c2", 2, 2)],
            vec![ConversationItem::agent("never")],
        ]),
        computer,
    );
    handle.set(h.agent.stop_handle()).ok().unwrap();

    let outcome = h.agent.run_turn(vec![]).await.unwrap();
    assert!(outcome.is_stopped());
    // The in-flight action finishes, nothing after it starts.
    assert_eq!(
        h.computer.calls(),
        vec![ComputerCall::Click { x: 1, y: 1, button: MouseButton::Left }, ComputerCall::Capture]
    );
    assert_eq!(h.outputs(), 0);
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn stop_while_awaiting_model() {
    let h = Harness::new(ScriptedProvider::new([ScriptStep::Hang]), RecordingComputer::new());
    let stop = h.agent.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();
    });
    let outcome = tokio::time::timeout(Duration::from_secs(5), h.agent.run_turn(vec![]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Stopped { items: vec![ConversationItem::agent(STOPPED_MESSAGE)] });
}

#[tokio::test]
async fn a_new_turn_starts_with_a_fresh_token() {
    let h = Harness::new(
        ScriptedProvider::new([ScriptStep::Hang, ScriptStep::Reply(vec![ConversationItem::agent("back")])]),
        RecordingComputer::new(),
    );
    let stop = h.agent.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();
    });
    assert!(h.agent.run_turn(vec![]).await.unwrap().is_stopped());
    let second = h.agent.run_turn(vec![]).await.unwrap();
    assert_eq!(second.final_text(), Some("back"));
}

#[tokio::test]
async fn unknown_verbs_are_skipped_or_fatal_by_policy() {
    let script = || {
        ScriptedProvider::replies([
            vec![screen_call("u1", Action::new(ActionVerb::Other("zoom".into())))],
            vec![ConversationItem::agent("carried on")],
        ])
    };

    let h = Harness::new(script(), RecordingComputer::new());
    let outcome = h.agent.run_turn(vec![]).await.unwrap();
    assert_eq!(outcome.final_text(), Some("carried on"));
    assert_eq!(h.outputs(), 0);
    assert!(h.computer.calls().is_empty());

    let mut cfg = AgentConfig::for_provider(ProviderKind::Anthropic);
    cfg.unknown_actions = UnknownActionPolicy::Fail;
    let h = Harness::with_config(script(), RecordingComputer::new(), cfg);
    assert!(matches!(h.agent.run_turn(vec![]).await, Err(AgentError::UnknownAction(v)) if v == "zoom"));
}

#[tokio::test]
async fn capture_failure_is_fatal() {
    let h = Harness::new(
        ScriptedProvider::replies([vec![click("c1", 1, 1)]]),
        RecordingComputer::new().without_capture(),
    );
    let err = h.agent.run_turn(vec![]).await.unwrap_err();
    assert!(matches!(err, AgentError::Capability(_)));
}

#[tokio::test]
async fn input_failures_do_not_abort_the_turn() {
    let h = Harness::new(
        ScriptedProvider::replies([vec![click("c1", 1, 1)], vec![ConversationItem::agent("ok")]]),
        RecordingComputer::new().with_failing_input(),
    );
    let outcome = h.agent.run_turn(vec![]).await.unwrap();
    assert_eq!(outcome.final_text(), Some("ok"));
    assert_eq!(h.outputs(), 1);
}

struct Apps;

#[async_trait::async_trait]
impl ApplicationControl for Apps {
    async fn switch_to(&self, _app_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn open(&self, app_name: &str) -> anyhow::Result<()> {
        anyhow::bail!("{app_name} is not installed")
    }

    async fn active(&self) -> anyhow::Result<String> {
        Ok("Finder".into())
    }
}

#[tokio::test]
async fn mixed_batches_keep_call_output_linkage() {
    let mut registry = ToolRegistry::new();
    for tool in application_tools(Arc::new(Apps)) {
        registry.register(tool);
    }
    let provider = Arc::new(ScriptedProvider::replies([
        vec![
            ConversationItem::agent("Let me check."),
            tool_call("f1", "get_active_application"),
            click("c1", 3, 3),
        ],
        vec![tool_call("f2", "open_application"), tool_call("f3", "teleport")],
        vec![
            screen_call("k1", Action::key_chord(vec!["cmd".into(), "space".into()])),
            ConversationItem::agent("All done."),
        ],
        vec![ConversationItem::agent("All done, really.")],
    ]));
    let streamed = Arc::new(Mutex::new(Vec::new()));
    let sink = streamed.clone();
    let agent = Agent::new(
        provider.clone(),
        Arc::new(RecordingComputer::new()),
        AgentConfig::for_provider(ProviderKind::OpenAi),
    )
    .with_tools(registry)
    .on_item(move |item| sink.lock().unwrap().push(item.clone()));

    let outcome = agent.run_turn(vec![ConversationItem::user("work")]).await.unwrap();
    let items = outcome.items();
    assert_linked(items);
    assert_eq!(*streamed.lock().unwrap(), items.to_vec());

    // A text item mid-batch is not terminal while later items follow it.
    assert_eq!(provider.call_count(), 4);
    assert_eq!(outcome.final_text(), Some("All done, really."));

    let result_of = |id: &str| {
        items
            .iter()
            .filter_map(ConversationItem::as_output)
            .find(|o| o.call_id == id)
            .map(|o| o.result.clone())
    };
    assert_eq!(result_of("f1"), Some(DirectiveResult::Tool { output: json!({"active_application": "Finder"}) }));
    assert!(matches!(result_of("f2"), Some(DirectiveResult::Failed { .. })));
    assert!(matches!(
        result_of("f3"),
        Some(DirectiveResult::Tool { output }) if output["status"] == "unavailable"
    ));
    assert!(matches!(result_of("k1"), Some(DirectiveResult::Screen { .. })));
}

#[tokio::test]
async fn loop_terminates_once_model_answers() {
    for directives in [0usize, 1, 4, 9] {
        let mut replies: Vec<Vec<ConversationItem>> = (0..directives)
            .map(|i| vec![click(&format!("c{i}"), i as i64, i as i64)])
            .collect();
        replies.push(vec![ConversationItem::agent("finished")]);
        let h = Harness::new(ScriptedProvider::replies(replies), RecordingComputer::new());

        let outcome = h.agent.run_turn(vec![]).await.unwrap();
        assert_eq!(h.provider.call_count(), directives + 1);
        assert_eq!(outcome.items().len(), directives * 2 + 1);
        assert_eq!(h.computer.capture_count(), directives);
        assert_linked(outcome.items());
    }
}

#[tokio::test]
async fn caller_history_is_replayed_but_not_returned() {
    let history = vec![
        ConversationItem::user("earlier question"),
        ConversationItem::agent("earlier answer"),
        ConversationItem {
            role: Role::User,
            payload: Payload::Content { text: "new question".into() },
        },
    ];
    let h = Harness::new(
        ScriptedProvider::replies([vec![ConversationItem::agent("new answer")]]),
        RecordingComputer::new(),
    );
    let outcome = h.agent.run_turn(history.clone()).await.unwrap();
    assert_eq!(outcome.items(), &[ConversationItem::agent("new answer")]);
    let sent = &h.provider.requests()[0];
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(&sent[1..], history.as_slice());
}

#[tokio::test]
async fn skipped_action_is_answered_on_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{
                "type": "tool_use",
                "id": "toolu_1",
                "name": "computer",
                "input": {"action": "triple_click", "coordinate": [40, 50]}
            }]
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "Selected another way."}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(AnthropicConfig {
        api_base: server.uri(),
        api_key: "sk-test".into(),
        ..AnthropicConfig::default()
    })
    .unwrap();
    let computer = Arc::new(RecordingComputer::new());
    let agent = Agent::new(
        Arc::new(provider),
        computer.clone(),
        AgentConfig::for_provider(ProviderKind::Anthropic),
    );

    let outcome = agent.run_turn(vec![ConversationItem::user("select the line")]).await.unwrap();
    assert_eq!(outcome.final_text(), Some("Selected another way."));
    assert!(outcome.items().iter().all(|i| i.as_output().is_none()));
    assert_eq!(computer.capture_count(), 0);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["content"][0]["id"], "toolu_1");
    let result = &messages[2]["content"][0];
    assert_eq!(messages[2]["role"], "user");
    assert_eq!(result["type"], "tool_result");
    assert_eq!(result["tool_use_id"], "toolu_1");
    assert_eq!(result["is_error"], true);
}

#[tokio::test]
async fn stopped_turn_items_carry_into_the_next_turn() {
    let handle: Arc<OnceLock<StopHandle>> = Arc::new(OnceLock::new());
    let trigger = handle.clone();
    let provider = Arc::new(ScriptedProvider::replies([
        vec![click("c1", 10, 10)],
        vec![ConversationItem::agent("Picking up where we left off.")],
    ]));
    let agent = Agent::new(
        provider.clone(),
        Arc::new(RecordingComputer::new()),
        AgentConfig::for_provider(ProviderKind::Anthropic),
    )
    .on_item(move |item| {
        if item.as_call().is_some() {
            if let Some(h) = trigger.get() {
                h.stop();
            }
        }
    });
    handle.set(agent.stop_handle()).ok().unwrap();

    let first = agent.run_turn(vec![ConversationItem::user("go")]).await.unwrap();
    assert!(first.is_stopped());

    let mut history = vec![ConversationItem::user("go")];
    history.extend(first.into_items());
    history.push(ConversationItem::user("continue"));
    let second = agent.run_turn(history.clone()).await.unwrap();
    assert_eq!(second.final_text(), Some("Picking up where we left off."));

    let sent = &provider.requests()[1];
    assert_eq!(&sent[1..], history.as_slice());
    assert!(sent.iter().all(|i| i.as_output().is_none()));
}

