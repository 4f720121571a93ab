//! End-to-end agent behavior against a mock ledger and mock HTTP services

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use governance_agent::agent::proposer::ProposalOutcome;
use governance_agent::agent::supervisor::SupervisorState;
use governance_agent::agent::{Agent, AgentClients, AgentTimings};
use governance_agent::api::create_router;
use governance_agent::config::{ActionEndpoint, AgentConfig, ProposalRule};
use governance_agent::ledger::mock::MockLedger;
use governance_agent::ledger::{encode_store_call, ActionValue, ProposalState, Stance};
use governance_agent::telemetry::query::PromQlCompiler;
use governance_agent::telemetry::PrometheusClient;

/// Matches telemetry queries mentioning a metric
struct QueryMentions(&'static str);

impl Match for QueryMentions {
    fn matches(&self, request: &Request) -> bool {
        request
            .url
            .query_pairs()
            .any(|(key, value)| key == "query" && value.contains(self.0))
    }
}

fn signal(value: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "status": "success",
        "data": {
            "resultType": "vector",
            "result": [{"metric": {}, "value": [1700000000.0, value]}]
        }
    }))
}

async fn telemetry_server(cpu_high: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .and(QueryMentions("cpu_high"))
        .respond_with(signal(cpu_high))
        .mount(&server)
        .await;
    server
}

fn operating_config(actions_uri: &str) -> AgentConfig {
    let mut actions_map = BTreeMap::new();
    actions_map.insert(
        "2".to_string(),
        ActionEndpoint {
            action_endpoint: format!("{}/scale-up", actions_uri),
            args: json!({"replicas": 3}),
        },
    );
    AgentConfig {
        metric_index: "1".to_string(),
        rules: vec![ProposalRule {
            event: "cpu_high > 0".to_string(),
            message: "scale-up".to_string(),
            action_value: ActionValue(2),
            vote_condition: None,
        }],
        actions_map,
    }
}

fn agent(ledger: &Arc<MockLedger>, telemetry_uri: &str, actions_uri: &str) -> Arc<Agent> {
    let clients = AgentClients {
        governance: ledger.clone(),
        store: ledger.clone(),
        telemetry: Arc::new(PrometheusClient::new(telemetry_uri, Duration::from_secs(2))),
        compiler: Arc::new(PromQlCompiler::default()),
    };
    let timings = AgentTimings {
        poll_interval: Duration::from_millis(20),
        call_timeout: Duration::from_secs(2),
        dispatch_timeout: Duration::from_secs(2),
    };
    Arc::new(Agent::new(
        "edge-1",
        operating_config(actions_uri),
        clients,
        timings,
    ))
}

/// Poll `check` until it holds or the deadline passes
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_rule_fires_once_then_cooldown() {
    let telemetry = telemetry_server("1").await;
    let actions = MockServer::start().await;
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), &actions.uri());

    agent.start().await.unwrap();

    let ctx = agent.context().clone();
    eventually("scale-up cooldown", || {
        let ctx = ctx.clone();
        async move { ctx.book.in_cooldown("scale-up").await }
    })
    .await;

    // A few more iterations must not submit a second proposal
    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.shutdown().await;

    assert_eq!(ledger.propose_count(), 1);
    let proposals = ledger.proposals();
    assert!(proposals[0].description.contains("scale-up"));
    assert!(proposals[0].description.starts_with("edge-1 "));
    assert_eq!(proposals[0].calldatas[0], encode_store_call(ActionValue(2)));
}

#[tokio::test]
async fn test_live_duplicate_is_redundant() {
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, "http://127.0.0.1:1", "http://127.0.0.1:1");

    for state in [ProposalState::Pending, ProposalState::Active] {
        let payload = encode_store_call(ActionValue(5));
        let id = ledger.insert_proposal(payload, state);

        let before = ledger.propose_count();
        let outcome = agent.create_proposal(ActionValue(5), "peer-action").await.unwrap();

        assert!(matches!(outcome, ProposalOutcome::Redundant { .. }));
        assert_eq!(ledger.propose_count(), before);
        ledger.set_state(&id, ProposalState::Executed);
    }

    let outcome = agent.create_proposal(ActionValue(5), "peer-action").await.unwrap();
    assert!(matches!(outcome, ProposalOutcome::Created { .. }));
}

#[tokio::test]
async fn test_reconfiguration_clears_cooldown() {
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, "http://127.0.0.1:1", "http://127.0.0.1:1");
    let ctx = agent.context();

    ctx.book.add_cooldown("scale-up").await;
    ctx.book.add_cooldown("scale-down").await;

    let mut config = operating_config("http://127.0.0.1:1");
    config.metric_index = "9".to_string();
    assert!(agent.update_config(config).await.unwrap());

    assert!(ctx.book.cooldown().await.is_empty());
    assert_eq!(agent.status().await.config.metric_index, "9");
}

#[tokio::test]
async fn test_one_vote_when_proposal_turns_active() {
    let telemetry = telemetry_server("0").await;
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), "http://127.0.0.1:1");
    let ctx = agent.context().clone();

    let id = ledger.insert_proposal(encode_store_call(ActionValue(4)), ProposalState::Pending);
    agent.start().await.unwrap();

    eventually("proposal pending", || {
        let ctx = ctx.clone();
        let id = id.clone();
        async move { ctx.book.pending().await.contains(&id) }
    })
    .await;
    assert!(ledger.votes().is_empty());

    ledger.set_state(&id, ProposalState::Active);
    eventually("vote cast", || {
        let ledger = ledger.clone();
        async move { !ledger.votes().is_empty() }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.shutdown().await;

    assert_eq!(ledger.votes().len(), 1);
    assert!(ctx.book.pending().await.is_empty());
    assert!(ctx.book.has_voted(&id).await);
}

#[tokio::test]
async fn test_vote_uses_latest_decision() {
    let telemetry = telemetry_server("0").await;
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), "http://127.0.0.1:1");
    agent.start().await.unwrap();

    agent.context().vote.set(Stance::Against).await;
    let id = ledger.insert_proposal(encode_store_call(ActionValue(4)), ProposalState::Active);

    eventually("vote cast", || {
        let ledger = ledger.clone();
        async move { !ledger.votes().is_empty() }
    })
    .await;
    agent.shutdown().await;

    let votes = ledger.votes();
    assert_eq!(votes[0].proposal_id, id);
    assert_eq!(votes[0].stance, Stance::Against);
}

#[tokio::test]
async fn test_value_change_dispatches_mapped_action() {
    let telemetry = telemetry_server("0").await;
    let actions = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/scale-up"))
        .and(body_json(json!({"replicas": 3})))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&actions)
        .await;

    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), &actions.uri());
    let ctx = agent.context().clone();
    agent.start().await.unwrap();

    eventually("baseline read", || {
        let ctx = ctx.clone();
        async move { ctx.last_value.read().await.is_some() }
    })
    .await;

    ctx.book.add_cooldown("scale-up").await;
    ledger.set_value(2);

    eventually("cooldown cleared", || {
        let ctx = ctx.clone();
        async move { ctx.book.cooldown().await.is_empty() }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    agent.shutdown().await;
    actions.verify().await;
}

#[tokio::test]
async fn test_unknown_value_is_inert() {
    let telemetry = telemetry_server("0").await;
    let actions = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&actions)
        .await;

    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), &actions.uri());
    let ctx = agent.context().clone();
    agent.start().await.unwrap();

    ledger.set_value(9);
    eventually("value 9 observed", || {
        let ctx = ctx.clone();
        async move { *ctx.last_value.read().await == Some(ActionValue(9)) }
    })
    .await;

    // Still polling afterwards
    ledger.set_value(10);
    eventually("value 10 observed", || {
        let ctx = ctx.clone();
        async move { *ctx.last_value.read().await == Some(ActionValue(10)) }
    })
    .await;

    agent.shutdown().await;
}

#[tokio::test]
async fn test_restart_drains_and_respawns() {
    let telemetry = telemetry_server("0").await;
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), "http://127.0.0.1:1");
    agent.start().await.unwrap();

    let ctx = agent.context().clone();
    eventually("first generation", || {
        let ctx = ctx.clone();
        async move { ctx.supervisor.read().await.generation == 1 }
    })
    .await;
    let first_id = ctx.supervisor.read().await.generation_id;

    let restart = agent.restart_handle();
    restart.request();
    tokio::time::timeout(Duration::from_secs(5), restart.wait_for(false))
        .await
        .expect("restart did not complete");

    let status = agent.status().await.supervisor;
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.generation, 2);
    assert_eq!(status.restarts, 1);
    assert_eq!(status.workers.len(), 3);
    assert_ne!(status.generation_id, first_id);

    agent.shutdown().await;
    assert_eq!(agent.supervisor_state().await, SupervisorState::Stopped);
}

#[tokio::test]
async fn test_start_again_after_shutdown() {
    let telemetry = telemetry_server("0").await;
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), "http://127.0.0.1:1");

    agent.start().await.unwrap();
    agent.shutdown().await;
    assert_eq!(agent.supervisor_state().await, SupervisorState::Stopped);

    agent.start().await.unwrap();
    let ctx = agent.context().clone();
    eventually("second run", || {
        let ctx = ctx.clone();
        async move { ctx.supervisor.read().await.generation == 2 }
    })
    .await;

    // Workers of the new run keep polling instead of draining at once
    let id = ledger.insert_proposal(encode_store_call(ActionValue(4)), ProposalState::Active);
    eventually("vote cast after restart", || {
        let ledger = ledger.clone();
        async move { !ledger.votes().is_empty() }
    })
    .await;

    let status = agent.status().await.supervisor;
    assert_eq!(status.state, SupervisorState::Running);
    assert_eq!(status.workers.len(), 3);
    assert_eq!(ledger.votes()[0].proposal_id, id);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_control_api() {
    let telemetry = telemetry_server("0").await;
    let ledger = Arc::new(MockLedger::new(1));
    let agent = agent(&ledger, &telemetry.uri(), "http://127.0.0.1:1");
    agent.start().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = create_router(agent.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    let created: serde_json::Value = client
        .post(format!("{}/api/proposals", base))
        .json(&json!({"action_value": 2, "message": "scale-up"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["outcome"], "created");
    assert_eq!(created["device_name"], "edge-1");

    let redundant: serde_json::Value = client
        .post(format!("{}/api/proposals", base))
        .json(&json!({"action_value": "2", "message": "scale-up"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(redundant["outcome"], "redundant");

    let vote: serde_json::Value = client
        .post(format!("{}/api/votes", base))
        .json(&json!({"proposal_id": "1", "stance": "against", "reason": "manual check"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(vote["recorded"], true);
    assert_eq!(ledger.votes()[0].reason, "edge-1 manual check");

    let rejected = client
        .put(format!("{}/api/config", base))
        .json(&json!({"metric_index": "", "propose_on": {"events": []}}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::BAD_REQUEST);

    let accepted = client
        .put(format!("{}/api/config", base))
        .json(&json!({
            "metric_index": "4",
            "propose_on": {
                "events": ["cpu_high > 0"],
                "proposal_contents": [{"msg": "scale-up", "action_value": 2}]
            }
        }))
        .send()
        .await
        .unwrap();
    assert!(accepted.status().is_success());
    assert!(agent.context().book.cooldown().await.is_empty());

    let restart = client
        .post(format!("{}/api/restart", base))
        .send()
        .await
        .unwrap();
    assert!(restart.status().is_success());
    tokio::time::timeout(Duration::from_secs(5), agent.restart_handle().wait_for(false))
        .await
        .expect("restart did not complete");

    let status: serde_json::Value = client
        .get(format!("{}/api/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["device_name"], "edge-1");
    assert_eq!(status["supervisor"]["generation"], 2);
    assert_eq!(status["config"]["metric_index"], "4");

    agent.shutdown().await;
}
