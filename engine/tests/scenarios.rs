mod common;

use common::{claims, harness, node, user, EchoProvider};
use horostracker::cancel::CancelToken;
use horostracker::collaborators::Role;
use horostracker::dedup::{self, CheckMethod, CheckRequest, MatchMethod};
use horostracker::dispatcher::{self, DispatchRequest};
use horostracker::envelope::{self, EnvelopeStatus, NewEnvelope, NewTarget, SourceType, TargetType};
use horostracker::grants::{self, Effect, Grantee, GranteeType, NewGrant, StepType};
use horostracker::ledger;
use horostracker::rate_limit::{RateLimiter, Route};
use horostracker::registry::{self, ModelTarget, NewProvider};
use horostracker::replay::{self, ReplayRequest, REPLAY_INDEX_OFFSET};
use horostracker::workflow::definition::{self, NewStep, NewWorkflow};
use horostracker::workflow::executor::{run_to_completion, RunRequest, RunStatus, StepStatus};
use horostracker::ErrorKind;
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[test]
fn dispatch_fans_out_and_ledgers_every_model() -> anyhow::Result<()> {
    let a = EchoProvider::new("A", &["m1"]);
    let b = EchoProvider::new("B", &["m2"]);
    let h = harness(&[a.clone(), b.clone()], vec![user("u1", Role::User)], Vec::new())?;

    let outcome = dispatcher::dispatch(
        &h.platform,
        Some(&claims("u1", Role::User)),
        &CancelToken::new(),
        &DispatchRequest {
            prompt: "hi".into(),
            system: None,
            models: vec![ModelTarget::model("m1"), ModelTarget::model("m2")],
            timeout_ms: 30_000,
            persist: true,
        },
    )?;
    assert_eq!(outcome.results[0].model, "m1");
    assert_eq!(outcome.results[1].model, "m2");
    assert_eq!(outcome.results[0].content, "m1: hi");

    let entries = ledger::list_flow(&*h.platform.conn()?, &outcome.dispatch_id)?;
    assert_eq!(entries.len(), 2);
    let models: HashSet<_> = entries.iter().map(|e| e.model_id.as_str()).collect();
    assert_eq!(models, HashSet::from(["m1", "m2"]));
    assert!(entries.iter().all(|e| e.dispatch_id.as_deref() == Some(outcome.dispatch_id.as_str())));
    assert_eq!((a.calls(), b.calls()), (1, 1));
    Ok(())
}

#[test]
fn explicit_deny_blocks_step_creation() -> anyhow::Result<()> {
    let h = harness(&[EchoProvider::new("A", &["m1"])], Vec::new(), Vec::new())?;
    let conn = h.platform.conn()?;
    let admin = claims("admin", Role::Operator);
    let u = claims("u", Role::Operator);
    grants::create_grant(
        &conn,
        Some(&admin),
        &NewGrant {
            grantee: Grantee {
                grantee_type: GranteeType::Operator,
                grantee_id: "u".into(),
            },
            model_id: "m1".into(),
            step_type: StepType::Llm,
            effect: Effect::Deny,
        },
    )?;

    let wf = definition::create_workflow(&conn, Some(&u), &NewWorkflow { name: "denied".into(), ..NewWorkflow::default() })?;
    let err = definition::add_step(&conn, Some(&u), &wf.workflow_id, &NewStep::new(0, "ask", StepType::Llm, "m1", "{{body}}"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(definition::list_steps(&conn, &wf.workflow_id)?.is_empty());

    for _ in 0..2 {
        let decision = grants::check(&conn, "u", Role::Operator, "m1", StepType::Llm)?;
        assert!(!decision.allowed && decision.explicit);
    }
    Ok(())
}

#[test]
fn fan_group_siblings_feed_the_final_step() -> anyhow::Result<()> {
    let h = harness(&[EchoProvider::new("A", &["m1"])], Vec::new(), vec![node("n1", "the claim")])?;
    let op = claims("op", Role::Operator);
    let workflow_id = {
        let conn = h.platform.conn()?;
        let wf = definition::create_workflow(&conn, Some(&op), &NewWorkflow { name: "fan".into(), ..NewWorkflow::default() })?;
        let mut left = NewStep::new(1, "name1", StepType::Fan, "m1", "left {{intro}}");
        left.fan_group = Some("F".into());
        let mut right = NewStep::new(1, "name2", StepType::Fan, "m1", "right {{intro}}");
        right.fan_group = Some("F".into());
        for step in [
            NewStep::new(0, "intro", StepType::Author, "m1", "intro {{body}}"),
            left,
            right,
            NewStep::new(2, "final", StepType::Chain, "m1", "final {{name1}} + {{name2}}"),
        ] {
            definition::add_step(&conn, Some(&op), &wf.workflow_id, &step)?;
        }
        definition::activate(&conn, Some(&op), &wf.workflow_id)?;
        wf.workflow_id
    };

    let request = RunRequest {
        node_id: Some("n1".into()),
        ..RunRequest::new(workflow_id)
    };
    let detail = run_to_completion(&h.platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &request)?;
    assert_eq!(detail.run.status, RunStatus::Completed);
    assert!(detail.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert_eq!(
        detail.step("final").and_then(|s| s.output_text.as_deref()),
        Some("m1: final m1: left m1: intro the claim + m1: right m1: intro the claim")
    );
    Ok(())
}

#[test]
fn three_step_workflow_round_trip() -> anyhow::Result<()> {
    let h = harness(&[EchoProvider::new("A", &["m1"])], Vec::new(), Vec::new())?;
    let author = claims("u1", Role::User);
    let op = claims("op", Role::Operator);
    let workflow_id = {
        let conn = h.platform.conn()?;
        let wf = definition::create_workflow(&conn, Some(&author), &NewWorkflow { name: "three".into(), ..NewWorkflow::default() })?;
        definition::add_step(&conn, Some(&author), &wf.workflow_id, &NewStep::new(0, "one", StepType::Author, "m1", "{{body}}"))?;
        definition::add_step(&conn, Some(&author), &wf.workflow_id, &NewStep::new(1, "two", StepType::Chain, "m1", "{{one}}"))?;
        definition::add_step(&conn, Some(&author), &wf.workflow_id, &NewStep::new(2, "three", StepType::Chain, "m1", "{{two}}"))?;
        definition::submit(&conn, Some(&author), &wf.workflow_id)?;
        definition::activate(&conn, Some(&op), &wf.workflow_id)?;
        wf.workflow_id
    };

    let request = RunRequest {
        body: Some("x".into()),
        ..RunRequest::new(workflow_id)
    };
    let detail = run_to_completion(&h.platform, Some(&author), &CancelToken::new(), &request)?;
    let orders: Vec<i64> = detail.steps.iter().map(|s| s.step_order).collect();
    assert_eq!(orders, [0, 1, 2]);
    let entries = ledger::list_flow(&*h.platform.conn()?, &detail.run.run_id)?;
    assert!(entries.windows(2).all(|w| w[0].step_index < w[1].step_index));
    Ok(())
}

#[test]
fn replay_adds_a_linked_entry_and_leaves_the_original() -> anyhow::Result<()> {
    let h = harness(
        &[EchoProvider::new("A", &["m1"]), EchoProvider::new("providerX", &["m3"])],
        vec![user("u1", Role::User)],
        Vec::new(),
    )?;
    let caller = claims("u1", Role::User);
    let outcome = dispatcher::dispatch(
        &h.platform,
        Some(&caller),
        &CancelToken::new(),
        &DispatchRequest {
            prompt: "what changed".into(),
            system: None,
            models: vec![ModelTarget::model("m1")],
            timeout_ms: 10_000,
            persist: true,
        },
    )?;
    let original_id = outcome.results[0]
        .ledger_entry_id
        .ok_or_else(|| anyhow::anyhow!("dispatch did not ledger"))?;
    let before = ledger::get(&*h.platform.conn()?, original_id)?;

    let replayed = replay::replay_step(
        &h.platform,
        Some(&caller),
        &CancelToken::new(),
        &ReplayRequest {
            entry_id: original_id,
            provider: Some("providerX".into()),
            model: "m3".into(),
        },
    )?;
    assert_eq!(ledger::get(&*h.platform.conn()?, original_id)?, before);
    assert_eq!(replayed.replay.flow_id, before.flow_id);
    assert_eq!(replayed.replay.model_id, "m3");
    assert_eq!(replayed.replay.step_index, before.step_index + REPLAY_INDEX_OFFSET);
    assert_eq!(replayed.replay.replay_of, Some(original_id));
    assert_eq!(replayed.diff.original_content, "m1: what changed");
    assert_eq!(replayed.diff.replay_content, "m3: what changed");
    assert!(replayed.diff.replay_error.is_none());
    Ok(())
}

#[test]
fn anonymous_envelope_claim() -> anyhow::Result<()> {
    let h = harness(&[], vec![user("U", Role::User), user("V", Role::User)], Vec::new())?;
    let new = NewEnvelope {
        batch_id: None,
        source_type: SourceType::Witheout,
        source_node_id: None,
        source_callback: None,
        piece: "anonymous piece".into(),
        ttl_minutes: Some(30),
        targets: vec![NewTarget {
            target_type: TargetType::Horostracker,
            config: serde_json::Value::Null,
        }],
    };
    let created = envelope::create_envelope(&mut *h.platform.conn()?, None, &new)?;
    assert_eq!(created.status, EnvelopeStatus::Pending);

    let status = envelope::get_status(&*h.platform.conn()?, &created.id)?;
    assert_eq!(status.status, EnvelopeStatus::Pending);
    assert_eq!(status.target_count, 1);

    let users = h.platform.users.clone();
    let bound = envelope::claim(&mut *h.platform.conn()?, users.as_ref(), Some(&claims("U", Role::User)), &created.id)?;
    assert_eq!(bound.source_user_id.as_deref(), Some("U"));
    let second = envelope::claim(&mut *h.platform.conn()?, users.as_ref(), Some(&claims("V", Role::User)), &created.id)
        .unwrap_err();
    assert_eq!(second.kind(), ErrorKind::Conflict);
    Ok(())
}

#[test]
fn fuzzy_dedup_depends_on_threshold() -> anyhow::Result<()> {
    let original = "The committee reviewed the proposal on Tuesday and agreed that the new bridge should open to traffic before the end of next spring.";
    let edited = "The committee reviewed the proposal on Tuesday and quickly agreed that the new bridge should open to traffic before the end of next spring.";
    let h = harness(&[], Vec::new(), vec![node("n1", original)])?;
    let conn = h.platform.conn()?;

    let mut request = CheckRequest::new(edited);
    request.method = CheckMethod::All;
    request.threshold = Some(0.8);
    let loose = dedup::check(&conn, h.platform.nodes.as_ref(), &request)?;
    assert_eq!(loose.matches.len(), 1);
    assert_eq!(loose.matches[0].method, MatchMethod::Fuzzy);

    request.threshold = Some(0.95);
    let strict = dedup::check(&conn, h.platform.nodes.as_ref(), &request)?;
    assert!(strict.matches.is_empty());
    Ok(())
}

#[test]
fn search_route_admits_thirty_per_minute() -> anyhow::Result<()> {
    let h = harness(&[], Vec::new(), Vec::new())?;
    for _ in 0..30 {
        h.platform
            .rate_limits
            .admit(Route::Search, Some("203.0.113.7, 10.0.0.1"), "10.0.0.1:443")?;
    }
    let denied = h
        .platform
        .rate_limits
        .admit(Route::Search, None, "203.0.113.7:51000")
        .unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::RateLimited);

    let limiter = RateLimiter::new("search", 30, Duration::from_secs(60));
    let start = Instant::now();
    assert!((0..30).all(|_| limiter.allow_at("ip", start)));
    assert!(!limiter.allow_at("ip", start + Duration::from_secs(59)));
    assert!(limiter.allow_at("ip", start + Duration::from_secs(61)));
    Ok(())
}

#[test]
fn provider_registration_and_heartbeat() -> anyhow::Result<()> {
    let h = harness(&[EchoProvider::new("A", &["m1"])], Vec::new(), Vec::new())?;
    let conn = h.platform.conn()?;
    let provider = registry::register(
        &conn,
        Some(&claims("p1", Role::Provider)),
        &NewProvider {
            name: "selfhosted".into(),
            endpoint: "http://127.0.0.1:9000".into(),
            models: vec!["local-7b".into()],
            ..NewProvider::default()
        },
    )?;
    let names: Vec<String> = registry::list(&conn, &h.platform.client)?
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, ["A", "selfhosted"]);

    let first = registry::heartbeat(&conn, &provider.id)?;
    let second = registry::heartbeat(&conn, &provider.id)?;
    assert!(second > first);
    Ok(())
}

#[test]
fn ledger_snapshot_requires_federation() -> anyhow::Result<()> {
    let h = harness(&[], Vec::new(), Vec::new())?;
    let dest = h.dir.path().join("ledger-export.sqlite");
    let err = ledger::export_snapshot(&*h.platform.conn()?, false, &dest).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let bytes = ledger::export_snapshot(&*h.platform.conn()?, true, &dest)?;
    assert!(bytes > 0);
    assert!(dest.exists());
    Ok(())
}
