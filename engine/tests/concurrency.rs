mod common;

use common::{claims, harness, user, EchoProvider};
use horostracker::cancel::CancelToken;
use horostracker::collaborators::Role;
use horostracker::dispatcher::{self, DispatchRequest};
use horostracker::grants::StepType;
use horostracker::ledger;
use horostracker::registry::ModelTarget;
use horostracker::workflow::definition::{self, NewStep, NewWorkflow};
use horostracker::workflow::executor::{batch_run, get_run, BatchRequest, RunDetail, RunStatus};
use std::collections::HashSet;
use std::time::{Duration, Instant};

fn wait_for_finish(platform: &horostracker::platform::Platform, run_id: &str) -> anyhow::Result<RunDetail> {
    let until = Instant::now() + Duration::from_secs(20);
    loop {
        let detail = get_run(&*platform.conn()?, run_id)?;
        if detail.run.status != RunStatus::Running {
            return Ok(detail);
        }
        anyhow::ensure!(Instant::now() < until, "run {run_id} never finished");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn batch_runs_share_one_file_database() -> anyhow::Result<()> {
    let h = harness(&[EchoProvider::new("A", &["m1", "m2"])], Vec::new(), Vec::new())?;
    let op = claims("op", Role::Operator);
    let mut workflow_ids = Vec::new();
    {
        let conn = h.platform.conn()?;
        for n in 0..4 {
            let wf = definition::create_workflow(&conn, Some(&op), &NewWorkflow { name: format!("wf{n}"), ..NewWorkflow::default() })?;
            definition::add_step(&conn, Some(&op), &wf.workflow_id, &NewStep::new(0, "draft", StepType::Author, "m1", "{{body}}"))?;
            definition::add_step(&conn, Some(&op), &wf.workflow_id, &NewStep::new(1, "check", StepType::Chain, "m2", "check {{draft}}"))?;
            definition::add_step(&conn, Some(&op), &wf.workflow_id, &NewStep::new(2, "sum", StepType::Chain, "m1", "sum {{check}}"))?;
            definition::activate(&conn, Some(&op), &wf.workflow_id)?;
            workflow_ids.push(wf.workflow_id);
        }
    }

    let outcome = batch_run(
        &h.platform,
        Some(&claims("u1", Role::User)),
        &BatchRequest {
            workflow_ids,
            node_id: None,
            pre_prompt: String::new(),
            body: Some("claim".into()),
        },
    )?;
    assert_eq!(outcome.run_ids.len(), 4);

    for run_id in &outcome.run_ids {
        let detail = wait_for_finish(&h.platform, run_id)?;
        assert_eq!(detail.run.status, RunStatus::Completed, "run {run_id}: {:?}", detail.run.error);
        assert_eq!(detail.run.batch_id.as_deref(), Some(outcome.batch_id.as_str()));
        let entries = ledger::list_flow(&*h.platform.conn()?, run_id)?;
        assert_eq!(entries.iter().map(|e| e.step_index).collect::<Vec<_>>(), [0, 1, 2]);
        assert!(entries.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }
    let total: i64 = h.platform.conn()?.query_row("SELECT COUNT(*) FROM flow_steps", [], |row| row.get(0))?;
    assert_eq!(total, 12);
    Ok(())
}

#[test]
fn concurrent_dispatches_all_persist() -> anyhow::Result<()> {
    let a = EchoProvider::new("A", &["m1"]);
    let b = EchoProvider::new("B", &["m2"]);
    let users = (0..6).map(|n| user(&format!("u{n}"), Role::User)).collect();
    let h = harness(&[a.clone(), b.clone()], users, Vec::new())?;

    let workers: Vec<_> = (0..6)
        .map(|n| {
            let platform = h.platform.clone();
            std::thread::spawn(move || {
                dispatcher::dispatch(
                    &platform,
                    Some(&claims(&format!("u{n}"), Role::User)),
                    &CancelToken::new(),
                    &DispatchRequest {
                        prompt: format!("question {n}"),
                        system: None,
                        models: vec![ModelTarget::model("m1"), ModelTarget::model("m2")],
                        timeout_ms: 30_000,
                        persist: true,
                    },
                )
            })
        })
        .collect();
    let mut dispatch_ids = HashSet::new();
    for worker in workers {
        let outcome = worker.join().map_err(|_| anyhow::anyhow!("dispatch thread panicked"))??;
        assert!(outcome.results.iter().all(|r| r.error.is_none() && r.ledger_entry_id.is_some()));
        dispatch_ids.insert(outcome.dispatch_id);
    }
    assert_eq!(dispatch_ids.len(), 6);
    assert_eq!((a.calls(), b.calls()), (6, 6));

    let conn = h.platform.conn()?;
    for id in &dispatch_ids {
        let record = dispatcher::get_dispatch(&conn, id)?;
        assert_eq!(record.status, "completed");
        assert_eq!(record.entries.len(), 2);
    }
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM flow_steps", [], |row| row.get(0))?;
    assert_eq!(total, 12);
    Ok(())
}
