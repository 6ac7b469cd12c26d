// engine/src/workflow/executor.rs
//!
//! Workflow runs.
//!
//! Steps are grouped into stages: a fan group is one stage, every step
//! without a fan group is a stage of its own, and stages run in the order of
//! their lowest `step_order`. The steps of a stage run on their own threads
//! under one deadline, the largest `timeout_ms` among them. The driving
//! thread is the only writer: it records each attempt in the ledger as the
//! attempt arrives, so `step_index` grows monotonically within a run.
//!
//! Outputs of a stage enter the context only once the whole stage is done,
//! so fan-group siblings never see each other.

use super::definition::{self, CriteriaList, WorkflowStatus, WorkflowStep};
use super::template::{self, Context};
use crate::cancel::CancelToken;
use crate::collaborators::{require_auth, Claims, Role};
use crate::grants;
use crate::ledger::{self, NewLedgerEntry};
use crate::lm_client::call_adapter;
use crate::model_adapters::{extract_json, CallError, CallErrorKind, LmRequest, LmResponse};
use crate::platform::Platform;
use crate::registry::{self, ModelTarget, Resolved};
use crate::store;
use crate::{now_timestamp, Error, Result};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const RETRY_BASE: Duration = Duration::from_millis(250);
pub const RETRY_CAP: Duration = Duration::from_secs(4);
/// How long the coordinator keeps collecting after a stage deadline, so
/// attempts cut short by the deadline still reach the ledger.
const COLLECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(Error::Internal(format!("unknown run status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(Error::Internal(format!("unknown step status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub workflow_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub pre_prompt: String,
    /// Falls back to the node's body when absent.
    #[serde(default)]
    pub body: Option<String>,
    /// Runs every step on this target instead of the step's own model.
    #[serde(default)]
    pub model_override: Option<ModelTarget>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl RunRequest {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    pub batch_id: Option<String>,
    pub node_id: Option<String>,
    pub user_id: String,
    pub role: Role,
    pub status: RunStatus,
    pub pre_prompt: String,
    pub body: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub step_name: String,
    pub step_order: i64,
    pub status: StepStatus,
    pub attempts: u32,
    /// Rendered prompt, system prompt and target of the step.
    pub input: Value,
    pub output_text: Option<String>,
    pub output_parsed: Option<Value>,
    pub ledger_entry_id: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: WorkflowRun,
    pub steps: Vec<StepRun>,
}

impl RunDetail {
    pub fn step(&self, name: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step_name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub workflow_ids: Vec<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub pre_prompt: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub batch_id: String,
    pub run_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    pub workflow_id: Option<String>,
    pub batch_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

struct PlannedStep {
    step: WorkflowStep,
    step_run_id: String,
    target: ModelTarget,
    criteria: Option<CriteriaList>,
}

struct PreparedRun {
    run_id: String,
    node_id: Option<String>,
    steps: Vec<PlannedStep>,
    context: Context,
}

enum Finish {
    Completed,
    Failed(String),
    Cancelled,
}

enum StepEvent {
    Attempt {
        slot: usize,
        provider: String,
        model: String,
        outcome: Result<LmResponse, CallError>,
        latency_ms: u64,
    },
    Finished {
        slot: usize,
    },
}

struct SlotState {
    index: usize,
    request: LmRequest,
    attempts: u32,
    last: Option<Result<LmResponse, CallError>>,
}

fn base_context(pre_prompt_template: &str, claims: &Claims, request: &RunRequest, body: &str) -> Context {
    let mut context = Context::new();
    context.insert("body".into(), body.to_string());
    context.insert("node_id".into(), request.node_id.clone().unwrap_or_default());
    context.insert("user_id".into(), claims.user_id.clone());
    context.insert("pre_prompt".into(), request.pre_prompt.clone());
    if !pre_prompt_template.trim().is_empty() {
        let rendered = template::render(pre_prompt_template, &context);
        context.insert("pre_prompt".into(), rendered);
    }
    context
}

/// Validates the request, checks grants for every step and writes the run
/// with its pending step rows.
fn prepare(platform: &Platform, claims: &Claims, request: &RunRequest) -> Result<PreparedRun> {
    let conn = platform.conn()?;
    let workflow = definition::get_workflow(&conn, &request.workflow_id)?;
    if workflow.status != WorkflowStatus::Active {
        return Err(Error::Conflict(format!(
            "workflow '{}' is {}, not active",
            workflow.name,
            workflow.status.as_str()
        )));
    }
    let steps = definition::list_steps(&conn, &workflow.workflow_id)?;
    if steps.is_empty() {
        return Err(Error::InvalidInput(format!("workflow '{}' has no steps", workflow.name)));
    }

    let mut planned = Vec::with_capacity(steps.len());
    for step in steps {
        let target = match &request.model_override {
            Some(target) => target.clone(),
            None => ModelTarget {
                model: step.model.clone(),
                provider: Some(step.provider.clone()).filter(|p| !p.is_empty()),
            },
        };
        grants::enforce(&conn, claims, &target.model, step.step_type)?;
        let criteria = step
            .criteria_list_id
            .as_deref()
            .map(|id| definition::get_criteria_list(&conn, id))
            .transpose()?;
        planned.push(PlannedStep {
            step_run_id: Uuid::new_v4().to_string(),
            target,
            criteria,
            step,
        });
    }

    let body = match (&request.body, &request.node_id) {
        (Some(body), _) => body.clone(),
        (None, Some(node_id)) => platform
            .nodes
            .get_node(node_id)?
            .map(|node| node.body)
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?,
        (None, None) => String::new(),
    };
    let context = base_context(&workflow.pre_prompt_template, claims, request, &body);

    let run_id = Uuid::new_v4().to_string();
    let tx = store::write_tx(&conn)?;
    tx.execute(
        "INSERT INTO workflow_runs (run_id, workflow_id, batch_id, node_id, user_id, role, status,
            pre_prompt, body, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', ?7, ?8, ?9)",
        params![
            run_id,
            workflow.workflow_id,
            request.batch_id,
            request.node_id,
            claims.user_id,
            claims.role.as_str(),
            context.get("pre_prompt").cloned().unwrap_or_default(),
            body,
            now_timestamp(),
        ],
    )?;
    for step in &planned {
        tx.execute(
            "INSERT INTO step_runs (id, run_id, step_id, step_name, step_order, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                step.step_run_id,
                run_id,
                step.step.step_id,
                step.step.step_name,
                step.step.step_order,
            ],
        )?;
    }
    tx.commit()?;
    info!(run_id = %run_id, workflow = %workflow.name, steps = planned.len(), "workflow run started");

    Ok(PreparedRun {
        run_id,
        node_id: request.node_id.clone(),
        steps: planned,
        context,
    })
}

/// Stage partition: indexes into `steps`, which are already in step order.
fn partition(steps: &[PlannedStep]) -> Vec<Vec<usize>> {
    let mut stages: Vec<Vec<usize>> = Vec::new();
    let mut groups: HashMap<&str, usize> = HashMap::new();
    for (index, planned) in steps.iter().enumerate() {
        match planned.step.fan_group.as_deref() {
            Some(group) => match groups.get(group) {
                Some(&stage) => stages[stage].push(index),
                None => {
                    groups.insert(group, stages.len());
                    stages.push(vec![index]);
                }
            },
            None => stages.push(vec![index]),
        }
    }
    stages
}

fn build_request(planned: &PlannedStep, context: &Context) -> LmRequest {
    let step = &planned.step;
    let mut context = context.clone();
    if let Some(criteria) = &planned.criteria {
        context.insert("criteria".into(), criteria.items.join("\n"));
        context.insert("criteria_json".into(), Value::from(criteria.items.clone()).to_string());
    }
    let prompt = template::render(&step.prompt_template, &context);
    let system = template::render(&step.system_prompt, &context);
    let mut request = LmRequest::from_prompts(Some(planned.target.model.clone()), Some(&system), &prompt);
    request.temperature = step
        .config
        .get("temperature")
        .and_then(Value::as_f64)
        .map(|t| t as f32);
    request.max_tokens = step
        .config
        .get("max_tokens")
        .and_then(Value::as_u64)
        .map(|t| t as u32);
    request.json = planned.criteria.is_some()
        || step.config.get("json").and_then(Value::as_bool).unwrap_or(false);
    request
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE.saturating_mul(1u32 << attempt.min(5)).min(RETRY_CAP)
}

/// Worker body: attempts one step until it succeeds, fails for good, runs
/// out of retries or the stage deadline passes.
fn attempt_loop(
    slot: usize,
    resolved: Resolved,
    request: LmRequest,
    retry_max: u32,
    stage: CancelToken,
    run: CancelToken,
    tx: Sender<StepEvent>,
) {
    let mut attempt = 0u32;
    loop {
        let started = Instant::now();
        let outcome = if stage.is_cancelled() {
            Err(CallError::new(&resolved.provider, CallErrorKind::Timeout, "stage deadline reached"))
        } else {
            call_adapter(resolved.adapter.as_ref(), &stage, &request)
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        let retry_in = match &outcome {
            Err(err) if err.is_retryable() && attempt < retry_max && !run.is_explicitly_cancelled() => {
                Some(backoff(attempt).max(err.retry_after.unwrap_or_default()).min(RETRY_CAP))
            }
            _ => None,
        };
        let event = StepEvent::Attempt {
            slot,
            provider: resolved.provider.clone(),
            model: resolved.model.clone(),
            outcome,
            latency_ms,
        };
        if tx.send(event).is_err() {
            return;
        }
        let Some(delay) = retry_in else { break };
        debug!(provider = %resolved.provider, model = %resolved.model, attempt, delay_ms = delay.as_millis() as u64, "retrying step");
        if !stage.sleep(delay) || run.is_explicitly_cancelled() {
            break;
        }
        attempt += 1;
    }
    let _ = tx.send(StepEvent::Finished { slot });
}

fn record_attempt(
    platform: &Platform,
    run: &PreparedRun,
    state: &mut SlotState,
    provider: &str,
    model: &str,
    outcome: Result<LmResponse, CallError>,
    latency_ms: u64,
    next_index: &mut i64,
) -> Result<()> {
    let planned = &run.steps[state.index];
    let mut entry = match &outcome {
        Ok(response) => NewLedgerEntry::from_response(&run.run_id, *next_index, &state.request, response),
        Err(err) => NewLedgerEntry::from_failure(
            &run.run_id,
            *next_index,
            &state.request,
            provider,
            model,
            latency_ms,
            err,
        ),
    };
    entry.node_id = run.node_id.clone();

    let conn = platform.conn()?;
    let tx = store::write_tx(&conn)?;
    let written = ledger::append(&tx, &entry)?;
    tx.execute(
        "UPDATE step_runs SET attempts = attempts + 1, ledger_entry_id = ?1 WHERE id = ?2",
        params![written.id, planned.step_run_id],
    )?;
    tx.commit()?;
    *next_index += 1;
    state.attempts += 1;

    if let Err(err) = &outcome {
        warn!(
            run_id = %run.run_id,
            step = %planned.step.step_name,
            attempt = state.attempts,
            provider = %provider,
            error = %err,
            "step attempt failed"
        );
    }
    state.last = Some(outcome);
    Ok(())
}

/// What a successful reply contributes: the parsed JSON, if any. Steps with
/// criteria must answer with a JSON object.
fn step_output(planned: &PlannedStep, response: &LmResponse) -> std::result::Result<Option<Value>, String> {
    let Some(criteria) = &planned.criteria else {
        return Ok(response.parsed.clone());
    };
    match response.parsed.clone().or_else(|| extract_json(&response.content)) {
        Some(Value::Object(scores)) => {
            let missing = criteria
                .items
                .iter()
                .filter(|item| !scores.contains_key(item.as_str()))
                .count();
            let extra = scores.keys().filter(|key| !criteria.items.contains(key)).count();
            if missing > 0 || extra > 0 {
                warn!(step = %planned.step.step_name, missing, extra, "criteria keys do not match the list");
            }
            Ok(Some(Value::Object(scores)))
        }
        _ => Err(format!(
            "step '{}' did not answer with a JSON object of criteria scores",
            planned.step.step_name
        )),
    }
}

/// Runs one stage and returns the failed steps with their reasons.
fn run_stage(
    platform: &Platform,
    run: &mut PreparedRun,
    stage: &[usize],
    run_token: &CancelToken,
    next_index: &mut i64,
) -> Result<Vec<(usize, String)>> {
    let timeout_ms = stage
        .iter()
        .map(|&index| run.steps[index].step.timeout_ms)
        .max()
        .unwrap_or(definition::DEFAULT_STEP_TIMEOUT_MS);
    let stage_timeout = run_token.clamp(Duration::from_millis(timeout_ms));
    // independent of the run token: an explicit cancel lets the stage finish
    let stage_token = CancelToken::with_timeout(stage_timeout);

    let mut states = Vec::with_capacity(stage.len());
    let mut launches = Vec::new();
    let mut unresolved = Vec::new();
    {
        let conn = platform.conn()?;
        for (slot, &index) in stage.iter().enumerate() {
            let planned = &run.steps[index];
            let request = build_request(planned, &run.context);
            let input = json!({
                "prompt": request.user_prompt(),
                "system": request.system_prompt(),
                "model": planned.target.model,
                "provider": planned.target.provider,
            });
            conn.execute(
                "UPDATE step_runs SET status = 'running', input_json = ?1, started_at = ?2 WHERE id = ?3",
                params![input.to_string(), now_timestamp(), planned.step_run_id],
            )?;
            match registry::resolve_target(&conn, &platform.client, &planned.target) {
                Ok(resolved) => launches.push((slot, resolved)),
                Err(err) => unresolved.push((slot, err)),
            }
            states.push(SlotState {
                index,
                request,
                attempts: 0,
                last: None,
            });
        }
    }

    for (slot, err) in unresolved {
        let target = run.steps[states[slot].index].target.clone();
        let provider = target.provider.unwrap_or_default();
        let failure = CallError::new(&provider, CallErrorKind::UnknownProvider, err.to_string());
        record_attempt(platform, run, &mut states[slot], &provider, &target.model, Err(failure), 0, next_index)?;
    }

    let (tx, rx) = bounded::<StepEvent>(stage.len());
    let mut pending = 0usize;
    for (slot, resolved) in launches {
        let mut request = states[slot].request.clone();
        request.model = Some(resolved.model.clone());
        let retry_max = run.steps[states[slot].index].step.retry_max;
        let (tx, stage_token, run_token) = (tx.clone(), stage_token.clone(), run_token.clone());
        pending += 1;
        std::thread::spawn(move || attempt_loop(slot, resolved, request, retry_max, stage_token, run_token, tx));
    }
    drop(tx);

    let collect_until = Instant::now() + stage_timeout + COLLECT_GRACE;
    while pending > 0 {
        match rx.recv_deadline(collect_until) {
            Ok(StepEvent::Attempt {
                slot,
                provider,
                model,
                outcome,
                latency_ms,
            }) => record_attempt(platform, run, &mut states[slot], &provider, &model, outcome, latency_ms, next_index)?,
            Ok(StepEvent::Finished { slot }) => {
                pending -= 1;
                debug!(run_id = %run.run_id, step = %run.steps[states[slot].index].step.step_name, "step finished");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(run_id = %run.run_id, pending, "stage deadline passed with steps outstanding");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    stage_token.cancel();

    let mut failures = Vec::new();
    let conn = platform.conn()?;
    for state in states {
        let planned = &run.steps[state.index];
        let result = match &state.last {
            Some(Ok(response)) => step_output(planned, response).map(|parsed| (response.content.clone(), parsed)),
            Some(Err(err)) => Err(err.to_string()),
            None => Err("timeout: no attempt finished before the stage deadline".to_string()),
        };
        match result {
            Ok((text, parsed)) => {
                conn.execute(
                    "UPDATE step_runs SET status = 'completed', output_text = ?1, output_parsed = ?2,
                        finished_at = ?3
                     WHERE id = ?4",
                    params![
                        text,
                        parsed.as_ref().map(Value::to_string),
                        now_timestamp(),
                        planned.step_run_id,
                    ],
                )?;
                run.context.insert(planned.step.step_name.clone(), text);
            }
            Err(reason) => {
                conn.execute(
                    "UPDATE step_runs SET status = 'failed', error = ?1, finished_at = ?2 WHERE id = ?3",
                    params![reason, now_timestamp(), planned.step_run_id],
                )?;
                failures.push((state.index, reason));
            }
        }
    }
    Ok(failures)
}

fn run_stages(platform: &Platform, run: &mut PreparedRun, token: &CancelToken) -> Result<Finish> {
    let stages = partition(&run.steps);
    let mut next_index = 0i64;
    for stage in &stages {
        if token.is_explicitly_cancelled() {
            return Ok(Finish::Cancelled);
        }
        if token.is_cancelled() {
            return Ok(Finish::Failed("timeout: run deadline exceeded".into()));
        }
        let failures = run_stage(platform, run, stage, token, &mut next_index)?;
        for (index, reason) in failures {
            let step = &run.steps[index].step;
            // a step outside any fan group is always required
            if step.fan_group.is_none() || step.is_required() {
                return Ok(Finish::Failed(format!("step '{}' failed: {reason}", step.step_name)));
            }
            warn!(run_id = %run.run_id, step = %step.step_name, "optional fan-group member failed, continuing");
        }
    }
    Ok(Finish::Completed)
}

/// Sets the final run status. Pending steps become skipped and anything
/// still marked running becomes failed.
fn close_run(conn: &Connection, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()> {
    let tx = store::write_tx(&conn)?;
    let now = now_timestamp();
    tx.execute(
        "UPDATE step_runs SET status = 'skipped' WHERE run_id = ?1 AND status = 'pending'",
        params![run_id],
    )?;
    tx.execute(
        "UPDATE step_runs SET status = 'failed', error = COALESCE(error, ?1), finished_at = ?2
         WHERE run_id = ?3 AND status = 'running'",
        params![error.unwrap_or("run ended"), now, run_id],
    )?;
    tx.execute(
        "UPDATE workflow_runs SET status = ?1, error = ?2, finished_at = ?3
         WHERE run_id = ?4 AND status = 'running'",
        params![status.as_str(), error, now, run_id],
    )?;
    tx.commit()?;
    Ok(())
}

fn drive(platform: &Platform, mut run: PreparedRun, token: &CancelToken) -> RunStatus {
    let (status, reason) = match run_stages(platform, &mut run, token) {
        Ok(Finish::Completed) => (RunStatus::Completed, None),
        Ok(Finish::Cancelled) => (RunStatus::Cancelled, Some("cancelled".to_string())),
        Ok(Finish::Failed(reason)) => (RunStatus::Failed, Some(reason)),
        Err(err) => {
            error!(run_id = %run.run_id, error = %err, "workflow run aborted");
            (RunStatus::Failed, Some(err.to_string()))
        }
    };
    match platform.conn() {
        Ok(conn) => {
            if let Err(err) = close_run(&conn, &run.run_id, status, reason.as_deref()) {
                error!(run_id = %run.run_id, error = %err, "could not record run outcome");
            }
        }
        Err(err) => error!(run_id = %run.run_id, error = %err, "could not record run outcome"),
    }
    info!(run_id = %run.run_id, status = status.as_str(), "workflow run finished");
    status
}

fn launch(platform: &Platform, prepared: PreparedRun) -> String {
    let run_id = prepared.run_id.clone();
    let token = CancelToken::new();
    platform.track_run(&run_id, token.clone());
    let platform = platform.clone();
    let tracked = run_id.clone();
    std::thread::spawn(move || {
        drive(&platform, prepared, &token);
        platform.untrack_run(&tracked);
    });
    run_id
}

/// Starts a run in the background and returns its id. Everything that can
/// be rejected up front (auth, status, grants) is checked before returning.
pub fn execute(platform: &Platform, claims: Option<&Claims>, request: &RunRequest) -> Result<String> {
    let claims = require_auth(claims)?;
    let prepared = prepare(platform, claims, request)?;
    Ok(launch(platform, prepared))
}

/// Runs on the calling thread and returns the finished run.
pub fn run_to_completion(
    platform: &Platform,
    claims: Option<&Claims>,
    cancel: &CancelToken,
    request: &RunRequest,
) -> Result<RunDetail> {
    let claims = require_auth(claims)?;
    cancel.check()?;
    let prepared = prepare(platform, claims, request)?;
    let run_id = prepared.run_id.clone();
    let token = cancel.child(None);
    platform.track_run(&run_id, token.clone());
    drive(platform, prepared, &token);
    platform.untrack_run(&run_id);
    get_run(&*platform.conn()?, &run_id)
}

/// One run per workflow with shared inputs, all running concurrently. If
/// any run cannot start, the runs prepared so far are failed and nothing is
/// launched.
pub fn batch_run(platform: &Platform, claims: Option<&Claims>, request: &BatchRequest) -> Result<BatchOutcome> {
    let claims = require_auth(claims)?;
    if request.workflow_ids.is_empty() {
        return Err(Error::InvalidInput("batch needs at least one workflow".into()));
    }
    let batch_id = Uuid::new_v4().to_string();
    let mut prepared = Vec::with_capacity(request.workflow_ids.len());
    for workflow_id in &request.workflow_ids {
        let run_request = RunRequest {
            workflow_id: workflow_id.clone(),
            node_id: request.node_id.clone(),
            pre_prompt: request.pre_prompt.clone(),
            body: request.body.clone(),
            model_override: None,
            batch_id: Some(batch_id.clone()),
        };
        match prepare(platform, claims, &run_request) {
            Ok(run) => prepared.push(run),
            Err(err) => {
                let conn = platform.conn()?;
                for run in &prepared {
                    close_run(&conn, &run.run_id, RunStatus::Failed, Some("batch aborted"))?;
                }
                return Err(err);
            }
        }
    }
    let run_ids: Vec<String> = prepared.into_iter().map(|run| launch(platform, run)).collect();
    info!(batch_id = %batch_id, runs = run_ids.len(), "batch scheduled");
    Ok(BatchOutcome { batch_id, run_ids })
}

/// Asks a running run to stop after its current stage. Runs nobody is
/// executing any more are closed directly.
pub fn cancel_run(platform: &Platform, claims: Option<&Claims>, run_id: &str) -> Result<()> {
    let claims = require_auth(claims)?;
    let conn = platform.conn()?;
    let run = load_run(&conn, run_id)?;
    if run.user_id != claims.user_id && !claims.is_operator() {
        return Err(Error::Forbidden("only the run's owner or an operator may cancel it".into()));
    }
    if run.status != RunStatus::Running {
        return Err(Error::Conflict(format!("run is already {}", run.status.as_str())));
    }
    match platform.run_token(run_id) {
        Some(token) => token.cancel(),
        None => close_run(&conn, run_id, RunStatus::Cancelled, Some("cancelled"))?,
    }
    info!(run_id = %run_id, by = %claims.user_id, "run cancellation requested");
    Ok(())
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<(WorkflowRun, String, String)> {
    Ok((
        WorkflowRun {
            run_id: row.get("run_id")?,
            workflow_id: row.get("workflow_id")?,
            batch_id: row.get("batch_id")?,
            node_id: row.get("node_id")?,
            user_id: row.get("user_id")?,
            role: Role::Anon,
            status: RunStatus::Running,
            pre_prompt: row.get("pre_prompt")?,
            body: row.get("body")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            error: row.get("error")?,
        },
        row.get("role")?,
        row.get("status")?,
    ))
}

fn finish_run((mut run, role, status): (WorkflowRun, String, String)) -> Result<WorkflowRun> {
    run.role = Role::parse(&role)?;
    run.status = RunStatus::parse(&status)?;
    Ok(run)
}

fn load_run(conn: &Connection, run_id: &str) -> Result<WorkflowRun> {
    let raw = conn
        .query_row(
            "SELECT * FROM workflow_runs WHERE run_id = ?1",
            params![run_id],
            map_run,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
    finish_run(raw)
}

type RawStepRun = (StepRun, String, String, Option<String>);

fn map_step_run(row: &Row<'_>) -> rusqlite::Result<RawStepRun> {
    Ok((
        StepRun {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            step_id: row.get("step_id")?,
            step_name: row.get("step_name")?,
            step_order: row.get("step_order")?,
            status: StepStatus::Pending,
            attempts: row.get::<_, i64>("attempts")? as u32,
            input: Value::Null,
            output_text: row.get("output_text")?,
            output_parsed: None,
            ledger_entry_id: row.get("ledger_entry_id")?,
            error: row.get("error")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
        },
        row.get("status")?,
        row.get("input_json")?,
        row.get("output_parsed")?,
    ))
}

fn finish_step_run((mut step, status, input, parsed): RawStepRun) -> Result<StepRun> {
    step.status = StepStatus::parse(&status)?;
    step.input = serde_json::from_str(&input)?;
    step.output_parsed = parsed.map(|p| serde_json::from_str(&p)).transpose()?;
    Ok(step)
}

pub fn get_run(conn: &Connection, run_id: &str) -> Result<RunDetail> {
    let run = load_run(conn, run_id)?;
    let mut stmt = conn.prepare(
        "SELECT * FROM step_runs WHERE run_id = ?1 ORDER BY step_order, step_name",
    )?;
    let steps = stmt
        .query_map(params![run_id], map_step_run)?
        .map(|raw| finish_step_run(raw?))
        .collect::<Result<Vec<_>>>()?;
    Ok(RunDetail { run, steps })
}

pub fn list_runs(conn: &Connection, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
    let limit = filter.limit.unwrap_or(ledger::DEFAULT_PAGE).clamp(1, ledger::MAX_PAGE);
    let mut stmt = conn.prepare(
        "SELECT * FROM workflow_runs
         WHERE (?1 IS NULL OR workflow_id = ?1)
           AND (?2 IS NULL OR batch_id = ?2)
           AND (?3 IS NULL OR status = ?3)
         ORDER BY started_at, run_id
         LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        params![
            filter.workflow_id,
            filter.batch_id,
            filter.status.map(|s| s.as_str()),
            limit as i64,
        ],
        map_run,
    )?;
    rows.map(|raw| finish_run(raw?)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grants::{create_grant, Effect, Grantee, GranteeType, NewGrant, StepType};
    use crate::test_support::{claims, platform, ScriptedAdapter};
    use crate::workflow::definition::{NewStep, NewWorkflow};
    use std::sync::Arc;

    fn active_workflow(platform: &Platform, name: &str, steps: &[NewStep]) -> anyhow::Result<String> {
        let conn = platform.conn()?;
        let op = claims("op", Role::Operator);
        let wf = definition::create_workflow(
            &conn,
            Some(&op),
            &NewWorkflow {
                name: name.into(),
                ..NewWorkflow::default()
            },
        )?;
        for step in steps {
            definition::add_step(&conn, Some(&op), &wf.workflow_id, step)?;
        }
        definition::activate(&conn, Some(&op), &wf.workflow_id)?;
        Ok(wf.workflow_id)
    }

    fn fan(order: i64, name: &str, template: &str, group: &str) -> NewStep {
        let mut step = NewStep::new(order, name, StepType::Fan, "m1", template);
        step.fan_group = Some(group.into());
        step
    }

    fn body_request(workflow_id: &str, body: &str) -> RunRequest {
        RunRequest {
            body: Some(body.into()),
            ..RunRequest::new(workflow_id)
        }
    }

    fn wait_for_finish(platform: &Platform, run_id: &str) -> anyhow::Result<RunDetail> {
        let until = Instant::now() + Duration::from_secs(10);
        loop {
            let detail = get_run(&*platform.conn()?, run_id)?;
            if detail.run.status != RunStatus::Running || Instant::now() > until {
                return Ok(detail);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn sequential_steps_feed_each_other() -> anyhow::Result<()> {
        let platform = platform(&[Arc::new(ScriptedAdapter::new("p", &["m1"]))])?;
        let wf = active_workflow(
            &platform,
            "chain",
            &[
                NewStep::new(0, "a", StepType::Author, "m1", "{{body}}"),
                NewStep::new(1, "b", StepType::Chain, "m1", "check: {{a}}"),
                NewStep::new(2, "c", StepType::Chain, "m1", "final {{b}} for {{user_id}}"),
            ],
        )?;
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &body_request(&wf, "sky is blue"))?;

        assert_eq!(detail.run.status, RunStatus::Completed);
        let names: Vec<_> = detail.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(detail.steps.iter().all(|s| s.status == StepStatus::Completed && s.attempts == 1));
        assert_eq!(detail.step("b").and_then(|s| s.output_text.as_deref()), Some("[m1] check: [m1] sky is blue"));
        assert_eq!(
            detail.step("c").and_then(|s| s.output_text.as_deref()),
            Some("[m1] final [m1] check: [m1] sky is blue for u1")
        );

        let entries = ledger::list_flow(&*platform.conn()?, &detail.run.run_id)?;
        let indexes: Vec<_> = entries.iter().map(|e| e.step_index).collect();
        assert_eq!(indexes, [0, 1, 2]);
        assert_eq!(detail.step("c").and_then(|s| s.ledger_entry_id), Some(entries[2].id));
        Ok(())
    }

    #[test]
    fn fan_group_outputs_reach_the_next_stage() -> anyhow::Result<()> {
        let adapter = Arc::new(ScriptedAdapter::new("p", &["m1"]).with_delay(Duration::from_millis(50)));
        let platform = platform(&[adapter.clone()])?;
        let wf = active_workflow(
            &platform,
            "fan",
            &[
                NewStep::new(0, "start", StepType::Author, "m1", "start {{body}}"),
                fan(1, "left", "left {{start}}", "F"),
                fan(1, "right", "right {{start}} {{left}}", "F"),
                NewStep::new(2, "merge", StepType::Chain, "m1", "merge {{left}} | {{right}}"),
            ],
        )?;
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &body_request(&wf, "B"))?;

        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(
            detail.step("right").and_then(|s| s.output_text.as_deref()),
            Some("[m1] right [m1] start B "),
            "siblings do not see each other"
        );
        assert_eq!(
            detail.step("merge").and_then(|s| s.output_text.as_deref()),
            Some("[m1] merge [m1] left [m1] start B | [m1] right [m1] start B ")
        );
        let entries = ledger::list_flow(&*platform.conn()?, &detail.run.run_id)?;
        let indexes: Vec<_> = entries.iter().map(|e| e.step_index).collect();
        assert_eq!(indexes, [0, 1, 2, 3]);
        assert_eq!(adapter.calls(), 4);
        Ok(())
    }

    #[test]
    fn lone_optional_fan_member_may_fail() -> anyhow::Result<()> {
        let good = Arc::new(ScriptedAdapter::new("good", &["m1"]));
        let bad = Arc::new(ScriptedAdapter::failing("bad", &["m2"], CallErrorKind::Client));
        let platform = platform(&[good, bad])?;
        let mut maybe = fan(1, "maybe", "try {{start}}", "G");
        maybe.model = "m2".into();
        let mut must = fan(3, "must", "must {{start}}", "H");
        must.model = "m2".into();
        must.config = Some(json!({ "required": true }));
        let lenient = active_workflow(
            &platform,
            "lenient",
            &[
                NewStep::new(0, "start", StepType::Author, "m1", "{{body}}"),
                maybe,
                NewStep::new(2, "after", StepType::Chain, "m1", "after [{{maybe}}]"),
            ],
        )?;
        let strict = active_workflow(
            &platform,
            "strict",
            &[NewStep::new(0, "start", StepType::Author, "m1", "{{body}}"), must],
        )?;
        let user = claims("u1", Role::User);

        let detail = run_to_completion(&platform, Some(&user), &CancelToken::new(), &body_request(&lenient, "B"))?;
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(detail.step("maybe").map(|s| s.status), Some(StepStatus::Failed));
        assert_eq!(detail.step("after").and_then(|s| s.output_text.as_deref()), Some("[m1] after []"));

        let detail = run_to_completion(&platform, Some(&user), &CancelToken::new(), &body_request(&strict, "B"))?;
        assert_eq!(detail.run.status, RunStatus::Failed);
        Ok(())
    }

    #[test]
    fn retryable_errors_are_retried_and_ledgered() -> anyhow::Result<()> {
        let adapter = Arc::new(
            ScriptedAdapter::new("p", &["m1"]).with_script(vec![Err(CallErrorKind::Server), Ok("recovered")]),
        );
        let platform = platform(&[adapter.clone()])?;
        let mut step = NewStep::new(0, "only", StepType::Author, "m1", "go");
        step.retry_max = Some(2);
        let wf = active_workflow(&platform, "retry", &[step])?;
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &RunRequest::new(&wf))?;

        let only = detail.step("only").ok_or_else(|| anyhow::anyhow!("missing step"))?;
        assert_eq!(only.status, StepStatus::Completed);
        assert_eq!(only.attempts, 2);
        assert_eq!(only.output_text.as_deref(), Some("recovered"));
        let entries = ledger::list_flow(&*platform.conn()?, &detail.run.run_id)?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].error.is_some());
        assert!(entries[1].error.is_none());
        Ok(())
    }

    #[test]
    fn failing_step_fails_the_run_and_skips_the_rest() -> anyhow::Result<()> {
        let good = Arc::new(ScriptedAdapter::new("good", &["m1"]));
        let bad = Arc::new(ScriptedAdapter::failing("bad", &["m2"], CallErrorKind::Client));
        let platform = platform(&[good, bad.clone()])?;
        let mut broken = NewStep::new(1, "broken", StepType::Chain, "m2", "{{a}}");
        broken.retry_max = Some(3);
        let wf = active_workflow(
            &platform,
            "fails",
            &[
                NewStep::new(0, "a", StepType::Author, "m1", "x"),
                broken,
                NewStep::new(2, "never", StepType::Chain, "m1", "{{broken}}"),
            ],
        )?;
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &RunRequest::new(&wf))?;

        assert_eq!(detail.run.status, RunStatus::Failed);
        assert!(detail.run.error.as_deref().unwrap_or("").contains("broken"));
        assert_eq!(detail.step("broken").map(|s| (s.status, s.attempts)), Some((StepStatus::Failed, 1)));
        assert_eq!(detail.step("never").map(|s| s.status), Some(StepStatus::Skipped));
        assert_eq!(bad.calls(), 1, "client errors are not retried");
        Ok(())
    }

    #[test]
    fn optional_fan_member_failure_is_tolerated() -> anyhow::Result<()> {
        let good = Arc::new(ScriptedAdapter::new("good", &["m1"]));
        let bad = Arc::new(ScriptedAdapter::failing("bad", &["m2"], CallErrorKind::Client));
        let platform = platform(&[good, bad])?;
        let mut flaky = fan(0, "flaky", "x", "F");
        flaky.model = "m2".into();
        let wf = active_workflow(
            &platform,
            "tolerant",
            &[flaky, fan(0, "steady", "y", "F"), NewStep::new(1, "after", StepType::Chain, "m1", "[{{flaky}}] {{steady}}")],
        )?;
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &RunRequest::new(&wf))?;
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(detail.step("flaky").map(|s| s.status), Some(StepStatus::Failed));
        assert_eq!(detail.step("after").and_then(|s| s.output_text.as_deref()), Some("[m1] [] [m1] y"));

        let mut required = fan(0, "required", "x", "G");
        required.model = "m2".into();
        required.config = Some(json!({"required": true}));
        let wf = active_workflow(
            &platform,
            "strict",
            &[required, fan(0, "steady", "y", "G"), NewStep::new(1, "after", StepType::Chain, "m1", "z")],
        )?;
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &RunRequest::new(&wf))?;
        assert_eq!(detail.run.status, RunStatus::Failed);
        assert_eq!(detail.step("after").map(|s| s.status), Some(StepStatus::Skipped));
        Ok(())
    }

    #[test]
    fn criteria_steps_need_a_json_object() -> anyhow::Result<()> {
        let adapter = Arc::new(
            ScriptedAdapter::new("p", &["m1"])
                .with_script(vec![Ok(r#"Scores: {"accuracy": 4, "sources": 3}"#), Ok("looks fine to me")]),
        );
        let platform = platform(&[adapter.clone()])?;
        let op = claims("op", Role::Operator);
        let list = definition::create_criteria_list(&*platform.conn()?, Some(&op), "rubric", "", &["accuracy".into(), "sources".into()])?;
        let mut judge = NewStep::new(0, "judge", StepType::Validate, "m1", "Score {{body}} on:\n{{criteria}}");
        judge.criteria_list_id = Some(list.list_id);
        let wf = active_workflow(&platform, "judged", &[judge])?;

        let detail = run_to_completion(&platform, Some(&op), &CancelToken::new(), &body_request(&wf, "claim"))?;
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(
            detail.step("judge").and_then(|s| s.output_parsed.clone()),
            Some(json!({"accuracy": 4, "sources": 3}))
        );
        let sent = adapter.requests();
        assert!(sent[0].json);
        assert_eq!(sent[0].user_prompt(), "Score claim on:\naccuracy\nsources");
        let entries = ledger::list_flow(&*platform.conn()?, &detail.run.run_id)?;
        assert_eq!(entries[0].response_parsed, Some(json!({"accuracy": 4, "sources": 3})));

        let detail = run_to_completion(&platform, Some(&op), &CancelToken::new(), &body_request(&wf, "claim"))?;
        assert_eq!(detail.run.status, RunStatus::Failed);
        assert_eq!(detail.step("judge").map(|s| s.status), Some(StepStatus::Failed));
        Ok(())
    }

    #[test]
    fn stage_deadline_fails_slow_steps() -> anyhow::Result<()> {
        let adapter = Arc::new(ScriptedAdapter::new("p", &["m1"]).with_delay(Duration::from_secs(5)));
        let platform = platform(&[adapter])?;
        let mut slow = NewStep::new(0, "slow", StepType::Author, "m1", "x");
        slow.timeout_ms = Some(100);
        let wf = active_workflow(&platform, "slow", &[slow])?;
        let started = Instant::now();
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &RunRequest::new(&wf))?;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(detail.run.status, RunStatus::Failed);
        let slow = detail.step("slow").ok_or_else(|| anyhow::anyhow!("missing step"))?;
        assert_eq!(slow.status, StepStatus::Failed);
        assert!(slow.error.is_some());
        assert_eq!(slow.attempts, 1);
        Ok(())
    }

    #[test]
    fn runs_require_active_workflows_and_grants() -> anyhow::Result<()> {
        let platform = platform(&[Arc::new(ScriptedAdapter::new("p", &["m1"]))])?;
        let user = claims("u1", Role::User);
        let draft = {
            let conn = platform.conn()?;
            let wf = definition::create_workflow(&conn, Some(&user), &NewWorkflow { name: "draft".into(), ..NewWorkflow::default() })?;
            definition::add_step(&conn, Some(&user), &wf.workflow_id, &NewStep::new(0, "a", StepType::Author, "m1", "x"))?;
            wf.workflow_id
        };
        let err = execute(&platform, Some(&user), &RunRequest::new(&draft)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        assert_eq!(execute(&platform, None, &RunRequest::new(&draft)).unwrap_err().kind(), crate::ErrorKind::Unauthorized);

        let wf = active_workflow(&platform, "guarded", &[NewStep::new(0, "a", StepType::Author, "m1", "x")])?;
        create_grant(
            &*platform.conn()?,
            Some(&claims("op", Role::Operator)),
            &NewGrant {
                grantee: Grantee {
                    grantee_type: GranteeType::Operator,
                    grantee_id: "u1".into(),
                },
                model_id: "m1".into(),
                step_type: StepType::Author,
                effect: Effect::Deny,
            },
        )?;
        let err = execute(&platform, Some(&user), &RunRequest::new(&wf)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Forbidden);
        assert!(list_runs(&*platform.conn()?, &RunFilter::default())?.is_empty());
        Ok(())
    }

    #[test]
    fn model_override_replaces_every_step_model() -> anyhow::Result<()> {
        let platform = platform(&[
            Arc::new(ScriptedAdapter::new("p", &["m1"])),
            Arc::new(ScriptedAdapter::new("q", &["m9"])),
        ])?;
        let wf = active_workflow(&platform, "override", &[NewStep::new(0, "a", StepType::Author, "m1", "x")])?;
        let request = RunRequest {
            model_override: Some(ModelTarget::on("q", "m9")),
            ..RunRequest::new(&wf)
        };
        let detail = run_to_completion(&platform, Some(&claims("u1", Role::User)), &CancelToken::new(), &request)?;
        assert_eq!(detail.step("a").and_then(|s| s.output_text.as_deref()), Some("[m9] x"));
        let entries = ledger::list_flow(&*platform.conn()?, &detail.run.run_id)?;
        assert_eq!((entries[0].provider.as_str(), entries[0].model_id.as_str()), ("q", "m9"));
        Ok(())
    }

    #[test]
    fn cancelled_run_stops_between_stages() -> anyhow::Result<()> {
        let adapter = Arc::new(ScriptedAdapter::new("p", &["m1"]).with_delay(Duration::from_millis(300)));
        let platform = platform(&[adapter])?;
        let wf = active_workflow(
            &platform,
            "cancel",
            &[
                NewStep::new(0, "a", StepType::Author, "m1", "x"),
                NewStep::new(1, "b", StepType::Chain, "m1", "{{a}}"),
            ],
        )?;
        let user = claims("u1", Role::User);
        let run_id = execute(&platform, Some(&user), &RunRequest::new(&wf))?;
        assert_eq!(
            cancel_run(&platform, Some(&claims("u2", Role::User)), &run_id).unwrap_err().kind(),
            crate::ErrorKind::Forbidden
        );
        cancel_run(&platform, Some(&user), &run_id)?;

        let detail = wait_for_finish(&platform, &run_id)?;
        assert_eq!(detail.run.status, RunStatus::Cancelled);
        assert_eq!(detail.step("b").map(|s| s.status), Some(StepStatus::Skipped));
        assert!(ledger::list_flow(&*platform.conn()?, &run_id)?.len() <= 1);
        assert_eq!(cancel_run(&platform, Some(&user), &run_id).unwrap_err().kind(), crate::ErrorKind::Conflict);
        Ok(())
    }

    #[test]
    fn batch_runs_share_inputs() -> anyhow::Result<()> {
        let platform = platform(&[Arc::new(ScriptedAdapter::new("p", &["m1"]))])?;
        let first = active_workflow(&platform, "one", &[NewStep::new(0, "a", StepType::Author, "m1", "one {{body}}")])?;
        let second = active_workflow(&platform, "two", &[NewStep::new(0, "a", StepType::Author, "m1", "two {{body}}")])?;
        let user = claims("u1", Role::User);
        let outcome = batch_run(
            &platform,
            Some(&user),
            &BatchRequest {
                workflow_ids: vec![first, second],
                body: Some("shared".into()),
                ..BatchRequest::default()
            },
        )?;
        assert_eq!(outcome.run_ids.len(), 2);
        for run_id in &outcome.run_ids {
            let detail = wait_for_finish(&platform, run_id)?;
            assert_eq!(detail.run.status, RunStatus::Completed);
            assert_eq!(detail.run.batch_id.as_deref(), Some(outcome.batch_id.as_str()));
        }
        let filter = RunFilter {
            batch_id: Some(outcome.batch_id.clone()),
            ..RunFilter::default()
        };
        assert_eq!(list_runs(&*platform.conn()?, &filter)?.len(), 2);

        let err = batch_run(
            &platform,
            Some(&user),
            &BatchRequest {
                workflow_ids: vec!["missing".into()],
                ..BatchRequest::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn partition_orders_stages_by_lowest_step() {
        let step = |order: i64, name: &str, group: Option<&str>| PlannedStep {
            step: WorkflowStep {
                step_id: name.into(),
                workflow_id: "w".into(),
                step_order: order,
                step_name: name.into(),
                step_type: StepType::Fan,
                provider: String::new(),
                model: "m".into(),
                prompt_template: String::new(),
                system_prompt: String::new(),
                config: json!({}),
                criteria_list_id: None,
                timeout_ms: 1000,
                retry_max: 0,
                fan_group: group.map(str::to_string),
            },
            step_run_id: name.into(),
            target: ModelTarget::model("m"),
            criteria: None,
        };
        let steps = vec![
            step(0, "a", None),
            step(1, "b", Some("F")),
            step(2, "c", None),
            step(3, "d", Some("F")),
        ];
        assert_eq!(partition(&steps), vec![vec![0], vec![1, 3], vec![2]]);
        assert_eq!(backoff(0), Duration::from_millis(250));
        assert_eq!(backoff(3), Duration::from_secs(2));
        assert_eq!(backoff(9), RETRY_CAP);
    }
}
