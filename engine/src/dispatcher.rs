// engine/src/dispatcher.rs
//!
//! Parallel fan-out of one prompt to N models under a shared deadline.
//!
//! One thread per target posts its outcome on a bounded channel sized to the
//! fan-out width; the caller collects until every target answered or the
//! deadline passed. Results keep the order of the request's `models`, and a
//! failing target never cancels its siblings. Persisted dispatches write the
//! dispatch row and one ledger entry per model in a single transaction.
//!
//! `complete` is the single-answer path: it walks the client's fallback
//! chain and ledgers every provider attempt under one flow.

use crate::cancel::CancelToken;
use crate::collaborators::{require_auth, Claims};
use crate::grants::{self, StepType};
use crate::ledger::{self, LedgerEntry, NewLedgerEntry};
use crate::lm_client::ChainOutcome;
use crate::model_adapters::{CallError, LmRequest, LmResponse};
use crate::platform::Platform;
use crate::registry::{self, ModelTarget, Resolved};
use crate::{now_timestamp, sha256_hex, store, Error, Result};
use crossbeam::channel::{bounded, RecvTimeoutError};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

const COLLECT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    pub models: Vec<ModelTarget>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResult {
    pub model: String,
    pub provider: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_entry_id: Option<i64>,
}

impl ModelResult {
    fn success(response: LmResponse, latency_ms: u64) -> Self {
        Self {
            model: response.model,
            provider: response.provider,
            content: response.content,
            parsed: response.parsed,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            latency_ms,
            error: None,
            ledger_entry_id: None,
        }
    }

    fn failure(model: &str, provider: &str, latency_ms: u64, error: String) -> Self {
        Self {
            model: model.to_string(),
            provider: provider.to_string(),
            content: String::new(),
            parsed: None,
            tokens_in: 0,
            tokens_out: 0,
            latency_ms,
            error: Some(error),
            ledger_entry_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub dispatch_id: String,
    pub results: Vec<ModelResult>,
}

type Delivery = (usize, Result<LmResponse, CallError>, u64);

/// Fans `request` out to every target and waits for all of them or the
/// deadline, whichever comes first.
pub fn dispatch(
    platform: &Platform,
    claims: Option<&Claims>,
    cancel: &CancelToken,
    request: &DispatchRequest,
) -> Result<DispatchOutcome> {
    let claims = require_auth(claims)?;
    if request.prompt.trim().is_empty() {
        return Err(Error::InvalidInput("prompt is required".into()));
    }
    if request.models.is_empty() {
        return Err(Error::InvalidInput("at least one model is required".into()));
    }
    let mut seen = HashSet::new();
    if let Some(repeat) = request.models.iter().find(|t| !seen.insert(t.model.as_str())) {
        return Err(Error::InvalidInput(format!("model '{}' is listed more than once", repeat.model)));
    }
    if request.timeout_ms == 0 {
        return Err(Error::InvalidInput("timeout must be positive".into()));
    }
    cancel.check()?;

    let resolved: Vec<Result<Resolved>> = {
        let conn = platform.conn()?;
        for target in &request.models {
            grants::enforce(&conn, claims, &target.model, StepType::Llm)?;
        }
        request
            .models
            .iter()
            .map(|target| registry::resolve_target(&conn, &platform.client, target))
            .collect()
    };

    let dispatch_id = Uuid::new_v4().to_string();
    let cost = platform.config.dispatch_credit_cost * request.models.len() as i64;
    if cost > 0 {
        platform
            .users
            .debit_credits(&claims.user_id, cost, "dispatch", "dispatch", &dispatch_id)?;
    }

    info!(dispatch_id = %dispatch_id, models = request.models.len(), "dispatch started");
    let lm_request = LmRequest::from_prompts(None, request.system.as_deref(), &request.prompt);
    let call_cancel = cancel.child(Some(Duration::from_millis(request.timeout_ms)));
    let mut results = fan_out(&call_cancel, &lm_request, &request.models, resolved);
    call_cancel.cancel();

    if request.persist {
        let mut conn = platform.conn()?;
        persist(&mut conn, &dispatch_id, claims, request, &lm_request, &mut results)?;
    }
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    info!(dispatch_id = %dispatch_id, succeeded = results.len() - failed, failed, "dispatch finished");
    Ok(DispatchOutcome { dispatch_id, results })
}

fn fan_out(
    cancel: &CancelToken,
    request: &LmRequest,
    targets: &[ModelTarget],
    resolved: Vec<Result<Resolved>>,
) -> Vec<ModelResult> {
    let mut slots: Vec<Option<ModelResult>> = (0..targets.len()).map(|_| None).collect();
    let (tx, rx) = bounded::<Delivery>(targets.len());
    let mut pending = 0usize;

    for (index, resolution) in resolved.into_iter().enumerate() {
        match resolution {
            Err(err) => {
                slots[index] = Some(ModelResult::failure(&targets[index].model, "", 0, err.to_string()));
            }
            Ok(target) => {
                pending += 1;
                let tx = tx.clone();
                let token = cancel.clone();
                let mut req = request.clone();
                req.model = Some(target.model.clone());
                std::thread::spawn(move || {
                    let started = Instant::now();
                    let outcome = target.adapter.complete(&req, &target.model, &token);
                    let latency = started.elapsed().as_millis() as u64;
                    // the collector may have given up; a closed channel is fine
                    let _ = tx.send((index, outcome, latency));
                });
            }
        }
    }
    drop(tx);

    while pending > 0 {
        match rx.recv_timeout(COLLECT_SLICE) {
            Ok((index, outcome, latency)) => {
                pending -= 1;
                slots[index] = Some(match outcome {
                    Ok(response) => ModelResult::success(response, latency),
                    Err(err) => {
                        warn!(provider = %err.provider, model = %targets[index].model, error = %err, "dispatch target failed");
                        ModelResult::failure(&targets[index].model, &err.provider, latency, err.to_string())
                    }
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                ModelResult::failure(
                    &targets[index].model,
                    targets[index].provider.as_deref().unwrap_or(""),
                    0,
                    "timeout: deadline reached before the model answered".to_string(),
                )
            })
        })
        .collect()
}

fn persist(
    conn: &mut Connection,
    dispatch_id: &str,
    claims: &Claims,
    request: &DispatchRequest,
    lm_request: &LmRequest,
    results: &mut [ModelResult],
) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO dispatches (id, prompt_hash, models_json, status, created_by, created_at)
         VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
        params![
            dispatch_id,
            sha256_hex(request.prompt.as_bytes()),
            serde_json::to_string(&request.models)?,
            claims.user_id,
            now_timestamp(),
        ],
    )?;
    for result in results.iter_mut() {
        let entry = NewLedgerEntry {
            flow_id: dispatch_id.to_string(),
            dispatch_id: Some(dispatch_id.to_string()),
            step_index: 0,
            model_id: result.model.clone(),
            provider: result.provider.clone(),
            prompt: lm_request.user_prompt(),
            system_prompt: lm_request.system_prompt(),
            response_raw: result.content.clone(),
            response_parsed: result.parsed.clone(),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            latency_ms: result.latency_ms,
            finish_reason: if result.error.is_some() { "error".into() } else { "stop".into() },
            error: result.error.clone(),
            ..NewLedgerEntry::default()
        };
        result.ledger_entry_id = Some(ledger::append(&tx, &entry)?.id);
    }
    tx.execute(
        "UPDATE dispatches SET status = 'completed', completed_at = ?1 WHERE id = ?2",
        params![now_timestamp(), dispatch_id],
    )?;
    tx.commit()?;
    Ok(())
}

/// A fallback-chain answer and where it was ledgered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub flow_id: String,
    pub response: LmResponse,
    pub ledger_entry_id: i64,
}

/// Walks the fallback chain for one answer. Every failed provider attempt is
/// ledgered under `flow_id` (a fresh id when absent) in attempt order,
/// followed by the successful reply. A chain that found no provider at all
/// still leaves one failure entry.
pub fn complete(
    platform: &Platform,
    claims: Option<&Claims>,
    cancel: &CancelToken,
    flow_id: Option<&str>,
    request: &LmRequest,
) -> Result<Completion> {
    let claims = require_auth(claims)?;
    cancel.check()?;
    {
        let conn = platform.conn()?;
        match &request.model {
            Some(model) => {
                grants::enforce(&conn, claims, model, StepType::Llm)?;
            }
            None => {
                for adapter in platform.client.configured_providers() {
                    if let Some(model) = adapter.models().first() {
                        grants::enforce(&conn, claims, model, StepType::Llm)?;
                    }
                }
            }
        }
    }

    let flow_id = flow_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
    let outcome = platform.client.complete_chain(cancel, request);
    let ledger_entry_id = {
        let conn = platform.conn()?;
        record_chain(&conn, &flow_id, request, &outcome)?
    };
    let ChainOutcome { failures, result } = outcome;
    match result {
        Ok(response) => {
            info!(flow_id = %flow_id, provider = %response.provider, failed_attempts = failures.len(), "completion answered");
            Ok(Completion {
                flow_id,
                response,
                ledger_entry_id,
            })
        }
        Err(err) => {
            warn!(flow_id = %flow_id, attempts = failures.len(), error = %err, "completion failed on every provider");
            Err(err.into())
        }
    }
}

/// Appends the chain's attempts and returns the id of the last entry.
fn record_chain(conn: &Connection, flow_id: &str, request: &LmRequest, outcome: &ChainOutcome) -> Result<i64> {
    let tx = store::write_tx(conn)?;
    let mut entries: Vec<NewLedgerEntry> = outcome
        .failures
        .iter()
        .enumerate()
        .map(|(index, failure)| {
            NewLedgerEntry::from_failure(
                flow_id,
                index as i64,
                request,
                &failure.provider,
                &failure.model,
                failure.latency_ms,
                &failure.error,
            )
        })
        .collect();
    let next = entries.len() as i64;
    match &outcome.result {
        Ok(response) => entries.push(NewLedgerEntry::from_response(flow_id, next, request, response)),
        Err(err) if entries.is_empty() => entries.push(NewLedgerEntry::from_failure(
            flow_id,
            0,
            request,
            &err.provider,
            request.model.as_deref().unwrap_or(""),
            0,
            err,
        )),
        Err(_) => {}
    }
    let mut last = 0;
    for entry in &entries {
        last = ledger::append(&tx, entry)?.id;
    }
    tx.commit()?;
    Ok(last)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub id: String,
    pub prompt_hash: String,
    pub models: Vec<ModelTarget>,
    pub status: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub entries: Vec<LedgerEntry>,
}

pub fn get_dispatch(conn: &Connection, id: &str) -> Result<DispatchRecord> {
    let row = conn
        .query_row(
            "SELECT id, prompt_hash, models_json, status, created_by, created_at, completed_at
             FROM dispatches WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("dispatch {id}")))?;
    let (id, prompt_hash, models_json, status, created_by, created_at, completed_at) = row;
    let entries = ledger::list_flow(conn, &id)?;
    Ok(DispatchRecord {
        models: serde_json::from_str(&models_json)?,
        id,
        prompt_hash,
        status,
        created_by,
        created_at,
        completed_at,
        entries,
    })
}
