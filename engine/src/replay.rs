// engine/src/replay.rs
//!
//! Replay engine: re-runs recorded LM calls against another target.
//!
//! Only the prompt and system prompt are replayed; sampling parameters are
//! not recorded. Replays land in the original flow at
//! `original.step_index + 1_000_000 + k`, where `k` counts earlier replays of
//! the same entry, and point back through `replay_of`.

use crate::cancel::CancelToken;
use crate::collaborators::{require_auth, Claims};
use crate::grants::{self, StepType};
use crate::ledger::{self, LedgerEntry, NewLedgerEntry};
use crate::lm_client::call_adapter;
use crate::model_adapters::{CallError, CallErrorKind, LmRequest};
use crate::platform::Platform;
use crate::registry::{self, ModelTarget};
use crate::{Error, Result};
use crossbeam::channel::bounded;
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

/// Offset separating replays from the steps of the original flow.
pub const REPLAY_INDEX_OFFSET: i64 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    pub entry_id: i64,
    #[serde(default)]
    pub provider: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayDiff {
    pub delta_tokens_in: i64,
    pub delta_tokens_out: i64,
    pub delta_latency_ms: i64,
    pub original_content: String,
    pub replay_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_error: Option<String>,
}

impl ReplayDiff {
    pub fn between(original: &LedgerEntry, replay: &LedgerEntry) -> Self {
        Self {
            delta_tokens_in: replay.tokens_in as i64 - original.tokens_in as i64,
            delta_tokens_out: replay.tokens_out as i64 - original.tokens_out as i64,
            delta_latency_ms: replay.latency_ms as i64 - original.latency_ms as i64,
            original_content: original.response_raw.clone(),
            replay_content: replay.response_raw.clone(),
            replay_error: replay.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutcome {
    pub original: LedgerEntry,
    pub replay: LedgerEntry,
    pub diff: ReplayDiff,
}

/// Replays one ledger entry. A failed call is still recorded and reported
/// through `diff.replay_error`; only setup failures return `Err`.
pub fn replay_step(
    platform: &Platform,
    claims: Option<&Claims>,
    cancel: &CancelToken,
    request: &ReplayRequest,
) -> Result<ReplayOutcome> {
    let claims = require_auth(claims)?;
    if request.model.trim().is_empty() {
        return Err(Error::InvalidInput("replay model is required".into()));
    }
    cancel.check()?;

    let target = ModelTarget {
        model: request.model.clone(),
        provider: request.provider.clone(),
    };
    let (original, resolved) = {
        let conn = platform.conn()?;
        let original = ledger::get(&conn, request.entry_id)?;
        grants::enforce(&conn, claims, &target.model, StepType::Llm)?;
        let resolved = registry::resolve_target(&conn, &platform.client, &target);
        (original, resolved)
    };

    let system = Some(original.system_prompt.as_str());
    let mut lm_request = LmRequest::from_prompts(Some(target.model.clone()), system, &original.prompt);
    lm_request.json = original.response_parsed.is_some();

    let started = Instant::now();
    let (provider, outcome) = match resolved {
        Ok(resolved) => (
            resolved.provider.clone(),
            call_adapter(resolved.adapter.as_ref(), cancel, &lm_request),
        ),
        Err(err) => {
            let provider = target.provider.clone().unwrap_or_default();
            let failure = CallError::new(&provider, CallErrorKind::UnknownProvider, err.to_string());
            (provider, Err(failure))
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let mut conn = platform.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let earlier: i64 = tx.query_row(
        "SELECT COUNT(*) FROM flow_steps WHERE replay_of = ?1",
        params![original.id],
        |row| row.get(0),
    )?;
    let step_index = original.step_index + REPLAY_INDEX_OFFSET + earlier;
    let mut entry = match &outcome {
        Ok(response) => NewLedgerEntry::from_response(&original.flow_id, step_index, &lm_request, response),
        Err(err) => {
            warn!(entry_id = original.id, provider = %provider, model = %target.model, error = %err, "replay call failed");
            NewLedgerEntry::from_failure(
                &original.flow_id,
                step_index,
                &lm_request,
                &provider,
                &target.model,
                latency_ms,
                err,
            )
        }
    };
    entry.dispatch_id = original.dispatch_id.clone();
    entry.node_id = original.node_id.clone();
    entry.replay_of = Some(original.id);
    let replay = ledger::append(&tx, &entry)?;
    tx.commit()?;

    info!(
        entry_id = original.id,
        replay_id = replay.id,
        model = %target.model,
        step_index,
        "ledger entry replayed"
    );
    let diff = ReplayDiff::between(&original, &replay);
    Ok(ReplayOutcome {
        original,
        replay,
        diff,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReplayRequest {
    /// Workflow batch whose runs are replayed.
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Only entries originally answered by this model.
    #[serde(default)]
    pub filter_model: Option<String>,
    /// Provider to pin the replays to.
    #[serde(default)]
    pub provider: Option<String>,
    pub replay_model: String,
    /// Only entries whose node carries this tag.
    #[serde(default)]
    pub filter_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReplayItem {
    pub entry_id: i64,
    pub replay_entry_id: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReplayReport {
    pub requested: usize,
    pub replayed: usize,
    pub failed: usize,
    pub items: Vec<BulkReplayItem>,
}

fn select_entries(platform: &Platform, request: &BulkReplayRequest) -> Result<Vec<LedgerEntry>> {
    let entries = {
        let conn = platform.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM flow_steps
             WHERE replay_of IS NULL
               AND (?1 IS NULL OR flow_id IN (SELECT run_id FROM workflow_runs WHERE batch_id = ?1))
               AND (?2 IS NULL OR model_id = ?2)
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![request.batch_id, request.filter_model], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids.into_iter()
            .map(|id| ledger::get(&conn, id))
            .collect::<Result<Vec<_>>>()?
    };
    let Some(tag) = &request.filter_tag else {
        return Ok(entries);
    };
    let mut tagged = Vec::new();
    for entry in entries {
        let Some(node_id) = &entry.node_id else { continue };
        if let Some(node) = platform.nodes.get_node(node_id)? {
            if node.tags.iter().any(|t| t == tag) {
                tagged.push(entry);
            }
        }
    }
    Ok(tagged)
}

/// Replays every matching entry on `replay_concurrency` worker threads. The
/// report lists one item per selected entry, in ledger order.
pub fn replay_bulk(
    platform: &Platform,
    claims: Option<&Claims>,
    cancel: &CancelToken,
    request: &BulkReplayRequest,
) -> Result<BulkReplayReport> {
    let claims = require_auth(claims)?;
    if request.batch_id.is_none() && request.filter_model.is_none() {
        return Err(Error::InvalidInput("bulk replay needs a batch id or a model filter".into()));
    }
    if request.replay_model.trim().is_empty() {
        return Err(Error::InvalidInput("replay model is required".into()));
    }
    {
        let conn = platform.conn()?;
        grants::enforce(&conn, claims, &request.replay_model, StepType::Llm)?;
    }
    let entries = select_entries(platform, request)?;
    let workers = platform.config.replay_concurrency.max(1).min(entries.len().max(1));
    info!(entries = entries.len(), workers, model = %request.replay_model, "bulk replay started");

    let (job_tx, job_rx) = bounded::<(usize, i64)>(workers);
    let (done_tx, done_rx) = bounded::<(usize, BulkReplayItem)>(entries.len().max(1));
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let (job_rx, done_tx) = (job_rx.clone(), done_tx.clone());
            scope.spawn(move || {
                for (position, entry_id) in job_rx.iter() {
                    let item = if cancel.is_cancelled() {
                        BulkReplayItem {
                            entry_id,
                            replay_entry_id: None,
                            error: Some("cancelled before replay".into()),
                        }
                    } else {
                        let single = ReplayRequest {
                            entry_id,
                            provider: request.provider.clone(),
                            model: request.replay_model.clone(),
                        };
                        match replay_step(platform, Some(claims), cancel, &single) {
                            Ok(outcome) => BulkReplayItem {
                                entry_id,
                                replay_entry_id: Some(outcome.replay.id),
                                error: outcome.replay.error,
                            },
                            Err(err) => BulkReplayItem {
                                entry_id,
                                replay_entry_id: None,
                                error: Some(err.to_string()),
                            },
                        }
                    };
                    if done_tx.send((position, item)).is_err() {
                        return;
                    }
                }
            });
        }
        for (position, entry) in entries.iter().enumerate() {
            if job_tx.send((position, entry.id)).is_err() {
                break;
            }
        }
        drop(job_tx);
    });
    drop(done_tx);

    let mut items: Vec<(usize, BulkReplayItem)> = done_rx.try_iter().collect();
    items.sort_by_key(|(position, _)| *position);
    let items: Vec<BulkReplayItem> = items.into_iter().map(|(_, item)| item).collect();
    let failed = items.iter().filter(|item| item.error.is_some()).count();
    let report = BulkReplayReport {
        requested: entries.len(),
        replayed: items.len() - failed,
        failed,
        items,
    };
    info!(requested = report.requested, replayed = report.replayed, failed = report.failed, "bulk replay finished");
    Ok(report)
}
