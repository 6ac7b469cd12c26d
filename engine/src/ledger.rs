// engine/src/ledger.rs
//!
//! Forensic ledger: one append-only row per LM call attempt.
//!
//! Rows are addressed by `id` and by `(flow_id, step_index)`. The table
//! refuses UPDATE and DELETE at the database level. The ledger can be
//! exported as a standalone SQLite file when federation is enabled.

use crate::model_adapters::{CallError, LmRequest, LmResponse};
use crate::{now_timestamp, Error, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::info;

pub const MAX_PAGE: usize = 1000;
pub const DEFAULT_PAGE: usize = 100;
/// Below this many samples percentiles are reported as null.
pub const MIN_PERCENTILE_SAMPLES: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLedgerEntry {
    pub flow_id: String,
    pub dispatch_id: Option<String>,
    pub step_index: i64,
    pub node_id: Option<String>,
    pub model_id: String,
    pub provider: String,
    pub prompt: String,
    pub system_prompt: String,
    pub response_raw: String,
    pub response_parsed: Option<Value>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
    pub finish_reason: String,
    pub error: Option<String>,
    pub eval_score: Option<f64>,
    pub replay_of: Option<i64>,
}

impl NewLedgerEntry {
    pub fn from_response(flow_id: &str, step_index: i64, request: &LmRequest, response: &LmResponse) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            step_index,
            model_id: response.model.clone(),
            provider: response.provider.clone(),
            prompt: request.user_prompt(),
            system_prompt: request.system_prompt(),
            response_raw: response.content.clone(),
            response_parsed: response.parsed.clone(),
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            latency_ms: response.latency_ms,
            finish_reason: response.finish_reason.clone(),
            ..Self::default()
        }
    }

    pub fn from_failure(
        flow_id: &str,
        step_index: i64,
        request: &LmRequest,
        provider: &str,
        model: &str,
        latency_ms: u64,
        error: &CallError,
    ) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            step_index,
            model_id: model.to_string(),
            provider: provider.to_string(),
            prompt: request.user_prompt(),
            system_prompt: request.system_prompt(),
            latency_ms,
            finish_reason: "error".to_string(),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub flow_id: String,
    pub dispatch_id: Option<String>,
    pub step_index: i64,
    pub node_id: Option<String>,
    pub model_id: String,
    pub provider: String,
    pub prompt: String,
    pub system_prompt: String,
    pub response_raw: String,
    pub response_parsed: Option<Value>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
    pub finish_reason: String,
    pub error: Option<String>,
    pub eval_score: Option<f64>,
    pub replay_of: Option<i64>,
    pub created_at: String,
}

const ENTRY_COLUMNS: &str = "id, flow_id, dispatch_id, step_index, node_id, model_id, provider,
    prompt, system_prompt, response_raw, response_parsed, tokens_in, tokens_out, latency_ms,
    finish_reason, error, eval_score, replay_of, created_at";

fn map_entry(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let parsed: Option<String> = row.get("response_parsed")?;
    Ok(LedgerEntry {
        id: row.get("id")?,
        flow_id: row.get("flow_id")?,
        dispatch_id: row.get("dispatch_id")?,
        step_index: row.get("step_index")?,
        node_id: row.get("node_id")?,
        model_id: row.get("model_id")?,
        provider: row.get("provider")?,
        prompt: row.get("prompt")?,
        system_prompt: row.get("system_prompt")?,
        response_raw: row.get("response_raw")?,
        response_parsed: parsed.and_then(|p| serde_json::from_str(&p).ok()),
        tokens_in: row.get::<_, i64>("tokens_in")? as u64,
        tokens_out: row.get::<_, i64>("tokens_out")? as u64,
        latency_ms: row.get::<_, i64>("latency_ms")? as u64,
        finish_reason: row.get("finish_reason")?,
        error: row.get("error")?,
        eval_score: row.get("eval_score")?,
        replay_of: row.get("replay_of")?,
        created_at: row.get("created_at")?,
    })
}

/// Appends one entry. `created_at` never goes backwards relative to the
/// previous row; equal timestamps are ordered by `id`. The clamp happens in
/// the insert itself, so a caller outside a write transaction never reads
/// and then writes.
pub fn append(conn: &Connection, entry: &NewLedgerEntry) -> Result<LedgerEntry> {
    if entry.flow_id.is_empty() {
        return Err(Error::InvalidInput("ledger entry needs a flow id".into()));
    }
    let parsed = entry
        .response_parsed
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO flow_steps (flow_id, dispatch_id, step_index, node_id, model_id, provider,
            prompt, system_prompt, response_raw, response_parsed, tokens_in, tokens_out,
            latency_ms, finish_reason, error, eval_score, replay_of, created_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             MAX(?18, COALESCE((SELECT created_at FROM flow_steps ORDER BY id DESC LIMIT 1), ?18))",
        params![
            entry.flow_id,
            entry.dispatch_id,
            entry.step_index,
            entry.node_id,
            entry.model_id,
            entry.provider,
            entry.prompt,
            entry.system_prompt,
            entry.response_raw,
            parsed,
            entry.tokens_in as i64,
            entry.tokens_out as i64,
            entry.latency_ms as i64,
            entry.finish_reason,
            entry.error,
            entry.eval_score,
            entry.replay_of,
            now_timestamp(),
        ],
    )?;
    get(conn, conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<LedgerEntry> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM flow_steps WHERE id = ?1"),
        params![id],
        map_entry,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("ledger entry {id}")))
}

/// Every entry of a flow in `step_index` order.
pub fn list_flow(conn: &Connection, flow_id: &str) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM flow_steps WHERE flow_id = ?1 ORDER BY step_index, id"
    ))?;
    let rows = stmt.query_map(params![flow_id], map_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Entries at one `(flow_id, step_index)` address. Dispatches put every
/// model at index 0, so this can return more than one row.
pub fn entries_at(conn: &Connection, flow_id: &str, step_index: i64) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM flow_steps WHERE flow_id = ?1 AND step_index = ?2 ORDER BY id"
    ))?;
    let rows = stmt.query_map(params![flow_id, step_index], map_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<String>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

fn filter_clause(query: &LedgerQuery) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    if let Some(provider) = &query.provider {
        args.push(provider.clone());
        clauses.push(format!("provider = ?{}", args.len()));
    }
    if let Some(model) = &query.model {
        args.push(model.clone());
        clauses.push(format!("model_id = ?{}", args.len()));
    }
    if let Some(since) = &query.since {
        args.push(since.clone());
        clauses.push(format!("created_at >= ?{}", args.len()));
    }
    if let Some(until) = &query.until {
        args.push(until.clone());
        clauses.push(format!("created_at < ?{}", args.len()));
    }
    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), args)
    }
}

/// Paged query by provider, model and date range, newest first.
pub fn query(conn: &Connection, query: &LedgerQuery) -> Result<Vec<LedgerEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let (filter, args) = filter_clause(query);
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM flow_steps {filter} ORDER BY created_at DESC, id DESC LIMIT {limit} OFFSET {}",
        query.offset
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), map_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    pub model_id: String,
    pub total_calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub mean_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
    pub p99_latency_ms: Option<u64>,
    pub error_count: u64,
    pub error_rate: f64,
}

/// Value at ordered offset `floor(n * pct / 100)` of sorted samples.
fn percentile(sorted: &[u64], pct: usize) -> Option<u64> {
    if sorted.len() < MIN_PERCENTILE_SAMPLES {
        return None;
    }
    let offset = (sorted.len() * pct / 100).min(sorted.len() - 1);
    Some(sorted[offset])
}

/// Per-model aggregates over the entries matching `filter` (paging fields
/// are ignored). Latency statistics only count non-zero latencies.
pub fn model_stats(conn: &Connection, filter: &LedgerQuery) -> Result<Vec<ModelStats>> {
    let (clause, args) = filter_clause(filter);
    let mut stmt = conn.prepare(&format!(
        "SELECT model_id, COUNT(*), COALESCE(SUM(tokens_in), 0), COALESCE(SUM(tokens_out), 0),
                SUM(CASE WHEN error IS NOT NULL THEN 1 ELSE 0 END)
         FROM flow_steps {clause} GROUP BY model_id ORDER BY model_id"
    ))?;
    let totals = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
                row.get::<_, i64>(3)? as u64,
                row.get::<_, i64>(4)? as u64,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stats = Vec::with_capacity(totals.len());
    for (model_id, total_calls, tokens_in, tokens_out, error_count) in totals {
        let mut latency_args = args.clone();
        latency_args.push(model_id.clone());
        let model_clause = if clause.is_empty() {
            format!("WHERE model_id = ?{}", latency_args.len())
        } else {
            format!("{clause} AND model_id = ?{}", latency_args.len())
        };
        let mut latency_stmt = conn.prepare(&format!(
            "SELECT latency_ms FROM flow_steps {model_clause} AND latency_ms > 0 ORDER BY latency_ms"
        ))?;
        let latencies = latency_stmt
            .query_map(params_from_iter(latency_args.iter()), |row| {
                row.get::<_, i64>(0).map(|v| v as u64)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mean_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        };
        stats.push(ModelStats {
            model_id,
            total_calls,
            tokens_in,
            tokens_out,
            mean_latency_ms,
            p50_latency_ms: percentile(&latencies, 50),
            p95_latency_ms: percentile(&latencies, 95),
            p99_latency_ms: percentile(&latencies, 99),
            error_count,
            error_rate: if total_calls == 0 {
                0.0
            } else {
                error_count as f64 / total_calls as f64
            },
        });
    }
    Ok(stats)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowShare {
    pub flow_id: String,
    pub calls: u64,
}

/// The `n` flows that called `model_id` most.
pub fn top_flows(conn: &Connection, model_id: &str, n: usize) -> Result<Vec<FlowShare>> {
    let mut stmt = conn.prepare(
        "SELECT flow_id, COUNT(*) AS calls FROM flow_steps WHERE model_id = ?1
         GROUP BY flow_id ORDER BY calls DESC, MIN(id) LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![model_id, n.min(MAX_PAGE) as i64], |row| {
        Ok(FlowShare {
            flow_id: row.get(0)?,
            calls: row.get::<_, i64>(1)? as u64,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn schema_version(conn: &Connection) -> Result<String> {
    conn.query_row(
        "SELECT value FROM ledger_meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::Internal("ledger schema version missing".into()))
}

// Tables that never leave the instance in a ledger export.
const NON_LEDGER_TABLES: &[&str] = &[
    "step_runs",
    "workflow_runs",
    "workflow_audit",
    "workflow_steps",
    "workflows",
    "criteria_lists",
    "operator_group_members",
    "operator_groups",
    "model_grants",
    "benchmarks",
    "envelope_targets",
    "envelopes",
    "dedup_members",
    "dedup_clusters",
    "models",
    "providers",
];

/// Writes the ledger (flow steps, dispatches and the schema tag) to a
/// single SQLite file at `dest`. Returns the file size in bytes.
pub fn export_snapshot(conn: &Connection, federation_enabled: bool, dest: &Path) -> Result<u64> {
    if !federation_enabled {
        return Err(Error::Forbidden("ledger download requires federation".into()));
    }
    if dest.exists() {
        return Err(Error::Conflict(format!("{} already exists", dest.display())));
    }
    let dest_str = dest
        .to_str()
        .ok_or_else(|| Error::InvalidInput("snapshot path is not valid UTF-8".into()))?;
    conn.execute("VACUUM INTO ?1", params![dest_str])?;

    let snapshot = Connection::open(dest)?;
    let drops: String = NON_LEDGER_TABLES
        .iter()
        .map(|t| format!("DROP TABLE IF EXISTS {t};"))
        .collect();
    snapshot.execute_batch(&drops)?;
    snapshot.execute_batch("VACUUM;")?;
    drop(snapshot);

    let size = std::fs::metadata(dest)
        .map_err(|e| Error::Internal(format!("snapshot written but unreadable: {e}")))?
        .len();
    info!(path = %dest.display(), bytes = size, "ledger snapshot exported");
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    fn entry(flow: &str, index: i64, model: &str, latency: u64) -> NewLedgerEntry {
        NewLedgerEntry {
            flow_id: flow.into(),
            step_index: index,
            model_id: model.into(),
            provider: "prov".into(),
            prompt: "p".into(),
            response_raw: "r".into(),
            tokens_in: 2,
            tokens_out: 3,
            latency_ms: latency,
            finish_reason: "stop".into(),
            ..NewLedgerEntry::default()
        }
    }

    #[test]
    fn entries_are_append_only() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        let stored = append(&conn, &entry("f1", 0, "m1", 10))?;
        assert!(conn
            .execute("UPDATE flow_steps SET response_raw = 'x' WHERE id = ?1", params![stored.id])
            .is_err());
        assert!(conn
            .execute("DELETE FROM flow_steps WHERE id = ?1", params![stored.id])
            .is_err());
        assert_eq!(get(&conn, stored.id)?, stored);
        Ok(())
    }

    #[test]
    fn flow_readback_orders_by_step_index() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        append(&conn, &entry("f1", 2, "m1", 10))?;
        append(&conn, &entry("f1", 0, "m1", 10))?;
        append(&conn, &entry("f1", 1, "m2", 10))?;
        append(&conn, &entry("f2", 0, "m2", 10))?;
        let indexes: Vec<_> = list_flow(&conn, "f1")?.iter().map(|e| e.step_index).collect();
        assert_eq!(indexes, [0, 1, 2]);
        assert_eq!(entries_at(&conn, "f1", 1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn query_filters_and_clamps_limit() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        for i in 0..5 {
            append(&conn, &entry("f", i, if i % 2 == 0 { "m1" } else { "m2" }, 5))?;
        }
        let q = LedgerQuery {
            model: Some("m1".into()),
            limit: Some(50_000),
            ..LedgerQuery::default()
        };
        assert_eq!(query(&conn, &q)?.len(), 3);
        let q = LedgerQuery {
            limit: Some(2),
            offset: 1,
            ..LedgerQuery::default()
        };
        let page = query(&conn, &q)?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].step_index, 3);
        Ok(())
    }

    #[test]
    fn percentiles_need_minimum_samples() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        for i in 1..=10 {
            append(&conn, &entry("small", i, "few", i as u64 * 10))?;
        }
        for i in 1..=100 {
            append(&conn, &entry("big", i, "many", i as u64))?;
        }
        let mut failed = entry("big", 101, "many", 0);
        failed.error = Some("boom".into());
        append(&conn, &failed)?;

        let stats = model_stats(&conn, &LedgerQuery::default())?;
        let few = stats.iter().find(|s| s.model_id == "few").unwrap();
        assert_eq!(few.total_calls, 10);
        assert_eq!(few.p50_latency_ms, None);
        assert_eq!(few.mean_latency_ms, Some(55.0));

        let many = stats.iter().find(|s| s.model_id == "many").unwrap();
        assert_eq!(many.total_calls, 101);
        assert_eq!(many.error_count, 1);
        // zero latency of the failed call is excluded
        assert_eq!(many.p50_latency_ms, Some(51));
        assert_eq!(many.p95_latency_ms, Some(96));
        assert_eq!(many.p99_latency_ms, Some(100));
        assert_eq!(many.tokens_in, 202);
        Ok(())
    }

    #[test]
    fn top_flows_ranks_by_call_count() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        append(&conn, &entry("a", 0, "m", 1))?;
        append(&conn, &entry("b", 0, "m", 1))?;
        append(&conn, &entry("b", 1, "m", 1))?;
        append(&conn, &entry("c", 0, "other", 1))?;
        let top = top_flows(&conn, "m", 5)?;
        assert_eq!(top[0], FlowShare { flow_id: "b".into(), calls: 2 });
        assert_eq!(top.len(), 2);
        Ok(())
    }

    #[test]
    fn snapshot_is_gated_and_contains_only_the_ledger() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        append(&conn, &entry("f", 0, "m", 1))?;
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("ledger.sqlite");

        let err = export_snapshot(&conn, false, &dest).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Forbidden);

        let size = export_snapshot(&conn, true, &dest)?;
        assert!(size > 0);
        let snapshot = Connection::open(&dest)?;
        assert_eq!(schema_version(&snapshot)?, "flow-ledger/1");
        let rows: i64 = snapshot.query_row("SELECT COUNT(*) FROM flow_steps", [], |r| r.get(0))?;
        assert_eq!(rows, 1);
        let envelopes: i64 = snapshot.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'envelopes'",
            [],
            |r| r.get(0),
        )?;
        assert_eq!(envelopes, 0);
        Ok(())
    }
}
