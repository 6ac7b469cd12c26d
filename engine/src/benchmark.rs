// engine/src/benchmark.rs
//!
//! Benchmark runner: runs one workflow over a node corpus once per target
//! model and aggregates the scores the workflow reports.
//!
//! Scores come from the parsed JSON of the last completed step of each run,
//! keyed by metric name; `latency` is the summed ledger latency of the run.
//! The `results` column has this shape:
//!
//! ```json
//! { "per_model": { "<model>": { "<metric>": { "mean": 4.5, "stddev": 0.5, "samples": 2 } } },
//!   "per_node":  { "<node>":  { "<metric>": "<best model>" } },
//!   "runs": [ { "node_id": "..", "model": "..", "run_id": "..", "status": "completed", "metrics": {} } ] }
//! ```

use crate::cancel::CancelToken;
use crate::collaborators::{require_auth, Claims};
use crate::ledger;
use crate::platform::Platform;
use crate::registry::ModelTarget;
use crate::workflow::definition;
use crate::workflow::executor::{run_to_completion, RunDetail, RunRequest, RunStatus, StepStatus};
use crate::{now_timestamp, Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Fidelity,
    HallucinationCount,
    SourceAccuracy,
    Latency,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Fidelity,
        Metric::HallucinationCount,
        Metric::SourceAccuracy,
        Metric::Latency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Fidelity => "fidelity",
            Metric::HallucinationCount => "hallucination_count",
            Metric::SourceAccuracy => "source_accuracy",
            Metric::Latency => "latency",
        }
    }

    pub fn higher_is_better(&self) -> bool {
        matches!(self, Metric::Fidelity | Metric::SourceAccuracy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BenchmarkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BenchmarkStatus::Pending => "pending",
            BenchmarkStatus::Running => "running",
            BenchmarkStatus::Completed => "completed",
            BenchmarkStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(BenchmarkStatus::Pending),
            "running" => Ok(BenchmarkStatus::Running),
            "completed" => Ok(BenchmarkStatus::Completed),
            "failed" => Ok(BenchmarkStatus::Failed),
            other => Err(Error::Internal(format!("unknown benchmark status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Benchmark {
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
    pub filter_tags: Vec<String>,
    pub filter_min_score: Option<f64>,
    pub workflow_name: String,
    pub metrics: Vec<Metric>,
    pub status: BenchmarkStatus,
    pub replay_from: Option<String>,
    pub results: Option<Value>,
    pub created_by: String,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBenchmark {
    pub name: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub filter_tags: Vec<String>,
    #[serde(default)]
    pub filter_min_score: Option<f64>,
    pub workflow_name: String,
    /// Empty means every metric.
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

/// Metrics of one (node, model) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub node_id: String,
    pub model: String,
    pub run_id: String,
    pub status: RunStatus,
    pub metrics: BTreeMap<String, f64>,
}

type RawBenchmark = (Benchmark, String, String, String, String, Option<String>);

fn map_benchmark(row: &Row<'_>) -> rusqlite::Result<RawBenchmark> {
    Ok((
        Benchmark {
            id: row.get("id")?,
            name: row.get("name")?,
            models: Vec::new(),
            filter_tags: Vec::new(),
            filter_min_score: row.get("filter_min_score")?,
            workflow_name: row.get("workflow_name")?,
            metrics: Vec::new(),
            status: BenchmarkStatus::Pending,
            replay_from: row.get("replay_from")?,
            results: None,
            created_by: row.get("created_by")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        },
        row.get("models_json")?,
        row.get("filter_tags_json")?,
        row.get("metrics_json")?,
        row.get("status")?,
        row.get("results_json")?,
    ))
}

fn finish_benchmark(raw: RawBenchmark) -> Result<Benchmark> {
    let (mut benchmark, models, tags, metrics, status, results) = raw;
    benchmark.models = serde_json::from_str(&models)?;
    benchmark.filter_tags = serde_json::from_str(&tags)?;
    benchmark.metrics = serde_json::from_str(&metrics)?;
    benchmark.status = BenchmarkStatus::parse(&status)?;
    benchmark.results = results.map(|r| serde_json::from_str(&r)).transpose()?;
    Ok(benchmark)
}

pub fn get_benchmark(conn: &Connection, id: &str) -> Result<Benchmark> {
    let raw = conn
        .query_row("SELECT * FROM benchmarks WHERE id = ?1", params![id], map_benchmark)
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("benchmark {id}")))?;
    finish_benchmark(raw)
}

pub fn list_benchmarks(conn: &Connection) -> Result<Vec<Benchmark>> {
    let mut stmt = conn.prepare("SELECT * FROM benchmarks ORDER BY created_at, id")?;
    let rows = stmt.query_map([], map_benchmark)?;
    rows.map(|raw| finish_benchmark(raw?)).collect()
}

fn insert(conn: &Connection, claims: &Claims, new: &NewBenchmark, replay_from: Option<&str>) -> Result<Benchmark> {
    if new.name.trim().is_empty() {
        return Err(Error::InvalidInput("benchmark name is required".into()));
    }
    let models: Vec<String> = new
        .models
        .iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    if models.is_empty() {
        return Err(Error::InvalidInput("benchmark needs at least one model".into()));
    }
    definition::get_workflow_by_name(conn, &new.workflow_name)?;
    let metrics = if new.metrics.is_empty() {
        Metric::ALL.to_vec()
    } else {
        new.metrics.clone()
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO benchmarks (id, name, models_json, filter_tags_json, filter_min_score,
            workflow_name, metrics_json, status, replay_from, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10)",
        params![
            id,
            new.name.trim(),
            serde_json::to_string(&models)?,
            serde_json::to_string(&new.filter_tags)?,
            new.filter_min_score,
            new.workflow_name,
            serde_json::to_string(&metrics)?,
            replay_from,
            claims.user_id,
            now_timestamp(),
        ],
    )?;
    get_benchmark(conn, &id)
}

pub fn create_benchmark(conn: &Connection, claims: Option<&Claims>, new: &NewBenchmark) -> Result<Benchmark> {
    let claims = require_auth(claims)?;
    insert(conn, claims, new, None)
}

/// A new pending benchmark with the configuration of `source` and a new
/// model set.
pub fn replay_benchmark(conn: &Connection, claims: Option<&Claims>, source_id: &str, models: &[String]) -> Result<Benchmark> {
    let claims = require_auth(claims)?;
    let source = get_benchmark(conn, source_id)?;
    let new = NewBenchmark {
        name: format!("{} (replay)", source.name),
        models: models.to_vec(),
        filter_tags: source.filter_tags,
        filter_min_score: source.filter_min_score,
        workflow_name: source.workflow_name,
        metrics: source.metrics,
    };
    insert(conn, claims, &new, Some(source_id))
}

fn set_status(conn: &Connection, id: &str, status: BenchmarkStatus, results: Option<&Value>) -> Result<()> {
    let completed_at = matches!(status, BenchmarkStatus::Completed | BenchmarkStatus::Failed).then(now_timestamp);
    conn.execute(
        "UPDATE benchmarks SET status = ?1, results_json = COALESCE(?2, results_json),
            completed_at = COALESCE(?3, completed_at)
         WHERE id = ?4",
        params![status.as_str(), results.map(Value::to_string), completed_at, id],
    )?;
    Ok(())
}

/// Scores reported by a finished run.
fn run_metrics(conn: &Connection, detail: &RunDetail) -> Result<BTreeMap<String, f64>> {
    let mut metrics = BTreeMap::new();
    let scores = detail
        .steps
        .iter()
        .rev()
        .find(|s| s.status == StepStatus::Completed && s.output_parsed.is_some())
        .and_then(|s| s.output_parsed.as_ref());
    if let Some(Value::Object(scores)) = scores {
        for metric in Metric::ALL {
            if let Some(value) = scores.get(metric.as_str()).and_then(Value::as_f64) {
                metrics.insert(metric.as_str().to_string(), value);
            }
        }
    }
    let latency: u64 = ledger::list_flow(conn, &detail.run.run_id)?
        .iter()
        .map(|e| e.latency_ms)
        .sum();
    metrics.insert(Metric::Latency.as_str().to_string(), latency as f64);
    Ok(metrics)
}

/// Runs a pending benchmark to completion and stores its results.
pub fn run_benchmark(platform: &Platform, claims: Option<&Claims>, cancel: &CancelToken, id: &str) -> Result<Benchmark> {
    let claims = require_auth(claims)?;
    let (benchmark, workflow) = {
        let conn = platform.conn()?;
        let benchmark = get_benchmark(&conn, id)?;
        if benchmark.status != BenchmarkStatus::Pending {
            return Err(Error::Conflict(format!("benchmark is {}", benchmark.status.as_str())));
        }
        let workflow = definition::get_workflow_by_name(&conn, &benchmark.workflow_name)?;
        set_status(&conn, id, BenchmarkStatus::Running, None)?;
        (benchmark, workflow)
    };

    let corpus = platform
        .nodes
        .find_nodes(&benchmark.filter_tags, benchmark.filter_min_score)?;
    info!(benchmark_id = %id, nodes = corpus.len(), models = benchmark.models.len(), "benchmark started");

    let mut runs = Vec::with_capacity(corpus.len() * benchmark.models.len());
    for node in &corpus {
        for model in &benchmark.models {
            if let Err(err) = cancel.check() {
                set_status(&*platform.conn()?, id, BenchmarkStatus::Failed, Some(&json!({ "error": err.to_string() })))?;
                return Err(err);
            }
            let request = RunRequest {
                node_id: Some(node.id.clone()),
                body: Some(node.body.clone()),
                model_override: Some(ModelTarget::model(model.clone())),
                ..RunRequest::new(workflow.workflow_id.clone())
            };
            let detail = match run_to_completion(platform, Some(claims), cancel, &request) {
                Ok(detail) => detail,
                Err(err) => {
                    warn!(benchmark_id = %id, node_id = %node.id, model = %model, error = %err, "benchmark run could not start");
                    set_status(&*platform.conn()?, id, BenchmarkStatus::Failed, Some(&json!({ "error": err.to_string() })))?;
                    return Err(err);
                }
            };
            let metrics = run_metrics(&*platform.conn()?, &detail)?;
            runs.push(RunRecord {
                node_id: node.id.clone(),
                model: model.clone(),
                run_id: detail.run.run_id,
                status: detail.run.status,
                metrics,
            });
        }
    }

    let results = aggregate(&benchmark.models, &benchmark.metrics, &runs);
    let conn = platform.conn()?;
    set_status(&conn, id, BenchmarkStatus::Completed, Some(&results))?;
    info!(benchmark_id = %id, runs = runs.len(), "benchmark completed");
    get_benchmark(&conn, id)
}

fn summary(samples: &[f64]) -> Value {
    if samples.is_empty() {
        return json!({ "mean": null, "stddev": null, "samples": 0 });
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    json!({ "mean": mean, "stddev": variance.sqrt(), "samples": samples.len() })
}

fn latency_of(run: &RunRecord) -> f64 {
    run.metrics
        .get(Metric::Latency.as_str())
        .copied()
        .unwrap_or(f64::INFINITY)
}

/// Best model for one metric among runs of the same node. Equal scores go
/// to the faster run, then to the earlier model.
fn best_model(candidates: &[&RunRecord], metric: Metric) -> Option<String> {
    let mut best: Option<(&RunRecord, f64)> = None;
    for run in candidates {
        let Some(value) = run.metrics.get(metric.as_str()).copied() else {
            continue;
        };
        let better = match best {
            None => true,
            Some((current, current_value)) => {
                if value == current_value {
                    latency_of(run) < latency_of(current)
                } else if metric.higher_is_better() {
                    value > current_value
                } else {
                    value < current_value
                }
            }
        };
        if better {
            best = Some((run, value));
        }
    }
    best.map(|(run, _)| run.model.clone())
}

pub fn aggregate(models: &[String], metrics: &[Metric], runs: &[RunRecord]) -> Value {
    let mut per_model = Map::new();
    for model in models {
        let mut by_metric = Map::new();
        for metric in metrics {
            let samples: Vec<f64> = runs
                .iter()
                .filter(|r| &r.model == model && r.status == RunStatus::Completed)
                .filter_map(|r| r.metrics.get(metric.as_str()).copied())
                .collect();
            by_metric.insert(metric.as_str().to_string(), summary(&samples));
        }
        per_model.insert(model.clone(), Value::Object(by_metric));
    }

    let mut node_ids: Vec<&str> = Vec::new();
    for run in runs {
        if !node_ids.contains(&run.node_id.as_str()) {
            node_ids.push(&run.node_id);
        }
    }
    let mut per_node = Map::new();
    for node_id in node_ids {
        let candidates: Vec<&RunRecord> = runs
            .iter()
            .filter(|r| r.node_id == node_id && r.status == RunStatus::Completed)
            .collect();
        let mut best = Map::new();
        for metric in metrics {
            let winner = best_model(&candidates, *metric).map(Value::from).unwrap_or(Value::Null);
            best.insert(metric.as_str().to_string(), winner);
        }
        per_node.insert(node_id.to_string(), Value::Object(best));
    }

    json!({ "per_model": per_model, "per_node": per_node, "runs": runs })
}
