// engine/src/workflow/definition.rs
//!
//! Workflow definitions: CRUD, the status machine, the audit log and
//! criteria lists.
//!
//! ```text
//! draft --submit--> pending_validation --activate--> active --archive--> archived
//!   `------------------activate (operator)-------------^
//! ```
//!
//! Name, description, pre-prompt and steps can only change in `draft`, and
//! every change bumps `version`.

use super::template;
use crate::collaborators::{require_auth, require_operator, Claims, Role};
use crate::grants::{self, StepType};
use crate::store;
use crate::{now_timestamp, Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;
/// Names every step can reference besides earlier step names.
const BUILTIN_CONTEXT: &[&str] = &["pre_prompt", "body", "node_id", "user_id", "criteria", "criteria_json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    PendingValidation,
    Active,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::PendingValidation => "pending_validation",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "draft" => Ok(WorkflowStatus::Draft),
            "pending_validation" => Ok(WorkflowStatus::PendingValidation),
            "active" => Ok(WorkflowStatus::Active),
            "archived" => Ok(WorkflowStatus::Archived),
            other => Err(Error::Internal(format!("unknown workflow status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub workflow_id: String,
    pub name: String,
    pub description: String,
    pub workflow_type: String,
    pub owner_id: String,
    pub owner_role: Role,
    pub status: WorkflowStatus,
    pub version: i64,
    pub pre_prompt_template: String,
    pub validated_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub workflow_type: String,
    #[serde(default)]
    pub pre_prompt_template: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pre_prompt_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub step_id: String,
    pub workflow_id: String,
    pub step_order: i64,
    pub step_name: String,
    pub step_type: StepType,
    pub provider: String,
    pub model: String,
    pub prompt_template: String,
    pub system_prompt: String,
    pub config: Value,
    pub criteria_list_id: Option<String>,
    pub timeout_ms: u64,
    pub retry_max: u32,
    pub fan_group: Option<String>,
}

impl WorkflowStep {
    /// A fan-group member whose failure fails the whole run.
    pub fn is_required(&self) -> bool {
        self.config.get("required").and_then(Value::as_bool).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStep {
    pub step_order: i64,
    pub step_name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub provider: Option<String>,
    pub model: String,
    pub prompt_template: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub criteria_list_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_max: Option<u32>,
    #[serde(default)]
    pub fan_group: Option<String>,
}

impl NewStep {
    pub fn new(step_order: i64, step_name: &str, step_type: StepType, model: &str, prompt_template: &str) -> Self {
        Self {
            step_order,
            step_name: step_name.to_string(),
            step_type,
            provider: None,
            model: model.to_string(),
            prompt_template: prompt_template.to_string(),
            system_prompt: String::new(),
            config: None,
            criteria_list_id: None,
            timeout_ms: None,
            retry_max: None,
            fan_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub workflow_id: String,
    pub action: String,
    pub actor_id: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub version: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriteriaList {
    pub list_id: String,
    pub name: String,
    pub description: String,
    pub items: Vec<String>,
    pub owner_id: String,
    pub created_at: String,
}

fn map_workflow(row: &Row<'_>) -> rusqlite::Result<(Workflow, String, String)> {
    let role: String = row.get("owner_role")?;
    let status: String = row.get("status")?;
    Ok((
        Workflow {
            workflow_id: row.get("workflow_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            workflow_type: row.get("workflow_type")?,
            owner_id: row.get("owner_id")?,
            owner_role: Role::Anon,
            status: WorkflowStatus::Draft,
            version: row.get("version")?,
            pre_prompt_template: row.get("pre_prompt_template")?,
            validated_by: row.get("validated_by")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        },
        role,
        status,
    ))
}

fn finish_workflow((mut workflow, role, status): (Workflow, String, String)) -> Result<Workflow> {
    workflow.owner_role = Role::parse(&role)?;
    workflow.status = WorkflowStatus::parse(&status)?;
    Ok(workflow)
}

fn map_step(row: &Row<'_>) -> rusqlite::Result<(WorkflowStep, String, String)> {
    let step_type: String = row.get("step_type")?;
    let config_json: String = row.get("config_json")?;
    Ok((
        WorkflowStep {
            step_id: row.get("step_id")?,
            workflow_id: row.get("workflow_id")?,
            step_order: row.get("step_order")?,
            step_name: row.get("step_name")?,
            step_type: StepType::Llm,
            provider: row.get("provider")?,
            model: row.get("model")?,
            prompt_template: row.get("prompt_template")?,
            system_prompt: row.get("system_prompt")?,
            config: Value::Null,
            criteria_list_id: row.get("criteria_list_id")?,
            timeout_ms: row.get::<_, i64>("timeout_ms")? as u64,
            retry_max: row.get::<_, i64>("retry_max")? as u32,
            fan_group: row.get("fan_group")?,
        },
        step_type,
        config_json,
    ))
}

fn finish_step((mut step, step_type, config_json): (WorkflowStep, String, String)) -> Result<WorkflowStep> {
    step.step_type = StepType::parse(&step_type)?;
    step.config = serde_json::from_str(&config_json)?;
    Ok(step)
}

pub fn get_workflow(conn: &Connection, workflow_id: &str) -> Result<Workflow> {
    let raw = conn
        .query_row(
            "SELECT * FROM workflows WHERE workflow_id = ?1",
            params![workflow_id],
            map_workflow,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("workflow {workflow_id}")))?;
    finish_workflow(raw)
}

pub fn get_workflow_by_name(conn: &Connection, name: &str) -> Result<Workflow> {
    let raw = conn
        .query_row("SELECT * FROM workflows WHERE name = ?1", params![name], map_workflow)
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("workflow '{name}'")))?;
    finish_workflow(raw)
}

pub fn list_workflows(conn: &Connection, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM workflows WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, name",
    )?;
    let rows = stmt.query_map(params![status.map(|s| s.as_str())], map_workflow)?;
    rows.map(|raw| finish_workflow(raw?)).collect()
}

pub fn list_steps(conn: &Connection, workflow_id: &str) -> Result<Vec<WorkflowStep>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order, step_name",
    )?;
    let rows = stmt.query_map(params![workflow_id], map_step)?;
    rows.map(|raw| finish_step(raw?)).collect()
}

fn get_step(conn: &Connection, step_id: &str) -> Result<WorkflowStep> {
    let raw = conn
        .query_row(
            "SELECT * FROM workflow_steps WHERE step_id = ?1",
            params![step_id],
            map_step,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("workflow step {step_id}")))?;
    finish_step(raw)
}

fn audit(
    tx: &Transaction<'_>,
    workflow_id: &str,
    action: &str,
    actor_id: &str,
    from: Option<WorkflowStatus>,
    to: Option<WorkflowStatus>,
    version: i64,
) -> Result<()> {
    tx.execute(
        "INSERT INTO workflow_audit (workflow_id, action, actor_id, from_status, to_status, version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            workflow_id,
            action,
            actor_id,
            from.map(|s| s.as_str()),
            to.map(|s| s.as_str()),
            version,
            now_timestamp(),
        ],
    )?;
    Ok(())
}

pub fn list_audit(conn: &Connection, workflow_id: &str) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, workflow_id, action, actor_id, from_status, to_status, version, created_at
         FROM workflow_audit WHERE workflow_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![workflow_id], |row| {
        Ok(AuditEntry {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            action: row.get(2)?,
            actor_id: row.get(3)?,
            from_status: row.get(4)?,
            to_status: row.get(5)?,
            version: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn create_workflow(conn: &Connection, claims: Option<&Claims>, new: &NewWorkflow) -> Result<Workflow> {
    let claims = require_auth(claims)?;
    let name = new.name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("workflow name is required".into()));
    }
    let workflow_id = Uuid::new_v4().to_string();
    let now = now_timestamp();
    let workflow_type = if new.workflow_type.trim().is_empty() {
        "vacf"
    } else {
        new.workflow_type.trim()
    };
    let tx = store::write_tx(conn)?;
    tx.execute(
        "INSERT INTO workflows (workflow_id, name, description, workflow_type, owner_id, owner_role,
            status, version, pre_prompt_template, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'draft', 1, ?7, ?8, ?8)",
        params![
            workflow_id,
            name,
            new.description,
            workflow_type,
            claims.user_id,
            claims.role.as_str(),
            new.pre_prompt_template,
            now,
        ],
    )
    .map_err(|e| Error::conflict_on_constraint(e, format!("workflow '{name}' already exists")))?;
    audit(&tx, &workflow_id, "create", &claims.user_id, None, Some(WorkflowStatus::Draft), 1)?;
    tx.commit()?;
    info!(workflow_id = %workflow_id, name = %name, "workflow created");
    get_workflow(conn, &workflow_id)
}

/// Loads a workflow the caller may edit: draft status, owned by the caller
/// or the caller is an operator.
fn editable(conn: &Connection, claims: &Claims, workflow_id: &str) -> Result<Workflow> {
    let workflow = get_workflow(conn, workflow_id)?;
    if workflow.owner_id != claims.user_id && !claims.is_operator() {
        return Err(Error::Forbidden("only the owner or an operator may edit this workflow".into()));
    }
    if workflow.status != WorkflowStatus::Draft {
        return Err(Error::Conflict(format!(
            "workflow is {}; only drafts can be edited",
            workflow.status.as_str()
        )));
    }
    Ok(workflow)
}

/// Bumps the version of a workflow that is still a draft. The status is
/// re-checked under the write lock; `editable` ran before it was taken.
fn bump_version(tx: &Transaction<'_>, workflow_id: &str, action: &str, actor: &str) -> Result<i64> {
    let changed = tx.execute(
        "UPDATE workflows SET version = version + 1, updated_at = ?1
         WHERE workflow_id = ?2 AND status = 'draft'",
        params![now_timestamp(), workflow_id],
    )?;
    if changed == 0 {
        return Err(Error::Conflict("workflow left draft status while it was being edited".into()));
    }
    let version: i64 = tx.query_row(
        "SELECT version FROM workflows WHERE workflow_id = ?1",
        params![workflow_id],
        |row| row.get(0),
    )?;
    audit(tx, workflow_id, action, actor, None, None, version)?;
    Ok(version)
}

pub fn update_workflow(
    conn: &Connection,
    claims: Option<&Claims>,
    workflow_id: &str,
    update: &WorkflowUpdate,
) -> Result<Workflow> {
    let claims = require_auth(claims)?;
    let workflow = editable(conn, claims, workflow_id)?;
    if let Some(name) = &update.name {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("workflow name must not be empty".into()));
        }
    }
    let tx = store::write_tx(conn)?;
    tx.execute(
        "UPDATE workflows SET
            name = COALESCE(?1, name),
            description = COALESCE(?2, description),
            pre_prompt_template = COALESCE(?3, pre_prompt_template)
         WHERE workflow_id = ?4",
        params![
            update.name.as_deref().map(str::trim),
            update.description,
            update.pre_prompt_template,
            workflow_id,
        ],
    )
    .map_err(|e| Error::conflict_on_constraint(e, "another workflow already has that name"))?;
    bump_version(&tx, &workflow.workflow_id, "update", &claims.user_id)?;
    tx.commit()?;
    get_workflow(conn, workflow_id)
}

fn validate_step(conn: &Connection, claims: &Claims, step: &NewStep) -> Result<()> {
    if step.step_name.trim().is_empty() {
        return Err(Error::InvalidInput("step name is required".into()));
    }
    if step.model.trim().is_empty() {
        return Err(Error::InvalidInput("step model is required".into()));
    }
    if step.prompt_template.trim().is_empty() {
        return Err(Error::InvalidInput("step prompt template is required".into()));
    }
    if step.timeout_ms == Some(0) {
        return Err(Error::InvalidInput("step timeout must be positive".into()));
    }
    if let Some(config) = &step.config {
        if !config.is_object() {
            return Err(Error::InvalidInput("step config must be a JSON object".into()));
        }
    }
    if !step.step_type.creatable_by(claims.role) {
        return Err(Error::Forbidden(format!(
            "role {} may not create {} steps",
            claims.role.as_str(),
            step.step_type.as_str()
        )));
    }
    if let Some(list_id) = &step.criteria_list_id {
        if !matches!(step.step_type, StepType::Validate | StepType::Chain) {
            return Err(Error::InvalidInput("only validate and chain steps take criteria".into()));
        }
        get_criteria_list(conn, list_id)?;
    }
    grants::enforce(conn, claims, &step.model, step.step_type)?;
    Ok(())
}

fn warn_unknown_placeholders(conn: &Connection, workflow_id: &str, step: &NewStep) -> Result<()> {
    let known: HashSet<String> = list_steps(conn, workflow_id)?
        .into_iter()
        .filter(|s| s.step_order < step.step_order)
        .map(|s| s.step_name)
        .chain(BUILTIN_CONTEXT.iter().map(|s| s.to_string()))
        .collect();
    for name in template::placeholders(&step.prompt_template)
        .into_iter()
        .chain(template::placeholders(&step.system_prompt))
    {
        if !known.contains(&name) {
            warn!(step = %step.step_name, placeholder = %name, "placeholder does not name an earlier step; it will render empty");
        }
    }
    Ok(())
}

pub fn add_step(conn: &Connection, claims: Option<&Claims>, workflow_id: &str, step: &NewStep) -> Result<WorkflowStep> {
    let claims = require_auth(claims)?;
    let workflow = editable(conn, claims, workflow_id)?;
    validate_step(conn, claims, step)?;
    warn_unknown_placeholders(conn, workflow_id, step)?;

    let step_id = Uuid::new_v4().to_string();
    let tx = store::write_tx(conn)?;
    tx.execute(
        "INSERT INTO workflow_steps (step_id, workflow_id, step_order, step_name, step_type, provider,
            model, prompt_template, system_prompt, config_json, criteria_list_id, timeout_ms,
            retry_max, fan_group)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            step_id,
            workflow_id,
            step.step_order,
            step.step_name.trim(),
            step.step_type.as_str(),
            step.provider.as_deref().unwrap_or(""),
            step.model.trim(),
            step.prompt_template,
            step.system_prompt,
            serde_json::to_string(step.config.as_ref().unwrap_or(&Value::Object(Default::default())))?,
            step.criteria_list_id,
            step.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS) as i64,
            step.retry_max.unwrap_or(0) as i64,
            step.fan_group.as_deref().map(str::trim).filter(|g| !g.is_empty()),
        ],
    )
    .map_err(|e| Error::conflict_on_constraint(e, format!("step '{}' already exists", step.step_name)))?;
    bump_version(&tx, &workflow.workflow_id, "add_step", &claims.user_id)?;
    tx.commit()?;
    get_step(conn, &step_id)
}

pub fn update_step(conn: &Connection, claims: Option<&Claims>, step_id: &str, step: &NewStep) -> Result<WorkflowStep> {
    let claims = require_auth(claims)?;
    let existing = get_step(conn, step_id)?;
    let workflow = editable(conn, claims, &existing.workflow_id)?;
    validate_step(conn, claims, step)?;

    let tx = store::write_tx(conn)?;
    tx.execute(
        "UPDATE workflow_steps SET step_order = ?1, step_name = ?2, step_type = ?3, provider = ?4,
            model = ?5, prompt_template = ?6, system_prompt = ?7, config_json = ?8,
            criteria_list_id = ?9, timeout_ms = ?10, retry_max = ?11, fan_group = ?12
         WHERE step_id = ?13",
        params![
            step.step_order,
            step.step_name.trim(),
            step.step_type.as_str(),
            step.provider.as_deref().unwrap_or(""),
            step.model.trim(),
            step.prompt_template,
            step.system_prompt,
            serde_json::to_string(step.config.as_ref().unwrap_or(&Value::Object(Default::default())))?,
            step.criteria_list_id,
            step.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS) as i64,
            step.retry_max.unwrap_or(0) as i64,
            step.fan_group.as_deref().map(str::trim).filter(|g| !g.is_empty()),
            step_id,
        ],
    )
    .map_err(|e| Error::conflict_on_constraint(e, format!("step '{}' already exists", step.step_name)))?;
    bump_version(&tx, &workflow.workflow_id, "update_step", &claims.user_id)?;
    tx.commit()?;
    get_step(conn, step_id)
}

pub fn remove_step(conn: &Connection, claims: Option<&Claims>, step_id: &str) -> Result<()> {
    let claims = require_auth(claims)?;
    let existing = get_step(conn, step_id)?;
    let workflow = editable(conn, claims, &existing.workflow_id)?;
    let tx = store::write_tx(conn)?;
    tx.execute("DELETE FROM workflow_steps WHERE step_id = ?1", params![step_id])?;
    bump_version(&tx, &workflow.workflow_id, "remove_step", &claims.user_id)?;
    tx.commit()?;
    Ok(())
}

fn transition(
    conn: &Connection,
    workflow: &Workflow,
    actor: &Claims,
    action: &str,
    to: WorkflowStatus,
) -> Result<Workflow> {
    let tx = store::write_tx(conn)?;
    let validated_by = (to == WorkflowStatus::Active).then(|| actor.user_id.clone());
    let changed = tx.execute(
        "UPDATE workflows SET status = ?1, updated_at = ?2, validated_by = COALESCE(?3, validated_by)
         WHERE workflow_id = ?4 AND status = ?5",
        params![
            to.as_str(),
            now_timestamp(),
            validated_by,
            workflow.workflow_id,
            workflow.status.as_str(),
        ],
    )?;
    if changed == 0 {
        return Err(Error::Conflict(format!(
            "workflow is no longer {}",
            workflow.status.as_str()
        )));
    }
    audit(
        &tx,
        &workflow.workflow_id,
        action,
        &actor.user_id,
        Some(workflow.status),
        Some(to),
        workflow.version,
    )?;
    tx.commit()?;
    info!(workflow_id = %workflow.workflow_id, from = workflow.status.as_str(), to = to.as_str(), "workflow transition");
    get_workflow(conn, &workflow.workflow_id)
}

fn require_steps(conn: &Connection, workflow_id: &str) -> Result<()> {
    if list_steps(conn, workflow_id)?.is_empty() {
        return Err(Error::InvalidInput("workflow has no steps".into()));
    }
    Ok(())
}

/// draft -> pending_validation, by the owner.
pub fn submit(conn: &Connection, claims: Option<&Claims>, workflow_id: &str) -> Result<Workflow> {
    let claims = require_auth(claims)?;
    let workflow = get_workflow(conn, workflow_id)?;
    if workflow.owner_id != claims.user_id {
        return Err(Error::Forbidden("only the owner may submit a workflow".into()));
    }
    if workflow.status != WorkflowStatus::Draft {
        return Err(Error::Conflict(format!("cannot submit a {} workflow", workflow.status.as_str())));
    }
    require_steps(conn, workflow_id)?;
    transition(conn, &workflow, claims, "submit", WorkflowStatus::PendingValidation)
}

/// draft or pending_validation -> active, by an operator.
pub fn activate(conn: &Connection, claims: Option<&Claims>, workflow_id: &str) -> Result<Workflow> {
    let claims = require_operator(claims)?;
    let workflow = get_workflow(conn, workflow_id)?;
    if !matches!(workflow.status, WorkflowStatus::Draft | WorkflowStatus::PendingValidation) {
        return Err(Error::Conflict(format!("cannot activate a {} workflow", workflow.status.as_str())));
    }
    require_steps(conn, workflow_id)?;
    transition(conn, &workflow, claims, "activate", WorkflowStatus::Active)
}

/// active -> archived, by the owner or an operator.
pub fn archive(conn: &Connection, claims: Option<&Claims>, workflow_id: &str) -> Result<Workflow> {
    let claims = require_auth(claims)?;
    let workflow = get_workflow(conn, workflow_id)?;
    if workflow.owner_id != claims.user_id && !claims.is_operator() {
        return Err(Error::Forbidden("only the owner or an operator may archive".into()));
    }
    if workflow.status != WorkflowStatus::Active {
        return Err(Error::Conflict(format!("cannot archive a {} workflow", workflow.status.as_str())));
    }
    transition(conn, &workflow, claims, "archive", WorkflowStatus::Archived)
}

pub fn create_criteria_list(
    conn: &Connection,
    claims: Option<&Claims>,
    name: &str,
    description: &str,
    items: &[String],
) -> Result<CriteriaList> {
    let claims = require_auth(claims)?;
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("criteria list name is required".into()));
    }
    let items: Vec<String> = items
        .iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect();
    if items.is_empty() {
        return Err(Error::InvalidInput("criteria list needs at least one item".into()));
    }
    let list = CriteriaList {
        list_id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        description: description.to_string(),
        items,
        owner_id: claims.user_id.clone(),
        created_at: now_timestamp(),
    };
    conn.execute(
        "INSERT INTO criteria_lists (list_id, name, description, items_json, owner_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            list.list_id,
            list.name,
            list.description,
            serde_json::to_string(&list.items)?,
            list.owner_id,
            list.created_at,
        ],
    )?;
    Ok(list)
}

fn map_criteria(row: &Row<'_>) -> rusqlite::Result<(CriteriaList, String)> {
    Ok((
        CriteriaList {
            list_id: row.get("list_id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            items: Vec::new(),
            owner_id: row.get("owner_id")?,
            created_at: row.get("created_at")?,
        },
        row.get("items_json")?,
    ))
}

fn finish_criteria((mut list, items): (CriteriaList, String)) -> Result<CriteriaList> {
    list.items = serde_json::from_str(&items)?;
    Ok(list)
}

pub fn get_criteria_list(conn: &Connection, list_id: &str) -> Result<CriteriaList> {
    let raw = conn
        .query_row(
            "SELECT * FROM criteria_lists WHERE list_id = ?1",
            params![list_id],
            map_criteria,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("criteria list {list_id}")))?;
    finish_criteria(raw)
}

pub fn list_criteria_lists(conn: &Connection) -> Result<Vec<CriteriaList>> {
    let mut stmt = conn.prepare("SELECT * FROM criteria_lists ORDER BY created_at, name")?;
    let rows = stmt.query_map([], map_criteria)?;
    rows.map(|raw| finish_criteria(raw?)).collect()
}
