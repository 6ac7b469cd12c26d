// engine/src/grants.rs
//!
//! Model grants: allow/deny policy per (grantee, model, step type).
//!
//! Decisions are evaluated in a fixed order and the first match wins:
//! operator deny, operator allow, group deny, group allow, role deny/allow,
//! then the implicit defaults. `Decision::explicit` separates "policy
//! forbids" from "nothing said, default allows".

use crate::collaborators::{require_operator, Claims, Role, UserStore};
use crate::lm_client::LmClient;
use crate::registry::{self, ModelInfo};
use crate::store;
use crate::{now_timestamp, Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Author,
    Validate,
    Chain,
    Fan,
    Llm,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Author => "author",
            StepType::Validate => "validate",
            StepType::Chain => "chain",
            StepType::Fan => "fan",
            StepType::Llm => "llm",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "author" => Ok(StepType::Author),
            "validate" => Ok(StepType::Validate),
            "chain" => Ok(StepType::Chain),
            "fan" => Ok(StepType::Fan),
            "llm" => Ok(StepType::Llm),
            other => Err(Error::InvalidInput(format!("unknown step type '{other}'"))),
        }
    }

    /// Roles allowed to create a step of this type.
    pub fn creatable_by(&self, role: Role) -> bool {
        match self {
            StepType::Author | StepType::Chain | StepType::Fan => role != Role::Anon,
            StepType::Validate | StepType::Llm => matches!(role, Role::Operator | Role::Provider),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GranteeType {
    Operator,
    OperatorGroup,
    Role,
}

impl GranteeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GranteeType::Operator => "operator",
            GranteeType::OperatorGroup => "operator_group",
            GranteeType::Role => "role",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "operator" => Some(GranteeType::Operator),
            "operator_group" => Some(GranteeType::OperatorGroup),
            "role" => Some(GranteeType::Role),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub explicit: bool,
}

impl Decision {
    const fn new(allowed: bool, explicit: bool) -> Self {
        Self { allowed, explicit }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grantee {
    pub grantee_type: GranteeType,
    pub grantee_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGrant {
    pub grantee: Grantee,
    pub model_id: String,
    pub step_type: StepType,
    pub effect: Effect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelGrant {
    pub grant_id: String,
    pub grantee_type: GranteeType,
    pub grantee_id: String,
    pub model_id: String,
    pub step_type: StepType,
    pub effect: Effect,
    pub created_by: String,
    pub created_at: String,
}

type RawGrant = (ModelGrant, String, String, String);

fn map_grant(row: &Row<'_>) -> rusqlite::Result<RawGrant> {
    Ok((
        ModelGrant {
            grant_id: row.get("grant_id")?,
            grantee_type: GranteeType::Role,
            grantee_id: row.get("grantee_id")?,
            model_id: row.get("model_id")?,
            step_type: StepType::Llm,
            effect: Effect::Allow,
            created_by: row.get("created_by")?,
            created_at: row.get("created_at")?,
        },
        row.get("grantee_type")?,
        row.get("step_type")?,
        row.get("effect")?,
    ))
}

fn finish_grant(raw: RawGrant) -> Result<ModelGrant> {
    let (mut grant, grantee_type, step_type, effect) = raw;
    grant.grantee_type = GranteeType::parse(&grantee_type)
        .ok_or_else(|| Error::Internal(format!("grant {} has unknown grantee type '{grantee_type}'", grant.grant_id)))?;
    grant.step_type = StepType::parse(&step_type)
        .map_err(|_| Error::Internal(format!("grant {} has unknown step type '{step_type}'", grant.grant_id)))?;
    grant.effect = match effect.as_str() {
        "allow" => Effect::Allow,
        "deny" => Effect::Deny,
        other => return Err(Error::Internal(format!("grant {} has unknown effect '{other}'", grant.grant_id))),
    };
    Ok(grant)
}

fn has_grant(
    conn: &Connection,
    grantee_type: GranteeType,
    grantee_ids: &[String],
    model: &str,
    step_type: StepType,
    effect: Effect,
) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM model_grants
         WHERE grantee_type = ?1 AND grantee_id = ?2 AND model_id = ?3
           AND step_type = ?4 AND effect = ?5
         LIMIT 1",
    )?;
    for grantee_id in grantee_ids {
        let hit = stmt
            .query_row(
                params![
                    grantee_type.as_str(),
                    grantee_id,
                    model,
                    step_type.as_str(),
                    effect.as_str()
                ],
                |_| Ok(()),
            )
            .optional()?;
        if hit.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Evaluates the grant rules for one (user, role, model, step type).
pub fn check(conn: &Connection, user_id: &str, role: Role, model: &str, step_type: StepType) -> Result<Decision> {
    let user = [user_id.to_string()];
    if has_grant(conn, GranteeType::Operator, &user, model, step_type, Effect::Deny)? {
        return Ok(Decision::new(false, true));
    }
    if has_grant(conn, GranteeType::Operator, &user, model, step_type, Effect::Allow)? {
        return Ok(Decision::new(true, true));
    }

    let groups = groups_for_user(conn, user_id)?;
    if has_grant(conn, GranteeType::OperatorGroup, &groups, model, step_type, Effect::Deny)? {
        return Ok(Decision::new(false, true));
    }
    if has_grant(conn, GranteeType::OperatorGroup, &groups, model, step_type, Effect::Allow)? {
        return Ok(Decision::new(true, true));
    }

    let role_id = [role.as_str().to_string()];
    if has_grant(conn, GranteeType::Role, &role_id, model, step_type, Effect::Deny)? {
        return Ok(Decision::new(false, true));
    }
    if has_grant(conn, GranteeType::Role, &role_id, model, step_type, Effect::Allow)? {
        return Ok(Decision::new(true, true));
    }

    if matches!(role, Role::Operator | Role::Provider) && registry::owns_model(conn, user_id, model)? {
        return Ok(Decision::new(true, true));
    }
    if step_type != StepType::Llm {
        return Ok(Decision::new(true, true));
    }
    Ok(Decision::new(true, false))
}

/// `check` for the caller, turning an explicit denial into `Forbidden` and
/// logging a warning when only the default allows it.
pub fn enforce(conn: &Connection, claims: &Claims, model: &str, step_type: StepType) -> Result<Decision> {
    let decision = check(conn, &claims.user_id, claims.role, model, step_type)?;
    if decision.explicit && !decision.allowed {
        return Err(Error::Forbidden(format!(
            "model '{model}' is denied for {} steps",
            step_type.as_str()
        )));
    }
    if !decision.explicit {
        warn!(user_id = %claims.user_id, model = %model, step_type = step_type.as_str(), "no grant matched, allowing by default");
    }
    Ok(decision)
}

/// Available models the caller may use for `llm` steps.
pub fn list_allowed_models(conn: &Connection, client: &LmClient, claims: &Claims) -> Result<Vec<ModelInfo>> {
    let mut allowed = Vec::new();
    for model in registry::list_models(conn, client)? {
        if !model.is_available {
            continue;
        }
        if check(conn, &claims.user_id, claims.role, &model.model_name, StepType::Llm)?.allowed {
            allowed.push(model);
        }
    }
    Ok(allowed)
}

pub fn create_grant(conn: &Connection, claims: Option<&Claims>, grant: &NewGrant) -> Result<ModelGrant> {
    let claims = require_operator(claims)?;
    if grant.grantee.grantee_id.trim().is_empty() || grant.model_id.trim().is_empty() {
        return Err(Error::InvalidInput("grantee and model are required".into()));
    }
    if grant.grantee.grantee_type == GranteeType::Role {
        Role::parse(&grant.grantee.grantee_id)?;
    }
    let grant_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO model_grants (grant_id, grantee_type, grantee_id, model_id, step_type, effect, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            grant_id,
            grant.grantee.grantee_type.as_str(),
            grant.grantee.grantee_id,
            grant.model_id,
            grant.step_type.as_str(),
            grant.effect.as_str(),
            claims.user_id,
            now_timestamp(),
        ],
    )
    .map_err(|e| Error::conflict_on_constraint(e, "identical grant already exists"))?;
    info!(grant_id = %grant_id, model = %grant.model_id, effect = grant.effect.as_str(), "grant created");
    get_grant(conn, &grant_id)
}

pub fn get_grant(conn: &Connection, grant_id: &str) -> Result<ModelGrant> {
    let raw = conn
        .query_row(
            "SELECT * FROM model_grants WHERE grant_id = ?1",
            params![grant_id],
            map_grant,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("grant {grant_id}")))?;
    finish_grant(raw)
}

pub fn revoke_grant(conn: &Connection, claims: Option<&Claims>, grant_id: &str) -> Result<()> {
    require_operator(claims)?;
    let removed = conn.execute("DELETE FROM model_grants WHERE grant_id = ?1", params![grant_id])?;
    if removed == 0 {
        return Err(Error::NotFound(format!("grant {grant_id}")));
    }
    Ok(())
}

pub fn list_grants(conn: &Connection, model_id: Option<&str>) -> Result<Vec<ModelGrant>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM model_grants WHERE (?1 IS NULL OR model_id = ?1) ORDER BY created_at, grant_id",
    )?;
    let rows = stmt.query_map(params![model_id], map_grant)?;
    rows.map(|raw| finish_grant(raw?)).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkGrantRequest {
    pub models: Vec<String>,
    #[serde(default)]
    pub grant: Vec<Grantee>,
    #[serde(default)]
    pub revoke: Vec<Grantee>,
    #[serde(default)]
    pub step_type: Option<StepType>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGrantResult {
    pub granted: usize,
    pub revoked: usize,
}

/// Adds allow grants for models × grant and removes every grant for
/// models × revoke, atomically. Existing identical grants are kept.
pub fn bulk_set_grants(conn: &Connection, claims: Option<&Claims>, request: &BulkGrantRequest) -> Result<BulkGrantResult> {
    let claims = require_operator(claims)?;
    if request.models.is_empty() {
        return Err(Error::InvalidInput("bulk grant needs at least one model".into()));
    }
    let step_type = request.step_type.unwrap_or(StepType::Llm);
    let now = now_timestamp();
    let tx = store::write_tx(conn)?;
    let mut result = BulkGrantResult::default();
    for model in &request.models {
        for grantee in &request.grant {
            result.granted += tx.execute(
                "INSERT OR IGNORE INTO model_grants
                    (grant_id, grantee_type, grantee_id, model_id, step_type, effect, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'allow', ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    grantee.grantee_type.as_str(),
                    grantee.grantee_id,
                    model,
                    step_type.as_str(),
                    claims.user_id,
                    now,
                ],
            )?;
        }
        for grantee in &request.revoke {
            result.revoked += tx.execute(
                "DELETE FROM model_grants
                 WHERE grantee_type = ?1 AND grantee_id = ?2 AND model_id = ?3 AND step_type = ?4",
                params![grantee.grantee_type.as_str(), grantee.grantee_id, model, step_type.as_str()],
            )?;
        }
    }
    tx.commit()?;
    info!(granted = result.granted, revoked = result.revoked, "bulk grants applied");
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorGroup {
    pub group_id: String,
    pub provider_id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: String,
}

pub fn create_group(conn: &Connection, claims: Option<&Claims>, provider_id: &str, name: &str) -> Result<OperatorGroup> {
    let claims = require_operator(claims)?;
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("group name is required".into()));
    }
    let group = OperatorGroup {
        group_id: Uuid::new_v4().to_string(),
        provider_id: provider_id.to_string(),
        name: name.trim().to_string(),
        created_by: claims.user_id.clone(),
        created_at: now_timestamp(),
    };
    conn.execute(
        "INSERT INTO operator_groups (group_id, provider_id, name, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![group.group_id, group.provider_id, group.name, group.created_by, group.created_at],
    )
    .map_err(|e| Error::conflict_on_constraint(e, format!("group '{name}' already exists for this provider")))?;
    Ok(group)
}

/// Adds an operator user to a group.
pub fn add_member(
    conn: &Connection,
    users: &dyn UserStore,
    claims: Option<&Claims>,
    group_id: &str,
    user_id: &str,
) -> Result<()> {
    require_operator(claims)?;
    let user = users
        .get_user_by_id(user_id)?
        .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;
    if user.role != Role::Operator {
        return Err(Error::InvalidInput(format!("user {user_id} is not an operator")));
    }
    let exists: Option<String> = conn
        .query_row(
            "SELECT group_id FROM operator_groups WHERE group_id = ?1",
            params![group_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(Error::NotFound(format!("group {group_id}")));
    }
    conn.execute(
        "INSERT INTO operator_group_members (group_id, user_id, added_at) VALUES (?1, ?2, ?3)",
        params![group_id, user_id, now_timestamp()],
    )
    .map_err(|e| Error::conflict_on_constraint(e, format!("{user_id} is already a member")))?;
    Ok(())
}

pub fn remove_member(conn: &Connection, claims: Option<&Claims>, group_id: &str, user_id: &str) -> Result<()> {
    require_operator(claims)?;
    let removed = conn.execute(
        "DELETE FROM operator_group_members WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, user_id],
    )?;
    if removed == 0 {
        return Err(Error::NotFound(format!("{user_id} is not in group {group_id}")));
    }
    Ok(())
}

pub fn groups_for_user(conn: &Connection, user_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT group_id FROM operator_group_members WHERE user_id = ?1 ORDER BY group_id",
    )?;
    let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}
