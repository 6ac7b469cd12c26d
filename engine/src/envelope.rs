// engine/src/envelope.rs
//!
//! Envelope router: tracks one content piece on its way to a set of
//! delivery targets.
//!
//! Envelope status moves `pending -> dispatched -> processing` and ends in
//! `delivered`, `partial` or `failed` once every target is terminal. Any
//! non-terminal envelope past `expires_at` becomes `expired`. Target counts
//! on the envelope row are maintained by triggers; every write runs in an
//! `IMMEDIATE` transaction so writers to one envelope serialize.

use crate::collaborators::{require_auth, Claims, Role, UserStore};
use crate::{format_timestamp, parse_timestamp, sha256_hex, DbPool, Error, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Horostracker,
    Witheout,
    Api,
    Mcp,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Horostracker => "horostracker",
            SourceType::Witheout => "witheout",
            SourceType::Api => "api",
            SourceType::Mcp => "mcp",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "horostracker" => Ok(SourceType::Horostracker),
            "witheout" => Ok(SourceType::Witheout),
            "api" => Ok(SourceType::Api),
            "mcp" => Ok(SourceType::Mcp),
            other => Err(Error::InvalidInput(format!("unknown source type '{other}'"))),
        }
    }

    fn allows_anonymous(&self) -> bool {
        matches!(self, SourceType::Witheout | SourceType::Api)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Horostracker,
    GoogleDrive,
    Webhook,
    Email,
    S3,
    Ipfs,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Horostracker => "horostracker",
            TargetType::GoogleDrive => "googledrive",
            TargetType::Webhook => "webhook",
            TargetType::Email => "email",
            TargetType::S3 => "s3",
            TargetType::Ipfs => "ipfs",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "horostracker" => Ok(TargetType::Horostracker),
            "googledrive" => Ok(TargetType::GoogleDrive),
            "webhook" => Ok(TargetType::Webhook),
            "email" => Ok(TargetType::Email),
            "s3" => Ok(TargetType::S3),
            "ipfs" => Ok(TargetType::Ipfs),
            other => Err(Error::InvalidInput(format!("unknown target type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Pending,
    Dispatched,
    Processing,
    Delivered,
    Partial,
    Failed,
    Expired,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Pending => "pending",
            EnvelopeStatus::Dispatched => "dispatched",
            EnvelopeStatus::Processing => "processing",
            EnvelopeStatus::Delivered => "delivered",
            EnvelopeStatus::Partial => "partial",
            EnvelopeStatus::Failed => "failed",
            EnvelopeStatus::Expired => "expired",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(EnvelopeStatus::Pending),
            "dispatched" => Ok(EnvelopeStatus::Dispatched),
            "processing" => Ok(EnvelopeStatus::Processing),
            "delivered" => Ok(EnvelopeStatus::Delivered),
            "partial" => Ok(EnvelopeStatus::Partial),
            "failed" => Ok(EnvelopeStatus::Failed),
            "expired" => Ok(EnvelopeStatus::Expired),
            other => Err(Error::Internal(format!("unknown envelope status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnvelopeStatus::Delivered | EnvelopeStatus::Partial | EnvelopeStatus::Failed | EnvelopeStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Pending,
    Delivered,
    Failed,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Pending => "pending",
            TargetState::Delivered => "delivered",
            TargetState::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(TargetState::Pending),
            "delivered" => Ok(TargetState::Delivered),
            "failed" => Ok(TargetState::Failed),
            other => Err(Error::Internal(format!("unknown target state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub envelope_id: String,
    pub target_type: TargetType,
    pub target_config: Value,
    pub state: TargetState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub batch_id: Option<String>,
    pub source_type: SourceType,
    /// `None` while the envelope is anonymous and unclaimed.
    pub source_user_id: Option<String>,
    pub source_node_id: Option<String>,
    pub source_callback: Option<String>,
    pub piece_hash: String,
    pub ttl_minutes: i64,
    pub status: EnvelopeStatus,
    pub target_count: u32,
    pub delivered_count: u32,
    pub failed_count: u32,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: String,
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTarget {
    pub target_type: TargetType,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEnvelope {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub source_type: SourceType,
    #[serde(default)]
    pub source_node_id: Option<String>,
    #[serde(default)]
    pub source_callback: Option<String>,
    /// The content being routed; only its SHA-256 is stored.
    pub piece: String,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
    pub targets: Vec<NewTarget>,
}

/// The unauthenticated view of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeStatusView {
    pub status: EnvelopeStatus,
    pub target_count: u32,
    pub delivered_count: u32,
}

type RawEnvelope = (Envelope, String, String);

fn map_envelope(row: &Row<'_>) -> rusqlite::Result<RawEnvelope> {
    Ok((
        Envelope {
            id: row.get("id")?,
            batch_id: row.get("batch_id")?,
            source_type: SourceType::Api,
            source_user_id: row.get("source_user_id")?,
            source_node_id: row.get("source_node_id")?,
            source_callback: row.get("source_callback")?,
            piece_hash: row.get("piece_hash")?,
            ttl_minutes: row.get("ttl_minutes")?,
            status: EnvelopeStatus::Pending,
            target_count: row.get("target_count")?,
            delivered_count: row.get("delivered_count")?,
            failed_count: row.get("failed_count")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            expires_at: row.get("expires_at")?,
            targets: Vec::new(),
        },
        row.get("source_type")?,
        row.get("status")?,
    ))
}

type RawTarget = (Target, String, String, String);

fn map_target(row: &Row<'_>) -> rusqlite::Result<RawTarget> {
    Ok((
        Target {
            id: row.get("id")?,
            envelope_id: row.get("envelope_id")?,
            target_type: TargetType::Horostracker,
            target_config: Value::Null,
            state: TargetState::Pending,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            error: row.get("error")?,
            updated_at: row.get("updated_at")?,
        },
        row.get("target_type")?,
        row.get("target_config")?,
        row.get("state")?,
    ))
}

fn load_targets(conn: &Connection, envelope_id: &str) -> Result<Vec<Target>> {
    let mut stmt = conn.prepare("SELECT * FROM envelope_targets WHERE envelope_id = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![envelope_id], map_target)?;
    let mut targets = Vec::new();
    for raw in rows {
        let (mut target, target_type, config, state) = raw?;
        target.target_type = TargetType::parse(&target_type)?;
        target.target_config = serde_json::from_str(&config)?;
        target.state = TargetState::parse(&state)?;
        targets.push(target);
    }
    Ok(targets)
}

fn load(conn: &Connection, id: &str) -> Result<Envelope> {
    let (mut envelope, source_type, status) = conn
        .query_row("SELECT * FROM envelopes WHERE id = ?1", params![id], map_envelope)
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("envelope {id}")))?;
    envelope.source_type = SourceType::parse(&source_type)?;
    envelope.status = EnvelopeStatus::parse(&status)?;
    envelope.targets = load_targets(conn, id)?;
    Ok(envelope)
}

fn is_overdue(envelope: &Envelope, now: DateTime<Utc>) -> Result<bool> {
    Ok(!envelope.status.is_terminal() && now > parse_timestamp(&envelope.expires_at)?)
}

fn set_status(conn: &Connection, id: &str, status: EnvelopeStatus, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE envelopes SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), format_timestamp(now), id],
    )?;
    info!(envelope_id = %id, status = status.as_str(), "envelope status changed");
    Ok(())
}

pub fn create_envelope(conn: &mut Connection, claims: Option<&Claims>, new: &NewEnvelope) -> Result<Envelope> {
    let owner = claims.filter(|c| c.role != Role::Anon).map(|c| c.user_id.clone());
    if owner.is_none() && !new.source_type.allows_anonymous() {
        return Err(Error::Unauthorized(format!(
            "anonymous envelopes cannot come from '{}'",
            new.source_type.as_str()
        )));
    }
    if new.targets.is_empty() {
        return Err(Error::InvalidInput("envelope needs at least one target".into()));
    }
    let ttl_minutes = new.ttl_minutes.unwrap_or(DEFAULT_TTL_MINUTES);
    if ttl_minutes <= 0 {
        return Err(Error::InvalidInput("ttl_minutes must be positive".into()));
    }
    if new.piece.is_empty() {
        return Err(Error::InvalidInput("piece is empty".into()));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let created_at = format_timestamp(now);
    let expires_at = format_timestamp(now + Duration::minutes(ttl_minutes));
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO envelopes (id, batch_id, source_type, source_user_id, source_node_id,
            source_callback, piece_hash, ttl_minutes, status, created_at, updated_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9, ?10)",
        params![
            id,
            new.batch_id,
            new.source_type.as_str(),
            owner,
            new.source_node_id,
            new.source_callback,
            sha256_hex(new.piece.as_bytes()),
            ttl_minutes,
            created_at,
            expires_at,
        ],
    )?;
    for target in &new.targets {
        let config = if target.config.is_null() {
            Value::Object(Default::default())
        } else {
            target.config.clone()
        };
        tx.execute(
            "INSERT INTO envelope_targets (id, envelope_id, target_type, target_config, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                Uuid::new_v4().to_string(),
                id,
                target.target_type.as_str(),
                config.to_string(),
                created_at,
            ],
        )?;
    }
    let envelope = load(&tx, &id)?;
    tx.commit()?;
    info!(
        envelope_id = %id,
        source = new.source_type.as_str(),
        anonymous = envelope.source_user_id.is_none(),
        targets = envelope.target_count,
        "envelope created"
    );
    Ok(envelope)
}

/// Owner view. Unclaimed envelopes are visible to anyone holding the id.
pub fn get_envelope(conn: &Connection, claims: Option<&Claims>, id: &str) -> Result<Envelope> {
    let claims = require_auth(claims)?;
    let envelope = load(conn, id)?;
    match &envelope.source_user_id {
        Some(owner) if owner != &claims.user_id && !claims.is_operator() => {
            Err(Error::Forbidden("not the envelope owner".into()))
        }
        _ => Ok(envelope),
    }
}

pub fn get_status(conn: &Connection, id: &str) -> Result<EnvelopeStatusView> {
    get_status_at(conn, id, Utc::now())
}

/// Reports an overdue envelope as expired without waiting for the sweep.
pub fn get_status_at(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<EnvelopeStatusView> {
    let envelope = load(conn, id)?;
    let status = if is_overdue(&envelope, now)? {
        EnvelopeStatus::Expired
    } else {
        envelope.status
    };
    Ok(EnvelopeStatusView {
        status,
        target_count: envelope.target_count,
        delivered_count: envelope.delivered_count,
    })
}

/// Binds an anonymous envelope to the caller.
pub fn claim(conn: &mut Connection, users: &dyn UserStore, claims: Option<&Claims>, id: &str) -> Result<Envelope> {
    let claims = require_auth(claims)?;
    if users.get_user_by_id(&claims.user_id)?.is_none() {
        return Err(Error::NotFound(format!("user {}", claims.user_id)));
    }

    let now = Utc::now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let envelope = load(&tx, id)?;
    if envelope.status == EnvelopeStatus::Expired || is_overdue(&envelope, now)? {
        return Err(Error::Conflict("envelope has expired".into()));
    }
    if envelope.source_user_id.is_some() {
        return Err(Error::Conflict("envelope is already claimed".into()));
    }
    tx.execute(
        "UPDATE envelopes SET source_user_id = ?1, updated_at = ?2 WHERE id = ?3 AND source_user_id IS NULL",
        params![claims.user_id, format_timestamp(now), id],
    )?;
    let envelope = load(&tx, id)?;
    tx.commit()?;
    info!(envelope_id = %id, user_id = %claims.user_id, "envelope claimed");
    Ok(envelope)
}

/// Moves an envelope from `from` to `to`. An overdue envelope is expired
/// instead and the move is refused.
fn advance(conn: &mut Connection, id: &str, from: EnvelopeStatus, to: EnvelopeStatus) -> Result<Envelope> {
    let now = Utc::now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let envelope = load(&tx, id)?;
    if is_overdue(&envelope, now)? {
        set_status(&tx, id, EnvelopeStatus::Expired, now)?;
        tx.commit()?;
        return Err(Error::Conflict("envelope has expired".into()));
    }
    if envelope.status != from {
        return Err(Error::Conflict(format!(
            "envelope is {}, expected {}",
            envelope.status.as_str(),
            from.as_str()
        )));
    }
    set_status(&tx, id, to, now)?;
    let envelope = load(&tx, id)?;
    tx.commit()?;
    Ok(envelope)
}

pub fn mark_dispatched(conn: &mut Connection, id: &str) -> Result<Envelope> {
    advance(conn, id, EnvelopeStatus::Pending, EnvelopeStatus::Dispatched)
}

pub fn begin_processing(conn: &mut Connection, id: &str) -> Result<Envelope> {
    advance(conn, id, EnvelopeStatus::Dispatched, EnvelopeStatus::Processing)
}

/// Final status once no target is pending, from the trigger-maintained
/// counts.
fn settle(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<()> {
    let (target_count, delivered, failed): (u32, u32, u32) = conn.query_row(
        "SELECT target_count, delivered_count, failed_count FROM envelopes WHERE id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    if delivered + failed < target_count {
        return Ok(());
    }
    let status = if failed == 0 {
        EnvelopeStatus::Delivered
    } else if delivered > 0 {
        EnvelopeStatus::Partial
    } else {
        EnvelopeStatus::Failed
    };
    set_status(conn, id, status, now)
}

/// Loads the envelope and the pending target for a target transition.
fn target_for_update(conn: &Connection, envelope_id: &str, target_id: &str, now: DateTime<Utc>) -> Result<(Envelope, Target)> {
    let envelope = load(conn, envelope_id)?;
    if envelope.status != EnvelopeStatus::Processing {
        return Err(Error::Conflict(format!(
            "envelope is {}, not processing",
            envelope.status.as_str()
        )));
    }
    if is_overdue(&envelope, now)? {
        return Err(Error::Conflict("envelope has expired".into()));
    }
    let target = envelope
        .targets
        .iter()
        .find(|t| t.id == target_id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("target {target_id} of envelope {envelope_id}")))?;
    if target.state != TargetState::Pending {
        return Err(Error::Conflict(format!("target is already {}", target.state.as_str())));
    }
    Ok((envelope, target))
}

pub fn deliver_target(conn: &mut Connection, envelope_id: &str, target_id: &str) -> Result<Envelope> {
    let now = Utc::now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    target_for_update(&tx, envelope_id, target_id, now)?;
    tx.execute(
        "UPDATE envelope_targets SET state = 'delivered', attempts = attempts + 1, error = NULL, updated_at = ?1
         WHERE id = ?2",
        params![format_timestamp(now), target_id],
    )?;
    settle(&tx, envelope_id, now)?;
    let envelope = load(&tx, envelope_id)?;
    tx.commit()?;
    info!(envelope_id = %envelope_id, target_id = %target_id, "target delivered");
    Ok(envelope)
}

/// Records a delivery failure. A retryable failure leaves the target
/// pending until it has used `max_attempts`.
pub fn fail_target(
    conn: &mut Connection,
    envelope_id: &str,
    target_id: &str,
    error: &str,
    retryable: bool,
) -> Result<Envelope> {
    let now = Utc::now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let (_, target) = target_for_update(&tx, envelope_id, target_id, now)?;
    let attempts = target.attempts + 1;
    let state = if retryable && attempts < target.max_attempts {
        TargetState::Pending
    } else {
        TargetState::Failed
    };
    tx.execute(
        "UPDATE envelope_targets SET state = ?1, attempts = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
        params![state.as_str(), attempts, error, format_timestamp(now), target_id],
    )?;
    settle(&tx, envelope_id, now)?;
    let envelope = load(&tx, envelope_id)?;
    tx.commit()?;
    warn!(
        envelope_id = %envelope_id,
        target_id = %target_id,
        attempts,
        state = state.as_str(),
        error = %error,
        "target delivery failed"
    );
    Ok(envelope)
}

/// Sweep: marks every overdue non-terminal envelope expired.
pub fn expire_envelopes(pool: &DbPool) -> Result<usize> {
    let mut conn = pool.get()?;
    expire_envelopes_at(&mut conn, Utc::now())
}

pub fn expire_envelopes_at(conn: &mut Connection, now: DateTime<Utc>) -> Result<usize> {
    let stamp = format_timestamp(now);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let expired = tx.execute(
        "UPDATE envelopes SET status = 'expired', updated_at = ?1
         WHERE status IN ('pending', 'dispatched', 'processing') AND expires_at < ?1",
        params![stamp],
    )?;
    tx.commit()?;
    if expired > 0 {
        info!(expired, "envelopes expired");
    }
    Ok(expired)
}
