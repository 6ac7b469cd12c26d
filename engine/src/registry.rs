// engine/src/registry.rs
//!
//! Provider registry: self-registered LM providers, their models and health,
//! merged with the providers configured on the LM client.
//!
//! Model-only lookups go to configured providers first (in configuration
//! order), then to active registered providers in registration order.

use crate::collaborators::{require_auth, Claims, Role};
use crate::lm_client::LmClient;
use crate::model_adapters::{ApiStyle, HttpAdapter, ProviderAdapter};
use crate::store;
use crate::{format_timestamp, now_timestamp, parse_timestamp, Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const REGISTERED_TIMEOUT: Duration = Duration::from_secs(120);
const JSON_MODE_CAPABILITY: &str = "json_mode";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub api_style: ApiStyle,
    pub models: Vec<String>,
    pub capabilities: Vec<String>,
    pub resolution_space: Option<String>,
    pub resolution_criteria: Option<String>,
    pub owner_id: Option<String>,
    pub is_active: bool,
    pub last_seen_at: Option<String>,
    pub created_at: Option<String>,
    /// Comes from the LM client configuration rather than a registration.
    pub configured: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProvider {
    pub name: String,
    pub endpoint: String,
    pub api_style: Option<ApiStyle>,
    pub models: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resolution_space: Option<String>,
    #[serde(default)]
    pub resolution_criteria: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_id: String,
    pub provider: String,
    pub model_name: String,
    pub display_name: Option<String>,
    pub capabilities: Vec<String>,
    pub owner_id: Option<String>,
    pub is_available: bool,
}

/// A model, optionally pinned to one provider. When two providers carry the
/// same model, callers must pin the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ModelTarget {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: None,
        }
    }

    pub fn on(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: Some(provider.into()),
        }
    }
}

/// A callable provider for one model.
#[derive(Clone)]
pub struct Resolved {
    pub provider: String,
    pub model: String,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish()
    }
}

pub fn model_id(provider: &str, model_name: &str) -> String {
    format!("{provider}/{model_name}")
}

type RawProvider = (Provider, String, String, String);

fn map_provider(row: &Row<'_>) -> rusqlite::Result<RawProvider> {
    Ok((
        Provider {
            id: row.get("id")?,
            name: row.get("name")?,
            endpoint: row.get("endpoint")?,
            api_style: ApiStyle::OpenAiCompatible,
            models: Vec::new(),
            capabilities: Vec::new(),
            resolution_space: row.get("resolution_space")?,
            resolution_criteria: row.get("resolution_criteria")?,
            owner_id: row.get("owner_id")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            last_seen_at: row.get("last_seen_at")?,
            created_at: row.get("created_at")?,
            configured: false,
        },
        row.get("api_style")?,
        row.get("models_json")?,
        row.get("capabilities_json")?,
    ))
}

fn finish_provider(raw: RawProvider) -> Result<Provider> {
    let (mut provider, api_style, models, capabilities) = raw;
    provider.api_style = ApiStyle::parse(&api_style)
        .ok_or_else(|| Error::Internal(format!("provider {} has unknown api style '{api_style}'", provider.name)))?;
    provider.models = serde_json::from_str(&models)
        .map_err(|e| Error::Internal(format!("provider {} has unreadable models: {e}", provider.name)))?;
    provider.capabilities = serde_json::from_str(&capabilities)
        .map_err(|e| Error::Internal(format!("provider {} has unreadable capabilities: {e}", provider.name)))?;
    Ok(provider)
}

const PROVIDER_COLUMNS: &str = "id, name, endpoint, api_style, models_json, capabilities_json,
    resolution_space, resolution_criteria, owner_id, is_active, last_seen_at, created_at";

fn configured_provider(adapter: &dyn ProviderAdapter) -> Provider {
    let mut capabilities = Vec::new();
    if adapter.supports_json_mode() {
        capabilities.push(JSON_MODE_CAPABILITY.to_string());
    }
    Provider {
        id: format!("config:{}", adapter.name()),
        name: adapter.name().to_string(),
        endpoint: String::new(),
        api_style: adapter.api_style(),
        models: adapter.models(),
        capabilities,
        resolution_space: None,
        resolution_criteria: None,
        owner_id: None,
        is_active: true,
        last_seen_at: None,
        created_at: None,
        configured: true,
    }
}

pub fn register(conn: &Connection, claims: Option<&Claims>, new: &NewProvider) -> Result<Provider> {
    let claims = require_auth(claims)?;
    if !matches!(claims.role, Role::Provider | Role::Operator) {
        return Err(Error::Forbidden("only providers and operators may register".into()));
    }
    let name = new.name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("provider name is required".into()));
    }
    if new.endpoint.trim().is_empty() {
        return Err(Error::InvalidInput("provider endpoint is required".into()));
    }
    if new.models.is_empty() {
        return Err(Error::InvalidInput("a provider must list at least one model".into()));
    }
    let mut seen = HashSet::new();
    for model in &new.models {
        if model.trim().is_empty() {
            return Err(Error::InvalidInput("model names must not be empty".into()));
        }
        if !seen.insert(model.as_str()) {
            return Err(Error::InvalidInput(format!("model '{model}' listed twice")));
        }
    }

    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();
    let api_style = new.api_style.unwrap_or(ApiStyle::OpenAiCompatible);
    let tx = store::write_tx(conn)?;
    tx.execute(
        "INSERT INTO providers (id, name, endpoint, api_style, models_json, capabilities_json,
            resolution_space, resolution_criteria, owner_id, is_active, last_seen_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
        params![
            id,
            name,
            new.endpoint.trim(),
            api_style.as_str(),
            serde_json::to_string(&new.models)?,
            serde_json::to_string(&new.capabilities)?,
            new.resolution_space,
            new.resolution_criteria,
            claims.user_id,
            now,
        ],
    )
    .map_err(|e| Error::conflict_on_constraint(e, format!("provider '{name}' already registered")))?;

    for model in &new.models {
        tx.execute(
            "INSERT INTO models (model_id, provider, model_name, capabilities_json, owner_id, is_available, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                model_id(name, model),
                name,
                model,
                serde_json::to_string(&new.capabilities)?,
                claims.user_id,
                now,
            ],
        )
        .map_err(|e| Error::conflict_on_constraint(e, format!("model '{model}' already registered")))?;
    }
    tx.commit()?;
    info!(provider = %name, models = new.models.len(), "provider registered");
    get(conn, &id)
}

pub fn get(conn: &Connection, id: &str) -> Result<Provider> {
    let raw = conn
        .query_row(
            &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1"),
            params![id],
            map_provider,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("provider {id}")))?;
    finish_provider(raw)
}

pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<Provider>> {
    conn.query_row(
        &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE name = ?1"),
        params![name],
        map_provider,
    )
    .optional()?
    .map(finish_provider)
    .transpose()
}

fn registered(conn: &Connection) -> Result<Vec<Provider>> {
    let mut stmt = conn.prepare(&format!("SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY seq"))?;
    let rows = stmt.query_map([], map_provider)?;
    rows.map(|raw| finish_provider(raw?)).collect()
}

/// Configured providers followed by registered ones. A registration with
/// the same name as a configured provider replaces it in the listing.
pub fn list(conn: &Connection, client: &LmClient) -> Result<Vec<Provider>> {
    let mut merged: Vec<Provider> = client
        .configured_providers()
        .iter()
        .map(|a| configured_provider(a.as_ref()))
        .collect();
    for provider in registered(conn)? {
        match merged.iter_mut().find(|p| p.name == provider.name) {
            Some(slot) => *slot = provider,
            None => merged.push(provider),
        }
    }
    Ok(merged)
}

/// Records liveness. The returned `last_seen_at` is strictly greater than
/// the previous one even when two heartbeats land in the same microsecond.
pub fn heartbeat(conn: &Connection, id: &str) -> Result<String> {
    let previous = get(conn, id)?.last_seen_at;
    let mut now = Utc::now();
    if let Some(prev) = previous.as_deref().map(parse_timestamp).transpose()? {
        if now <= prev {
            now = prev + ChronoDuration::microseconds(1);
        }
    }
    let seen = format_timestamp(now);
    conn.execute(
        "UPDATE providers SET last_seen_at = ?1, is_active = 1 WHERE id = ?2",
        params![seen, id],
    )?;
    Ok(seen)
}

/// Flips registered providers dormant when their heartbeat is older than
/// `stale_after`. Returns how many went dormant.
pub fn refresh_activity(conn: &Connection, stale_after: Duration, now: DateTime<Utc>) -> Result<usize> {
    let stale = ChronoDuration::from_std(stale_after)
        .map_err(|e| Error::InvalidInput(format!("stale threshold out of range: {e}")))?;
    let cutoff = format_timestamp(now - stale);
    let changed = conn.execute(
        "UPDATE providers SET is_active = 0 WHERE is_active = 1 AND last_seen_at < ?1",
        params![cutoff],
    )?;
    if changed > 0 {
        info!(count = changed, "providers marked dormant");
    }
    Ok(changed)
}

fn adapter_for_row(provider: &Provider) -> Arc<dyn ProviderAdapter> {
    Arc::new(HttpAdapter::new(
        provider.name.clone(),
        provider.api_style,
        provider.endpoint.clone(),
        None,
        provider.models.clone(),
        REGISTERED_TIMEOUT,
        provider.capabilities.iter().any(|c| c == JSON_MODE_CAPABILITY),
    ))
}

/// First active provider carrying `model_name`.
pub fn resolve(conn: &Connection, client: &LmClient, model_name: &str) -> Result<Resolved> {
    if let Some(adapter) = client.adapter_for_model(model_name) {
        return Ok(Resolved {
            provider: adapter.name().to_string(),
            model: model_name.to_string(),
            adapter,
        });
    }
    for provider in registered(conn)? {
        if provider.is_active && provider.models.iter().any(|m| m == model_name) {
            return Ok(Resolved {
                provider: provider.name.clone(),
                model: model_name.to_string(),
                adapter: adapter_for_row(&provider),
            });
        }
    }
    Err(Error::InvalidInput(format!("no active provider carries model '{model_name}'")))
}

/// Resolves a possibly provider-pinned target. Configured adapters take
/// precedence over a registration of the same name.
pub fn resolve_target(conn: &Connection, client: &LmClient, target: &ModelTarget) -> Result<Resolved> {
    let Some(provider) = target.provider.as_deref() else {
        return resolve(conn, client, &target.model);
    };
    let adapter = match client.adapter(provider) {
        Some(adapter) => adapter,
        None => {
            let row = get_by_name(conn, provider)?
                .ok_or_else(|| Error::InvalidInput(format!("unknown provider '{provider}'")))?;
            if !row.is_active {
                return Err(Error::ProviderUnavailable(format!("provider '{provider}' is dormant")));
            }
            adapter_for_row(&row)
        }
    };
    if !adapter.supports(&target.model) {
        return Err(Error::InvalidInput(format!(
            "provider '{provider}' does not carry model '{}'",
            target.model
        )));
    }
    Ok(Resolved {
        provider: provider.to_string(),
        model: target.model.clone(),
        adapter,
    })
}

fn map_model(row: &Row<'_>) -> rusqlite::Result<(ModelInfo, String)> {
    Ok((
        ModelInfo {
            model_id: row.get("model_id")?,
            provider: row.get("provider")?,
            model_name: row.get("model_name")?,
            display_name: row.get("display_name")?,
            capabilities: Vec::new(),
            owner_id: row.get("owner_id")?,
            is_available: row.get::<_, i64>("is_available")? != 0,
        },
        row.get("capabilities_json")?,
    ))
}

fn finish_model((mut model, capabilities): (ModelInfo, String)) -> Result<ModelInfo> {
    model.capabilities = serde_json::from_str(&capabilities)
        .map_err(|e| Error::Internal(format!("model {} has unreadable capabilities: {e}", model.model_id)))?;
    Ok(model)
}

/// Model discovery over configured and registered providers. Models of
/// dormant registered providers are reported unavailable.
pub fn list_models(conn: &Connection, client: &LmClient) -> Result<Vec<ModelInfo>> {
    let mut models = Vec::new();
    for adapter in client.configured_providers() {
        for name in adapter.models() {
            models.push(ModelInfo {
                model_id: model_id(adapter.name(), &name),
                provider: adapter.name().to_string(),
                model_name: name,
                display_name: None,
                capabilities: Vec::new(),
                owner_id: None,
                is_available: true,
            });
        }
    }
    let mut stmt = conn.prepare(
        "SELECT m.model_id, m.provider, m.model_name, m.display_name, m.capabilities_json,
                m.owner_id, m.is_available * p.is_active AS is_available
         FROM models m JOIN providers p ON p.name = m.provider
         ORDER BY p.seq, m.model_name",
    )?;
    let rows = stmt.query_map([], map_model)?;
    for raw in rows {
        let model = finish_model(raw?)?;
        if !models.iter().any(|m| m.model_id == model.model_id) {
            models.push(model);
        }
    }
    Ok(models)
}

/// True when `user_id` registered a model with this name.
pub fn owns_model(conn: &Connection, user_id: &str, model_name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM models WHERE model_name = ?1 AND owner_id = ?2",
        params![model_name, user_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn set_model_availability(
    conn: &Connection,
    claims: Option<&Claims>,
    model_id: &str,
    available: bool,
) -> Result<()> {
    let claims = require_auth(claims)?;
    let owner: Option<Option<String>> = conn
        .query_row(
            "SELECT owner_id FROM models WHERE model_id = ?1",
            params![model_id],
            |row| row.get(0),
        )
        .optional()?;
    let owner = owner.ok_or_else(|| Error::NotFound(format!("model {model_id}")))?;
    if !claims.is_operator() && owner.as_deref() != Some(claims.user_id.as_str()) {
        return Err(Error::Forbidden("only the model owner or an operator may change availability".into()));
    }
    conn.execute(
        "UPDATE models SET is_available = ?1 WHERE model_id = ?2",
        params![available as i64, model_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;
    use crate::test_support::{claims, client as scripted_client, ScriptedAdapter};

    fn new_provider(name: &str, models: &[&str]) -> NewProvider {
        NewProvider {
            name: name.into(),
            endpoint: format!("http://{name}.local/v1"),
            api_style: Some(ApiStyle::OpenAiCompatible),
            models: models.iter().map(|m| m.to_string()).collect(),
            ..NewProvider::default()
        }
    }

    #[test]
    fn register_then_list_and_heartbeat() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        let owner = claims("p1", Role::Provider);
        let provider = register(&conn, Some(&owner), &new_provider("alpha", &["m1"]))?;
        assert_eq!(provider.owner_id.as_deref(), Some("p1"));

        let listed = list(&conn, &LmClient::default())?;
        assert!(listed.iter().any(|p| p.id == provider.id));

        let first = heartbeat(&conn, &provider.id)?;
        let second = heartbeat(&conn, &provider.id)?;
        assert!(second > first);
        assert!(first > provider.last_seen_at.unwrap_or_default());
        Ok(())
    }

    #[test]
    fn corrupt_registry_rows_are_reported_not_defaulted() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        let owner = claims("p1", Role::Provider);
        let provider = register(&conn, Some(&owner), &new_provider("alpha", &["m1"]))?;

        conn.execute("UPDATE providers SET api_style = 'telegraph' WHERE id = ?1", params![provider.id])?;
        assert_eq!(get(&conn, &provider.id).unwrap_err().kind(), crate::ErrorKind::Internal);
        assert_eq!(get_by_name(&conn, "alpha").unwrap_err().kind(), crate::ErrorKind::Internal);
        conn.execute(
            "UPDATE providers SET api_style = 'openai-compatible', models_json = '{' WHERE id = ?1",
            params![provider.id],
        )?;
        assert_eq!(list(&conn, &LmClient::default()).unwrap_err().kind(), crate::ErrorKind::Internal);
        conn.execute("UPDATE providers SET models_json = '[\"m1\"]' WHERE id = ?1", params![provider.id])?;
        assert_eq!(get(&conn, &provider.id)?.models, ["m1"]);

        conn.execute("UPDATE models SET capabilities_json = 'json-mode' WHERE provider = 'alpha'", [])?;
        assert_eq!(list_models(&conn, &LmClient::default()).unwrap_err().kind(), crate::ErrorKind::Internal);
        Ok(())
    }

    #[test]
    fn duplicate_name_conflicts_and_plain_users_are_refused() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        let owner = claims("p1", Role::Provider);
        register(&conn, Some(&owner), &new_provider("alpha", &["m1"]))?;
        let err = register(&conn, Some(&owner), &new_provider("alpha", &["m2"])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);

        let user = claims("u1", Role::User);
        let err = register(&conn, Some(&user), &new_provider("beta", &["m2"])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Forbidden);
        Ok(())
    }

    #[test]
    fn registration_wins_listing_but_configured_resolves_first() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        let client = scripted_client(&[Arc::new(ScriptedAdapter::new("shared", &["m1"]))]);
        let owner = claims("p1", Role::Provider);
        register(&conn, Some(&owner), &new_provider("shared", &["m1"]))?;
        register(&conn, Some(&owner), &new_provider("other", &["m1", "m9"]))?;

        let listed = list(&conn, &client)?;
        assert_eq!(listed.len(), 2);
        assert!(!listed[0].configured);
        assert_eq!(listed[0].name, "shared");

        let resolved = resolve(&conn, &client, "m1")?;
        assert_eq!(resolved.provider, "shared");
        let resolved = resolve(&conn, &client, "m9")?;
        assert_eq!(resolved.provider, "other");
        assert!(resolve(&conn, &client, "missing").is_err());
        Ok(())
    }

    #[test]
    fn stale_providers_go_dormant_and_heartbeat_revives() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        let owner = claims("p1", Role::Provider);
        let provider = register(&conn, Some(&owner), &new_provider("alpha", &["m1"]))?;

        let later = Utc::now() + ChronoDuration::seconds(600);
        assert_eq!(refresh_activity(&conn, Duration::from_secs(300), later)?, 1);
        assert!(!get(&conn, &provider.id)?.is_active);
        let client = LmClient::default();
        assert!(resolve(&conn, &client, "m1").is_err());
        let err = resolve_target(&conn, &client, &ModelTarget::on("alpha", "m1")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProviderUnavailable);

        heartbeat(&conn, &provider.id)?;
        assert!(get(&conn, &provider.id)?.is_active);
        assert_eq!(resolve(&conn, &client, "m1")?.provider, "alpha");
        Ok(())
    }

    #[test]
    fn model_discovery_and_availability() -> anyhow::Result<()> {
        let pool = memory_pool()?;
        let conn = pool.get()?;
        let client = scripted_client(&[Arc::new(ScriptedAdapter::new("cfg", &["c1"]))]);
        let owner = claims("p1", Role::Provider);
        register(&conn, Some(&owner), &new_provider("alpha", &["m1", "m2"]))?;

        let models = list_models(&conn, &client)?;
        let ids: Vec<_> = models.iter().map(|m| m.model_id.as_str()).collect();
        assert_eq!(ids, ["cfg/c1", "alpha/m1", "alpha/m2"]);
        assert!(owns_model(&conn, "p1", "m1")?);
        assert!(!owns_model(&conn, "someone", "m1")?);

        let stranger = claims("p2", Role::Provider);
        assert!(set_model_availability(&conn, Some(&stranger), "alpha/m1", false).is_err());
        set_model_availability(&conn, Some(&owner), "alpha/m1", false)?;
        let models = list_models(&conn, &client)?;
        let m1 = models.iter().find(|m| m.model_id == "alpha/m1").unwrap();
        assert!(!m1.is_available);
        Ok(())
    }
}
