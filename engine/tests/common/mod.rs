#![allow(dead_code)]

use horostracker::cancel::CancelToken;
use horostracker::collaborators::{Claims, InMemoryNodeStore, InMemoryUserStore, Node, Role, User};
use horostracker::config::Config;
use horostracker::lm_client::LmClient;
use horostracker::model_adapters::{extract_json, ApiStyle, CallError, LmRequest, LmResponse, ProviderAdapter};
use horostracker::platform::Platform;
use horostracker::store;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Answers `<model>: <user prompt>` and counts calls.
pub struct EchoProvider {
    name: String,
    models: Vec<String>,
    calls: AtomicUsize,
}

impl EchoProvider {
    pub fn new(name: &str, models: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProviderAdapter for EchoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn api_style(&self) -> ApiStyle {
        ApiStyle::OpenAiCompatible
    }

    fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn complete(&self, request: &LmRequest, model: &str, _cancel: &CancelToken) -> Result<LmResponse, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = format!("{model}: {}", request.user_prompt());
        Ok(LmResponse {
            provider: self.name.clone(),
            model: model.to_string(),
            parsed: if request.json { extract_json(&content) } else { None },
            tokens_in: request.user_prompt().split_whitespace().count() as u64,
            tokens_out: content.split_whitespace().count() as u64,
            content,
            latency_ms: 1,
            finish_reason: "stop".to_string(),
        })
    }
}

/// A platform over a file-backed database in a scratch directory. The
/// directory must outlive the platform.
pub struct Harness {
    pub dir: TempDir,
    pub platform: Platform,
}

pub fn harness(providers: &[Arc<EchoProvider>], users: Vec<User>, nodes: Vec<Node>) -> anyhow::Result<Harness> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        database_path: dir.path().join("engine.sqlite"),
        ..Config::default()
    };
    let pool = store::open_pool(&config.database_path)?;
    let client = LmClient::new(
        providers
            .iter()
            .map(|p| p.clone() as Arc<dyn ProviderAdapter>)
            .collect(),
    );
    let platform = Platform::with_client(
        pool,
        client,
        config,
        Arc::new(InMemoryNodeStore::new(nodes)),
        Arc::new(InMemoryUserStore::new(users)),
    );
    Ok(Harness { dir, platform })
}

pub fn claims(user_id: &str, role: Role) -> Claims {
    Claims::new(user_id, user_id, role)
}

pub fn user(id: &str, role: Role) -> User {
    User {
        id: id.to_string(),
        handle: id.to_string(),
        role,
        credits: 100,
    }
}

pub fn node(id: &str, body: &str) -> Node {
    Node {
        id: id.to_string(),
        node_type: "claim".to_string(),
        body: body.to_string(),
        author_id: "author".to_string(),
        metadata: serde_json::Value::Null,
        created_at: horostracker::now_timestamp(),
        tags: Vec::new(),
        score: None,
    }
}
