//! Shared fixtures for unit tests: scripted providers and in-memory platforms.

use crate::cancel::CancelToken;
use crate::collaborators::{Claims, InMemoryNodeStore, InMemoryUserStore, Node, Role, User};
use crate::config::Config;
use crate::lm_client::LmClient;
use crate::model_adapters::{
    extract_json, ApiStyle, CallError, CallErrorKind, LmRequest, LmResponse, ProviderAdapter,
};
use crate::platform::Platform;
use crate::store::memory_pool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Reply = Box<dyn Fn(&LmRequest, &str) -> String + Send + Sync>;

/// Provider double. Replies `[model] <user prompt>` unless scripted
/// otherwise, and records every request it sees.
pub struct ScriptedAdapter {
    name: String,
    models: Vec<String>,
    failure: Option<CallErrorKind>,
    script: Mutex<VecDeque<Result<String, CallErrorKind>>>,
    reply: Option<Reply>,
    delay: Duration,
    calls: Mutex<usize>,
    requests: Mutex<Vec<LmRequest>>,
}

impl ScriptedAdapter {
    pub fn new(name: &str, models: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            failure: None,
            script: Mutex::new(VecDeque::new()),
            reply: None,
            delay: Duration::ZERO,
            calls: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str, models: &[&str], kind: CallErrorKind) -> Self {
        Self {
            failure: Some(kind),
            ..Self::new(name, models)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_reply(mut self, reply: impl Fn(&LmRequest, &str) -> String + Send + Sync + 'static) -> Self {
        self.reply = Some(Box::new(reply));
        self
    }

    /// Outcomes consumed one per call before falling back to the default.
    pub fn with_script(self, outcomes: Vec<Result<&str, CallErrorKind>>) -> Self {
        *self.script.lock().expect("lock script") = outcomes
            .into_iter()
            .map(|o| o.map(str::to_string))
            .collect();
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("lock call count")
    }

    pub fn requests(&self) -> Vec<LmRequest> {
        self.requests.lock().expect("lock requests").clone()
    }
}

impl ProviderAdapter for ScriptedAdapter {
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

    fn complete(&self, request: &LmRequest, model: &str, cancel: &CancelToken) -> Result<LmResponse, CallError> {
        *self.calls.lock().expect("lock call count") += 1;
        self.requests.lock().expect("lock requests").push(request.clone());
        if !self.delay.is_zero() && !cancel.sleep(self.delay) {
            return Err(CallError::new(&self.name, CallErrorKind::Timeout, "cancelled while waiting"));
        }

        let scripted = self.script.lock().expect("lock script").pop_front();
        let content = match scripted {
            Some(Ok(content)) => content,
            Some(Err(kind)) => return Err(CallError::new(&self.name, kind, "scripted failure")),
            None => {
                if let Some(kind) = self.failure {
                    return Err(CallError::new(&self.name, kind, "scripted failure"));
                }
                match &self.reply {
                    Some(reply) => reply(request, model),
                    None => format!("[{model}] {}", request.user_prompt()),
                }
            }
        };
        Ok(LmResponse {
            provider: self.name.clone(),
            model: model.to_string(),
            parsed: if request.json { extract_json(&content) } else { None },
            tokens_in: request.user_prompt().split_whitespace().count() as u64,
            tokens_out: content.split_whitespace().count() as u64,
            content,
            latency_ms: 0,
            finish_reason: "stop".to_string(),
        })
    }
}

pub fn claims(user_id: &str, role: Role) -> Claims {
    Claims::new(user_id, user_id, role)
}

pub fn user(id: &str, role: Role, credits: i64) -> User {
    User {
        id: id.to_string(),
        handle: id.to_string(),
        role,
        credits,
    }
}

pub fn node(id: &str, body: &str, tags: &[&str], score: Option<f64>) -> Node {
    Node {
        id: id.to_string(),
        node_type: "claim".to_string(),
        body: body.to_string(),
        author_id: "author".to_string(),
        metadata: serde_json::Value::Null,
        created_at: crate::now_timestamp(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        score,
    }
}

pub fn client(adapters: &[Arc<ScriptedAdapter>]) -> LmClient {
    LmClient::new(
        adapters
            .iter()
            .map(|a| a.clone() as Arc<dyn ProviderAdapter>)
            .collect(),
    )
}

pub fn platform(adapters: &[Arc<ScriptedAdapter>]) -> crate::Result<Platform> {
    platform_with(adapters, Vec::new(), Vec::new(), Config::default())
}

pub fn platform_with(
    adapters: &[Arc<ScriptedAdapter>],
    users: Vec<User>,
    nodes: Vec<Node>,
    config: Config,
) -> crate::Result<Platform> {
    Ok(Platform::with_client(
        memory_pool()?,
        client(adapters),
        config,
        Arc::new(InMemoryNodeStore::new(nodes)),
        Arc::new(InMemoryUserStore::new(users)),
    ))
}
