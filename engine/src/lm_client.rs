// engine/src/lm_client.rs
//!
//! LM Client: routes requests to provider adapters.
//!
//! `complete` walks the configured fallback chain in configuration order;
//! `complete_with` targets one named provider with no fallback. Neither
//! retries; retry budgets belong to the workflow executor.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::model_adapters::{
    CallError, CallErrorKind, HttpAdapter, LmRequest, LmResponse, ProviderAdapter,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One failed attempt inside a fallback walk.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub error: CallError,
}

/// Every attempt made by `complete_chain`, so callers can ledger each one.
#[derive(Debug)]
pub struct ChainOutcome {
    pub failures: Vec<ProviderFailure>,
    pub result: Result<LmResponse, CallError>,
}

#[derive(Clone, Default)]
pub struct LmClient {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl LmClient {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn from_config(config: &Config) -> Self {
        let adapters = config
            .providers
            .iter()
            .map(|p| Arc::new(HttpAdapter::from_config(p)) as Arc<dyn ProviderAdapter>)
            .collect();
        Self { adapters }
    }

    /// Configured providers in fallback order.
    pub fn configured_providers(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    /// First configured provider carrying `model`.
    pub fn adapter_for_model(&self, model: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.supports(model)).cloned()
    }

    pub fn complete(&self, cancel: &CancelToken, request: &LmRequest) -> Result<LmResponse, CallError> {
        self.complete_chain(cancel, request).result
    }

    /// Walks the fallback chain. With a model set, only providers carrying
    /// it are tried; without one each provider is tried with its first model.
    pub fn complete_chain(&self, cancel: &CancelToken, request: &LmRequest) -> ChainOutcome {
        let mut failures = Vec::new();
        for adapter in &self.adapters {
            let model = match &request.model {
                Some(model) if adapter.supports(model) => model.clone(),
                Some(_) => continue,
                None => match adapter.models().into_iter().next() {
                    Some(first) => first,
                    None => continue,
                },
            };
            if cancel.is_cancelled() {
                return ChainOutcome {
                    failures,
                    result: Err(CallError::new(
                        adapter.name(),
                        CallErrorKind::Timeout,
                        "deadline reached during fallback",
                    )),
                };
            }
            let started = Instant::now();
            match timed_call(adapter.as_ref(), request, &model, cancel, started) {
                Ok(response) => {
                    return ChainOutcome {
                        failures,
                        result: Ok(response),
                    }
                }
                Err(error) => {
                    warn!(provider = adapter.name(), model = %model, error = %error, "provider attempt failed, advancing fallback");
                    failures.push(ProviderFailure {
                        provider: adapter.name().to_string(),
                        model,
                        latency_ms: started.elapsed().as_millis() as u64,
                        error,
                    });
                }
            }
        }

        let result = match failures.last() {
            Some(last) => Err(CallError {
                provider: last.provider.clone(),
                kind: CallErrorKind::Server,
                status: None,
                retry_after: None,
                message: format!("all {} providers in fallback chain failed", failures.len()),
            }),
            None => Err(CallError::new(
                "",
                CallErrorKind::UnknownProvider,
                match &request.model {
                    Some(model) => format!("no configured provider carries model '{model}'"),
                    None => "no providers configured".to_string(),
                },
            )),
        };
        ChainOutcome { failures, result }
    }

    /// Calls exactly one named provider.
    pub fn complete_with(
        &self,
        cancel: &CancelToken,
        provider: &str,
        request: &LmRequest,
    ) -> Result<LmResponse, CallError> {
        let adapter = self.adapter(provider).ok_or_else(|| {
            CallError::new(provider, CallErrorKind::UnknownProvider, format!("unknown provider '{provider}'"))
        })?;
        call_adapter(adapter.as_ref(), cancel, request)
    }
}

/// Calls one adapter with the request's model, or the adapter's first model.
pub fn call_adapter(
    adapter: &dyn ProviderAdapter,
    cancel: &CancelToken,
    request: &LmRequest,
) -> Result<LmResponse, CallError> {
    let model = match &request.model {
        Some(model) => model.clone(),
        None => adapter.models().into_iter().next().ok_or_else(|| {
            CallError::new(adapter.name(), CallErrorKind::InvalidModel, "provider lists no models")
        })?,
    };
    timed_call(adapter, request, &model, cancel, Instant::now())
}

fn timed_call(
    adapter: &dyn ProviderAdapter,
    request: &LmRequest,
    model: &str,
    cancel: &CancelToken,
    started: Instant,
) -> Result<LmResponse, CallError> {
    debug!(provider = adapter.name(), model = %model, "calling provider");
    let mut response = adapter.complete(request, model, cancel)?;
    response.latency_ms = started.elapsed().as_millis() as u64;
    Ok(response)
}
