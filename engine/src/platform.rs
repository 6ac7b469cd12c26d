// engine/src/platform.rs
//!
//! The long-lived engine value: storage, LM client, limiters, collaborators
//! and the registry of in-flight workflow runs. Built once by the process
//! entry point and passed explicitly; cloning is cheap.

use crate::cancel::CancelToken;
use crate::collaborators::{NodeStore, UserStore};
use crate::config::Config;
use crate::lm_client::LmClient;
use crate::rate_limit::RateLimits;
use crate::{envelope, registry, store, DbPool, Result};
use chrono::Utc;
use parking_lot::Mutex;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone)]
pub struct Platform {
    pub pool: DbPool,
    pub client: Arc<LmClient>,
    pub config: Arc<Config>,
    pub rate_limits: RateLimits,
    pub nodes: Arc<dyn NodeStore>,
    pub users: Arc<dyn UserStore>,
    runs: Arc<Mutex<HashMap<String, CancelToken>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub expired_envelopes: usize,
    pub purged_buckets: usize,
    pub dormant_providers: usize,
}

impl Platform {
    /// Opens the configured database and builds the LM client from the
    /// configured providers.
    pub fn open(config: Config, nodes: Arc<dyn NodeStore>, users: Arc<dyn UserStore>) -> Result<Self> {
        let pool = store::open_pool(&config.database_path)?;
        let client = LmClient::from_config(&config);
        Ok(Self::with_client(pool, client, config, nodes, users))
    }

    pub fn with_client(
        pool: DbPool,
        client: LmClient,
        config: Config,
        nodes: Arc<dyn NodeStore>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            pool,
            client: Arc::new(client),
            rate_limits: RateLimits::from_config(&config.rate_limits),
            config: Arc::new(config),
            nodes,
            users,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn track_run(&self, run_id: &str, token: CancelToken) {
        self.runs.lock().insert(run_id.to_string(), token);
    }

    pub(crate) fn untrack_run(&self, run_id: &str) {
        self.runs.lock().remove(run_id);
    }

    pub(crate) fn run_token(&self, run_id: &str) -> Option<CancelToken> {
        self.runs.lock().get(run_id).cloned()
    }

    pub fn active_runs(&self) -> usize {
        self.runs.lock().len()
    }

    /// One pass of the periodic sweeps.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let expired_envelopes = envelope::expire_envelopes(&self.pool)?;
        let purged_buckets = self.rate_limits.sweep();
        let dormant_providers = {
            let conn = self.conn()?;
            registry::refresh_activity(
                &conn,
                Duration::from_secs(self.config.heartbeat_stale_secs),
                Utc::now(),
            )?
        };
        Ok(MaintenanceReport {
            expired_envelopes,
            purged_buckets,
            dormant_providers,
        })
    }

    /// Runs `run_maintenance` every `sweep_interval_secs` until `stop` is
    /// cancelled.
    pub fn spawn_maintenance(&self, stop: CancelToken) -> JoinHandle<()> {
        let platform = self.clone();
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        std::thread::spawn(move || {
            info!(interval_secs = interval.as_secs(), "maintenance loop started");
            while stop.sleep(interval) {
                match platform.run_maintenance() {
                    Ok(report) => info!(
                        expired = report.expired_envelopes,
                        purged = report.purged_buckets,
                        dormant = report.dormant_providers,
                        "maintenance sweep"
                    ),
                    Err(err) => error!(error = %err, "maintenance sweep failed"),
                }
            }
            info!("maintenance loop stopped");
        })
    }
}
