//! Endpoint Lifecycle Engine
//!
//! Orchestrates spawn and execute over the store, the generation client,
//! the sandbox and the drama feed. Evolution and decay live in sibling
//! modules as further `impl LifecycleEngine` blocks.
//!
//! Concurrent spawns of one path share a single in-flight future: the first
//! caller installs it, everyone else awaits a clone, and the entry is removed
//! when the future finishes or is dropped.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::drama::{DramaKind, DramaLog};
use super::endpoint::{Endpoint, TimelineKind, BEG_THRESHOLD, FAILURE_DAMAGE, SUCCESS_HEAL};
use super::store::LifecycleStore;
use crate::capabilities::{CapabilityRegistry, CapabilitySet};
use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{Generation, GenerationClient};
use crate::sandbox::{ExecutionError, Sandbox};
use crate::utils::truncate::prefix;

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(5);
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

type SpawnFuture = Shared<BoxFuture<'static, LifecycleResult<Endpoint>>>;
type SpawnMap = Arc<StdMutex<HashMap<String, SpawnFuture>>>;
pub(super) type EvolvingSet = Arc<StdMutex<HashSet<String>>>;

/// Result of one successful execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// The endpoint that actually ran.
    pub path: String,
    /// The path the caller asked for, when a refused spawn diverted it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirected_from: Option<String>,
    pub result: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub endpoints: usize,
    pub capabilities: usize,
}

/// Removes a spawn entry when its future completes or is dropped.
struct SpawnSlot {
    spawning: SpawnMap,
    key: String,
}

impl Drop for SpawnSlot {
    fn drop(&mut self) {
        let mut spawning = self.spawning.lock().unwrap_or_else(|e| e.into_inner());
        spawning.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct LifecycleEngine {
    pub(super) store: Arc<LifecycleStore>,
    pub(super) drama: Arc<DramaLog>,
    pub(super) generator: Arc<dyn GenerationClient>,
    sandbox: Arc<dyn Sandbox>,
    capabilities: Arc<CapabilityRegistry>,
    spawning: SpawnMap,
    /// Paths with an evolution in flight in this process.
    pub(super) evolving: EvolvingSet,
    /// requested path -> replacement path, for refused spawns
    pub(super) redirects: Arc<RwLock<HashMap<String, String>>>,
    execution_timeout: Duration,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<LifecycleStore>,
        generator: Arc<dyn GenerationClient>,
        sandbox: Arc<dyn Sandbox>,
        capabilities: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            store,
            drama: Arc::new(DramaLog::default()),
            generator,
            sandbox,
            capabilities,
            spawning: Arc::new(StdMutex::new(HashMap::new())),
            evolving: Arc::new(StdMutex::new(HashSet::new())),
            redirects: Arc::new(RwLock::new(HashMap::new())),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    pub fn with_drama(mut self, drama: Arc<DramaLog>) -> Self {
        self.drama = drama;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<LifecycleStore> {
        &self.store
    }

    pub fn drama(&self) -> &Arc<DramaLog> {
        &self.drama
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Live collection snapshot.
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.store.get_all().await
    }

    /// Where a refused spawn of `path` was diverted to, if anywhere.
    pub async fn redirect_for(&self, path: &str) -> Option<String> {
        self.redirects.read().await.get(path).cloned()
    }

    /// Reload the persisted snapshot and the capability registry.
    ///
    /// Records whose evolution is still running keep their `is_evolving`
    /// flag; the snapshot cannot know about them.
    pub async fn reload(&self) -> anyhow::Result<ReloadSummary> {
        let endpoints = self.store.load_all().await?;
        let in_flight: HashSet<String> = self.evolving.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if !in_flight.is_empty() {
            self.store
                .update_all(|ep| {
                    if in_flight.contains(&ep.path) {
                        ep.is_evolving = true;
                    }
                    None::<()>
                })
                .await;
        }
        let capabilities = self.capabilities.reload().await?;

        let live = self.store.paths().await;
        self.redirects.write().await.retain(|_, target| live.contains(target));

        info!("🔄 Reloaded {} endpoints and {} capabilities", endpoints, capabilities);
        Ok(ReloadSummary { endpoints, capabilities })
    }

    /// Create the endpoint for `path`, or return the live one.
    ///
    /// At most one generation request is in flight per path; concurrent
    /// callers all receive the same outcome. A refusal yields the sanitized
    /// replacement, which lives under a different path.
    pub async fn spawn(&self, path: &str) -> LifecycleResult<Endpoint> {
        let pending = {
            let mut spawning = self.spawning.lock().unwrap_or_else(|e| e.into_inner());
            match spawning.get(path) {
                Some(pending) => {
                    debug!("Spawn of {} already in flight, waiting", path);
                    pending.clone()
                }
                None => {
                    let engine = self.clone();
                    let key = path.to_string();
                    let pending = async move {
                        let _slot = SpawnSlot {
                            spawning: engine.spawning.clone(),
                            key: key.clone(),
                        };
                        engine.spawn_uncontended(&key).await
                    }
                    .boxed()
                    .shared();
                    spawning.insert(path.to_string(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn spawn_uncontended(&self, path: &str) -> LifecycleResult<Endpoint> {
        if let Some(existing) = self.store.get_by_path(path).await {
            return Ok(existing);
        }

        info!("🐣 Spawning endpoint: {}", path);
        let capabilities = self.capabilities.names().await;

        match self.generator.generate(path, &capabilities).await {
            Ok(Generation::Code(code)) => {
                let (live, inserted) = self
                    .store
                    .insert_checked(Endpoint::spawned(path, code, "Spawned with generated code"))
                    .await;
                if inserted {
                    self.persist().await;
                    self.drama
                        .record(DramaKind::Spawn, &live.path, format!("{} spawned into existence", live.path))
                        .await;
                }
                Ok(live)
            }
            Ok(Generation::Refused { reason }) => self.spawn_replacement(path, &capabilities, reason).await,
            Ok(Generation::Empty) => {
                warn!("Generation for {} returned no code", path);
                Err(LifecycleError::GenerationEmpty { path: path.to_string() })
            }
            Err(e) => {
                warn!("Generation for {} failed: {:#}", path, e);
                Err(LifecycleError::transport(path, &e))
            }
        }
    }

    async fn spawn_replacement(&self, path: &str, capabilities: &[String], reason: String) -> LifecycleResult<Endpoint> {
        warn!("🚫 Generation refused for {}: {}", path, reason);

        let replacement = match self.generator.sanitize(path, capabilities).await {
            Ok(replacement) => replacement,
            Err(e) => {
                warn!("No sanitized replacement for {}: {:#}", path, e);
                return Err(LifecycleError::GenerationRefused {
                    path: path.to_string(),
                    reason,
                });
            }
        };

        let (live, inserted) = self
            .store
            .insert_checked(Endpoint::spawned(
                replacement.path.as_str(),
                replacement.code,
                format!("Spawned in place of refused {}", path),
            ))
            .await;
        self.redirects
            .write()
            .await
            .insert(path.to_string(), live.path.clone());
        self.persist().await;

        if inserted {
            self.drama
                .record(
                    DramaKind::Spawn,
                    &live.path,
                    format!("{} spawned into existence (requested as {}, refused)", live.path, path),
                )
                .await;
        } else {
            info!("Refused {} redirected to already-live {}", path, live.path);
        }
        Ok(live)
    }

    /// Find the live record serving `path`, spawning it if needed.
    async fn resolve(&self, path: &str) -> LifecycleResult<(Endpoint, Option<String>)> {
        if let Some(endpoint) = self.store.get_by_path(path).await {
            return Ok((endpoint, None));
        }

        if let Some(target) = self.redirect_for(path).await {
            if let Some(endpoint) = self.store.get_by_path(&target).await {
                return Ok((endpoint, Some(path.to_string())));
            }
            self.redirects.write().await.remove(path);
        }

        let endpoint = self.spawn(path).await?;
        let redirected_from = (endpoint.path != path).then(|| path.to_string());
        Ok((endpoint, redirected_from))
    }

    /// Run the endpoint for `path` against `input`, creating it on first use.
    ///
    /// Execution failures are booked against the endpoint and then returned
    /// as [`LifecycleError::Execution`].
    pub async fn execute(&self, path: &str, input: Value) -> LifecycleResult<Invocation> {
        let (endpoint, redirected_from) = self.resolve(path).await?;
        let live_path = endpoint.path;

        let code = self
            .store
            .update(&live_path, |ep| {
                ep.last_used = Utc::now();
                ep.uses += 1;
                ep.code.clone()
            })
            .await
            .ok_or_else(|| LifecycleError::NotFound(live_path.clone()))?;

        let capabilities = self.capabilities.snapshot().await;
        match self.run_sandbox(code, input, capabilities).await {
            Ok(result) => {
                self.store
                    .update(&live_path, |ep| {
                        ep.heal(SUCCESS_HEAL);
                        ep.record(TimelineKind::Success, "Executed successfully");
                    })
                    .await;
                self.persist().await;
                Ok(Invocation {
                    path: live_path,
                    redirected_from,
                    result,
                })
            }
            Err(err) => {
                let message = err.message;
                let health = self
                    .store
                    .update(&live_path, |ep| {
                        ep.wound(FAILURE_DAMAGE);
                        ep.failures += 1;
                        ep.desperation += 1;
                        ep.last_error = Some(message.clone());
                        ep.record(TimelineKind::Failure, format!("Failed: {}", message));
                        ep.health
                    })
                    .await;
                warn!("💥 {} failed: {}", live_path, message);

                if let Some(health) = health.filter(|h| *h <= BEG_THRESHOLD) {
                    self.drama
                        .record(
                            DramaKind::Beg,
                            &live_path,
                            format!("{} is dying ({}% health): {}...", live_path, health, prefix(&message, 60)),
                        )
                        .await;
                }
                self.persist().await;

                Err(LifecycleError::Execution {
                    path: live_path,
                    message,
                })
            }
        }
    }

    async fn run_sandbox(&self, code: String, input: Value, capabilities: Arc<CapabilitySet>) -> Result<Value, ExecutionError> {
        let sandbox = self.sandbox.clone();
        let task = tokio::task::spawn_blocking(move || sandbox.run(&code, &input, &capabilities));

        match tokio::time::timeout(self.execution_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExecutionError::new(format!("execution aborted: {}", join_error))),
            Err(_) => Err(ExecutionError::new(format!(
                "execution timed out after {}ms",
                self.execution_timeout.as_millis()
            ))),
        }
    }

    /// Save the snapshot, retrying briefly. Failure is logged, never raised.
    pub(super) async fn persist(&self) {
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.store.save().await {
                Ok(()) => return,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!("Saving endpoints failed (attempt {}): {:#}", attempt, e);
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => error!("❌ Giving up on saving endpoints after {} attempts: {:#}", attempt, e),
            }
        }
    }
}
