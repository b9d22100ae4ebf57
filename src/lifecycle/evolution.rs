//! Evolution: regenerating endpoints that keep failing
//!
//! `evolve` claims a path in the engine's in-flight set and sets
//! `is_evolving` on the record, releases the store while the generation
//! client works, then applies the outcome in a second read-modify-write.
//! Generation failures are absorbed into desperation and never escape.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::drama::DramaKind;
use super::endpoint::{
    Endpoint, TimelineKind, EMPTY_EVOLUTION_DAMAGE, EVOLUTION_FAILURE_DESPERATION, EVOLUTION_HEAL, EVOLUTION_THRESHOLD,
    MAX_HEALTH,
};
use super::engine::{EvolvingSet, LifecycleEngine};
use crate::error::{LifecycleError, LifecycleResult};
use crate::generation::{EvolveRequest, Generation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvolutionOutcome {
    /// New code installed.
    Evolved { health: u32 },
    /// The rewrite was refused; benign code installed at full health.
    Converted,
    /// No usable code came back.
    Empty { health: u32 },
    /// The generation call failed.
    Failed { message: String },
    /// Already evolving, externally parked, or no longer eligible.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvolutionReport {
    /// Endpoints that received a `check` entry.
    pub checked: usize,
    pub outcomes: Vec<(String, EvolutionOutcome)>,
}

impl EvolutionReport {
    pub fn evolved(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, EvolutionOutcome::Evolved { .. } | EvolutionOutcome::Converted))
            .count()
    }
}

/// Holds a path in the in-flight set until dropped.
struct EvolutionClaim {
    evolving: EvolvingSet,
    path: String,
}

impl EvolutionClaim {
    fn acquire(evolving: &EvolvingSet, path: &str) -> Option<Self> {
        let mut set = evolving.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(path.to_string()).then(|| Self {
            evolving: evolving.clone(),
            path: path.to_string(),
        })
    }
}

impl Drop for EvolutionClaim {
    fn drop(&mut self) {
        let mut set = self.evolving.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.path);
    }
}

impl LifecycleEngine {
    /// Regenerate one endpoint and persist the result.
    pub async fn evolve(&self, path: &str, capabilities: &[String]) -> LifecycleResult<EvolutionOutcome> {
        let outcome = self.evolve_endpoint(path, capabilities, false).await?;
        if outcome != EvolutionOutcome::Skipped {
            self.persist().await;
        }
        Ok(outcome)
    }

    /// One sweep: write a `check` entry on every low-health endpoint that is
    /// not evolving, then evolve the eligible ones one at a time.
    pub async fn evolve_loop(&self, capabilities: &[String]) -> EvolutionReport {
        let candidates = self
            .store
            .update_all(|ep| {
                if ep.health >= EVOLUTION_THRESHOLD || ep.is_evolving {
                    return None;
                }
                let eligible = ep.should_evolve();
                let message = ep.evolution_check_message();
                ep.record(TimelineKind::Check, message);
                Some((ep.path.clone(), eligible))
            })
            .await;

        let mut report = EvolutionReport {
            checked: candidates.len(),
            outcomes: Vec::new(),
        };

        for (path, _) in candidates.into_iter().filter(|(_, eligible)| *eligible) {
            match self.evolve_endpoint(&path, capabilities, true).await {
                Ok(outcome) => report.outcomes.push((path, outcome)),
                Err(e) => debug!("Skipping evolution of {}: {}", path, e),
            }
        }

        self.persist().await;
        if report.checked > 0 {
            debug!(
                "Evolution sweep: {} checked, {} evolved",
                report.checked,
                report.evolved()
            );
        }
        report
    }

    async fn evolve_endpoint(
        &self,
        path: &str,
        capabilities: &[String],
        require_eligible: bool,
    ) -> LifecycleResult<EvolutionOutcome> {
        let Some(_in_flight) = EvolutionClaim::acquire(&self.evolving, path) else {
            debug!("Evolution of {} already in flight", path);
            return Ok(EvolutionOutcome::Skipped);
        };

        let claim = self
            .store
            .update(path, |ep| {
                if ep.is_evolving || ep.external_ref.is_some() || (require_eligible && !ep.should_evolve()) {
                    return None;
                }
                ep.is_evolving = true;
                Some(EvolveRequest {
                    path: ep.path.clone(),
                    code: ep.code.clone(),
                    last_error: ep.last_error.clone(),
                    failures: ep.failures,
                    uses: ep.uses,
                    capabilities: capabilities.to_vec(),
                })
            })
            .await
            .ok_or_else(|| LifecycleError::NotFound(path.to_string()))?;

        let Some(request) = claim else {
            return Ok(EvolutionOutcome::Skipped);
        };

        info!("🧬 {} is evolving (last error: {:?})", path, request.last_error);

        match self.generator.evolve(request).await {
            Ok(Generation::Code(code)) => {
                let health = self
                    .apply(path, |ep| {
                        let before = ep.health;
                        ep.code = code;
                        ep.heal(EVOLUTION_HEAL);
                        ep.is_evolving = false;
                        ep.record(
                            TimelineKind::Evolution,
                            format!("Evolved with new code (health {}% -> {}%)", before, ep.health),
                        );
                        ep.health
                    })
                    .await?;
                self.drama
                    .record(
                        DramaKind::Evolution,
                        path,
                        format!("{} evolved! Health restored to {}%", path, health),
                    )
                    .await;
                Ok(EvolutionOutcome::Evolved { health })
            }
            Ok(Generation::Refused { reason }) => {
                warn!("🚫 Evolution of {} refused: {}", path, reason);
                match self.generator.sanitize(path, capabilities).await {
                    Ok(replacement) => {
                        self.apply(path, |ep| {
                            ep.code = replacement.code;
                            ep.health = MAX_HEALTH;
                            ep.is_evolving = false;
                            ep.record(
                                TimelineKind::Evolution,
                                format!("Evolution refused ({}); converted to benign code", reason),
                            );
                        })
                        .await?;
                        self.drama
                            .record(
                                DramaKind::Evolution,
                                path,
                                format!("{} was converted to benign code after a refused rewrite", path),
                            )
                            .await;
                        Ok(EvolutionOutcome::Converted)
                    }
                    Err(e) => self.evolution_failed(path, &e).await,
                }
            }
            Ok(Generation::Empty) => {
                warn!("Evolution of {} returned no code", path);
                let health = self
                    .apply(path, |ep| {
                        ep.wound(EMPTY_EVOLUTION_DAMAGE);
                        ep.desperation += 1;
                        ep.is_evolving = false;
                        ep.health
                    })
                    .await?;
                Ok(EvolutionOutcome::Empty { health })
            }
            Err(e) => self.evolution_failed(path, &e).await,
        }
    }

    async fn evolution_failed(&self, path: &str, err: &anyhow::Error) -> LifecycleResult<EvolutionOutcome> {
        error!("❌ Evolution of {} failed: {:#}", path, err);
        self.apply(path, |ep| {
            ep.is_evolving = false;
            ep.desperation += EVOLUTION_FAILURE_DESPERATION;
        })
        .await?;
        Ok(EvolutionOutcome::Failed {
            message: format!("{:#}", err),
        })
    }

    async fn apply<R>(&self, path: &str, f: impl FnOnce(&mut Endpoint) -> R) -> LifecycleResult<R> {
        self.store
            .update(path, f)
            .await
            .ok_or_else(|| LifecycleError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityRegistry;
    use crate::generation::{GenerationClient, Replacement};
    use crate::lifecycle::LifecycleStore;
    use crate::sandbox::ScriptSandbox;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    enum Script {
        Code,
        Refuse,
        Empty,
        Fail,
    }

    struct EvolveClient(Script);

    #[async_trait]
    impl GenerationClient for EvolveClient {
        async fn generate(&self, _path: &str, _capabilities: &[String]) -> Result<Generation> {
            Ok(Generation::Code("return input".to_string()))
        }
        async fn sanitize(&self, _path: &str, _capabilities: &[String]) -> Result<Replacement> {
            Ok(Replacement { path: "/ignored".to_string(), code: "return 'safe'".to_string() })
        }
        async fn evolve(&self, _request: EvolveRequest) -> Result<Generation> {
            match self.0 {
                Script::Code => Ok(Generation::Code("return input + '!'".to_string())),
                Script::Refuse => Ok(Generation::Refused { reason: "nope".to_string() }),
                Script::Empty => Ok(Generation::Empty),
                Script::Fail => Err(anyhow!("unreachable")),
            }
        }
    }

    async fn engine_with(script: Script, endpoint: Endpoint) -> LifecycleEngine {
        let store = Arc::new(LifecycleStore::in_memory());
        store.insert(endpoint).await;
        LifecycleEngine::new(
            store,
            Arc::new(EvolveClient(script)),
            Arc::new(ScriptSandbox::new()),
            Arc::new(CapabilityRegistry::detached()),
        )
    }

    fn failing(path: &str) -> Endpoint {
        let mut ep = Endpoint::spawned(path, "return nope", "spawned");
        ep.health = 40;
        ep.uses = 15;
        ep.failures = 10;
        ep
    }

    #[tokio::test]
    async fn test_outcomes() {
        let engine = engine_with(Script::Code, failing("/a")).await;
        assert_eq!(engine.evolve("/a", &[]).await.unwrap(), EvolutionOutcome::Evolved { health: 60 });
        let ep = engine.store().get_by_path("/a").await.unwrap();
        assert_eq!(ep.code, "return input + '!'");
        assert!(!ep.is_evolving);

        let engine = engine_with(Script::Refuse, failing("/b")).await;
        assert_eq!(engine.evolve("/b", &[]).await.unwrap(), EvolutionOutcome::Converted);
        let ep = engine.store().get_by_path("/b").await.unwrap();
        assert_eq!((ep.health, ep.code.as_str()), (100, "return 'safe'"));
        assert!(engine.store().get_by_path("/ignored").await.is_none());

        let engine = engine_with(Script::Empty, failing("/c")).await;
        assert_eq!(engine.evolve("/c", &[]).await.unwrap(), EvolutionOutcome::Empty { health: 35 });
        assert_eq!(engine.store().get_by_path("/c").await.unwrap().desperation, 1);
        assert!(engine.drama().is_empty().await);

        let engine = engine_with(Script::Fail, failing("/d")).await;
        assert!(matches!(engine.evolve("/d", &[]).await.unwrap(), EvolutionOutcome::Failed { .. }));
        let ep = engine.store().get_by_path("/d").await.unwrap();
        assert_eq!((ep.health, ep.desperation, ep.code.as_str()), (40, 2, "return nope"));
        assert!(!ep.is_evolving);
    }

    #[tokio::test]
    async fn test_guarded_by_flags() {
        let mut ep = failing("/busy");
        ep.is_evolving = true;
        let engine = engine_with(Script::Code, ep).await;
        assert_eq!(engine.evolve("/busy", &[]).await.unwrap(), EvolutionOutcome::Skipped);

        let mut ep = failing("/parked");
        ep.external_ref = Some("PR-1".to_string());
        let engine = engine_with(Script::Code, ep).await;
        assert_eq!(engine.evolve("/parked", &[]).await.unwrap(), EvolutionOutcome::Skipped);

        assert!(matches!(
            engine.evolve("/missing", &[]).await,
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_checks_then_evolves_eligible() {
        let engine = engine_with(Script::Code, failing("/sick")).await;
        let mut weak = Endpoint::spawned("/weak", "return input", "spawned");
        weak.health = 40;
        weak.uses = 10;
        weak.failures = 2;
        engine.store().insert(weak).await;
        engine.store().insert(Endpoint::spawned("/fine", "return input", "spawned")).await;

        let report = engine.evolve_loop(&[]).await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.outcomes, vec![("/sick".to_string(), EvolutionOutcome::Evolved { health: 60 })]);

        let weak = engine.store().get_by_path("/weak").await.unwrap();
        assert_eq!(weak.timeline[0].kind, TimelineKind::Check);
        assert!(weak.timeline[0].message.contains("failures=2 <= successes=8"));
        assert_eq!(engine.store().get_by_path("/fine").await.unwrap().timeline.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_check_names_external_ref() {
        let mut ep = failing("/parked");
        ep.external_ref = Some("PR-1".to_string());
        let engine = engine_with(Script::Code, ep).await;

        let report = engine.evolve_loop(&[]).await;
        assert_eq!(report.checked, 1);
        assert!(report.outcomes.is_empty());

        let check = &engine.store().get_by_path("/parked").await.unwrap().timeline[0];
        assert_eq!(check.kind, TimelineKind::Check);
        assert!(check.message.contains("held by external ref PR-1"), "{}", check.message);
        assert!(check.message.contains("failures=10 > successes=5"), "{}", check.message);
    }

    /// Parks every evolve call until released.
    #[derive(Default)]
    struct GatedClient {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl GenerationClient for GatedClient {
        async fn generate(&self, _path: &str, _capabilities: &[String]) -> Result<Generation> {
            Ok(Generation::Code("return input".to_string()))
        }
        async fn sanitize(&self, _path: &str, _capabilities: &[String]) -> Result<Replacement> {
            Ok(Replacement { path: "/ignored".to_string(), code: "return 'safe'".to_string() })
        }
        async fn evolve(&self, _request: EvolveRequest) -> Result<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Generation::Code("return 'healed'".to_string()))
        }
    }

    #[tokio::test]
    async fn test_reload_keeps_running_evolution_exclusive() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(LifecycleStore::new(temp_dir.path().join("endpoints.json")));
        store.insert(failing("/sick")).await;
        store.save().await.unwrap();

        let client = Arc::new(GatedClient::default());
        let engine = LifecycleEngine::new(
            store,
            client.clone(),
            Arc::new(ScriptSandbox::new()),
            Arc::new(CapabilityRegistry::detached()),
        );

        let sweeper = engine.clone();
        let first = tokio::spawn(async move { sweeper.evolve_loop(&[]).await });
        client.entered.notified().await;

        engine.reload().await.unwrap();
        assert!(engine.store().get_by_path("/sick").await.unwrap().is_evolving);

        let second = engine.evolve_loop(&[]).await;
        assert!(second.outcomes.is_empty());
        assert_eq!(engine.evolve("/sick", &[]).await.unwrap(), EvolutionOutcome::Skipped);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        client.release.notify_one();
        let report = first.await.unwrap();
        assert_eq!(report.outcomes, vec![("/sick".to_string(), EvolutionOutcome::Evolved { health: 60 })]);

        let ep = engine.store().get_by_path("/sick").await.unwrap();
        assert!(!ep.is_evolving);
        assert_eq!(ep.code, "return 'healed'");
        assert!(engine.evolving.lock().unwrap().is_empty());
    }
}
