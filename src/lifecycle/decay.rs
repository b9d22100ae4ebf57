//! Decay: idle endpoints lose health and die at zero

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::drama::DramaKind;
use super::endpoint::{TimelineKind, DECAY_PER_HOUR};
use super::engine::LifecycleEngine;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecayReport {
    /// `(path, health lost)` for every endpoint that decayed this sweep.
    pub decayed: Vec<(String, u32)>,
    /// Paths removed at zero health.
    pub died: Vec<String>,
}

impl LifecycleEngine {
    pub async fn decay(&self) -> DecayReport {
        self.decay_at(Utc::now()).await
    }

    /// Decay sweep as if the current time were `now`.
    pub async fn decay_at(&self, now: DateTime<Utc>) -> DecayReport {
        let decayed = self
            .store
            .update_all(|ep| {
                let idle = now.signed_duration_since(ep.last_used);
                if idle <= chrono::Duration::hours(1) {
                    return None;
                }
                let hours = idle.num_hours();
                let amount = u32::try_from(hours)
                    .unwrap_or(u32::MAX)
                    .saturating_mul(DECAY_PER_HOUR);
                if ep.health == 0 {
                    return None;
                }
                ep.wound(amount);
                ep.record(
                    TimelineKind::Check,
                    format!("Decayed -{} health (unused for {}h)", amount, hours),
                );
                Some((ep.path.clone(), amount))
            })
            .await;

        let dead = self.store.remove_dead().await;
        let mut died = Vec::with_capacity(dead.len());
        for endpoint in dead {
            info!("💀 {} died after {} uses", endpoint.path, endpoint.uses);
            self.drama
                .record(
                    DramaKind::Death,
                    &endpoint.path,
                    format!("{} died (0% health)", endpoint.path),
                )
                .await;
            died.push(endpoint.path);
        }

        if !died.is_empty() {
            self.redirects
                .write()
                .await
                .retain(|_, target| !died.contains(target));
        }

        self.persist().await;
        if !decayed.is_empty() {
            debug!("Decay sweep: {} decayed, {} died", decayed.len(), died.len());
        }
        DecayReport { decayed, died }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityRegistry;
    use crate::generation::{EvolveRequest, Generation, GenerationClient, Replacement};
    use crate::lifecycle::{DramaKind, Endpoint, LifecycleStore};
    use crate::sandbox::ScriptSandbox;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl GenerationClient for Unreachable {
        async fn generate(&self, _path: &str, _capabilities: &[String]) -> Result<Generation> {
            bail!("offline")
        }
        async fn sanitize(&self, _path: &str, _capabilities: &[String]) -> Result<Replacement> {
            bail!("offline")
        }
        async fn evolve(&self, _request: EvolveRequest) -> Result<Generation> {
            bail!("offline")
        }
    }

    async fn engine(endpoints: Vec<Endpoint>) -> LifecycleEngine {
        let store = Arc::new(LifecycleStore::in_memory());
        for ep in endpoints {
            store.insert(ep).await;
        }
        LifecycleEngine::new(
            store,
            Arc::new(Unreachable),
            Arc::new(ScriptSandbox::new()),
            Arc::new(CapabilityRegistry::detached()),
        )
    }

    #[tokio::test]
    async fn test_three_idle_hours_cost_fifteen() {
        let ep = Endpoint::spawned("/idle", "return input", "spawned");
        let now = ep.last_used + Duration::hours(3);
        let engine = engine(vec![ep]).await;

        let report = engine.decay_at(now).await;
        assert_eq!(report.decayed, vec![("/idle".to_string(), 15)]);

        let ep = engine.store().get_by_path("/idle").await.unwrap();
        assert_eq!(ep.health, 85);
        assert_eq!(ep.timeline[0].message, "Decayed -15 health (unused for 3h)");
    }

    #[tokio::test]
    async fn test_recent_endpoints_untouched() {
        let ep = Endpoint::spawned("/fresh", "return input", "spawned");
        let now = ep.last_used + Duration::minutes(59);
        let engine = engine(vec![ep]).await;

        assert_eq!(engine.decay_at(now).await, DecayReport::default());
        assert_eq!(engine.store().get_by_path("/fresh").await.unwrap().health, 100);
    }

    #[tokio::test]
    async fn test_death_removes_and_announces_once() {
        let mut ep = Endpoint::spawned("/doomed", "return input", "spawned");
        ep.health = 10;
        let now = ep.last_used + Duration::hours(2);
        let engine = engine(vec![ep]).await;

        let report = engine.decay_at(now).await;
        assert_eq!(report.died, vec!["/doomed".to_string()]);
        assert!(engine.store().get_by_path("/doomed").await.is_none());

        let deaths: Vec<_> = engine
            .drama()
            .snapshot()
            .await
            .into_iter()
            .filter(|e| e.kind == DramaKind::Death)
            .collect();
        assert_eq!(deaths.len(), 1);
        assert_eq!(deaths[0].message, "/doomed died (0% health)");

        assert!(engine.decay_at(now).await.died.is_empty());
    }
}
