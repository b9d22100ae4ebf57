//! Maintenance Scheduler
//!
//! Drives the evolution sweep and the decay sweep on fixed periods. The
//! first tick of each interval is skipped so a fresh process is not swept
//! at startup; missed ticks are delayed rather than bunched.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::engine::LifecycleEngine;

pub const DEFAULT_EVOLVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(60);

pub struct MaintenanceScheduler {
    engine: LifecycleEngine,
    evolve_every: Duration,
    decay_every: Duration,
}

/// Running sweeps; aborted on [`shutdown`](Self::shutdown) or drop.
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceScheduler {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self {
            engine,
            evolve_every: DEFAULT_EVOLVE_INTERVAL,
            decay_every: DEFAULT_DECAY_INTERVAL,
        }
    }

    pub fn with_intervals(mut self, evolve_every: Duration, decay_every: Duration) -> Self {
        self.evolve_every = evolve_every;
        self.decay_every = decay_every;
        self
    }

    pub fn start(self) -> MaintenanceHandle {
        info!(
            "⏱️ Maintenance: evolution every {:?}, decay every {:?}",
            self.evolve_every, self.decay_every
        );

        let engine = self.engine.clone();
        let evolve_every = self.evolve_every;
        let evolve_task = tokio::spawn(async move {
            let mut ticker = interval(evolve_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let capabilities = engine.capabilities().names().await;
                let report = engine.evolve_loop(&capabilities).await;
                debug!("Evolution tick: {} checked", report.checked);
            }
        });

        let engine = self.engine;
        let decay_every = self.decay_every;
        let decay_task = tokio::spawn(async move {
            let mut ticker = interval(decay_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = engine.decay().await;
                debug!("Decay tick: {} died", report.died.len());
            }
        });

        MaintenanceHandle {
            tasks: vec![evolve_task, decay_task],
        }
    }
}

impl MaintenanceHandle {
    pub fn shutdown(self) {
        // Drop aborts.
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
