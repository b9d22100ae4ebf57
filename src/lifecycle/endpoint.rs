//! Endpoint Records
//!
//! The persisted shape of a live endpoint plus the bookkeeping rules that
//! every lifecycle trigger shares.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for `health`.
pub const MAX_HEALTH: u32 = 100;
/// Timeline entries kept per endpoint.
pub const TIMELINE_CAPACITY: usize = 20;
/// Health gained on a successful execution.
pub const SUCCESS_HEAL: u32 = 5;
/// Health lost on a failed execution.
pub const FAILURE_DAMAGE: u32 = 10;
/// At or below this health a failing endpoint begs in the drama feed.
pub const BEG_THRESHOLD: u32 = 30;
/// Below this health an endpoint is considered for evolution.
pub const EVOLUTION_THRESHOLD: u32 = 50;
/// Health restored by a successful evolution.
pub const EVOLUTION_HEAL: u32 = 20;
/// Health lost when evolution yields no code.
pub const EMPTY_EVOLUTION_DAMAGE: u32 = 5;
/// Desperation added when the evolution call itself fails.
pub const EVOLUTION_FAILURE_DESPERATION: u64 = 2;
/// Health lost per whole idle hour.
pub const DECAY_PER_HOUR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Spawn,
    Success,
    Failure,
    Evolution,
    Check,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TimelineKind,
    pub health: u32,
    pub message: String,
}

/// A live, independently addressable handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub path: String,
    pub code: String,
    pub health: u32,
    pub uses: u64,
    pub failures: u64,
    #[serde(default)]
    pub desperation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub is_evolving: bool,
    /// Tracking artifact owned by an outside workflow; suppresses evolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// Newest first.
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
}

impl Endpoint {
    /// A freshly spawned endpoint at full health with a single `spawn` entry.
    pub fn spawned(path: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            path: path.into(),
            code: code.into(),
            health: MAX_HEALTH,
            uses: 0,
            failures: 0,
            desperation: 0,
            last_error: None,
            last_used: now,
            is_evolving: false,
            external_ref: None,
            timeline: vec![TimelineEvent {
                timestamp: now,
                kind: TimelineKind::Spawn,
                health: MAX_HEALTH,
                message: message.into(),
            }],
        }
    }

    /// Executions that did not fail.
    pub fn successes(&self) -> u64 {
        self.uses.saturating_sub(self.failures)
    }

    /// Low health, more failures than successes, not already evolving and
    /// not parked behind an external artifact.
    pub fn should_evolve(&self) -> bool {
        self.health < EVOLUTION_THRESHOLD
            && self.failures > self.successes()
            && !self.is_evolving
            && self.external_ref.is_none()
    }

    pub fn heal(&mut self, amount: u32) {
        self.health = self.health.saturating_add(amount).min(MAX_HEALTH);
    }

    pub fn wound(&mut self, amount: u32) {
        self.health = self.health.saturating_sub(amount);
    }

    pub fn is_dead(&self) -> bool {
        self.health == 0
    }

    /// Prepend a timeline entry stamped with the current health, dropping
    /// the oldest entries past [`TIMELINE_CAPACITY`].
    pub fn record(&mut self, kind: TimelineKind, message: impl Into<String>) {
        self.timeline.insert(
            0,
            TimelineEvent {
                timestamp: Utc::now(),
                kind,
                health: self.health,
                message: message.into(),
            },
        );
        self.timeline.truncate(TIMELINE_CAPACITY);
    }

    /// The `check` message written by the evolution sweep.
    pub(crate) fn evolution_check_message(&self) -> String {
        if self.should_evolve() {
            format!(
                "Evolution criteria met: health={}%, failures={} > successes={}",
                self.health,
                self.failures,
                self.successes()
            )
        } else {
            let comparison = if self.failures > self.successes() { ">" } else { "<=" };
            let counts = format!("failures={} {} successes={}", self.failures, comparison, self.successes());
            let blocker = if let Some(reference) = &self.external_ref {
                format!("held by external ref {}", reference)
            } else if self.is_evolving {
                "already evolving".to_string()
            } else if self.health >= EVOLUTION_THRESHOLD {
                format!("health not below {}%", EVOLUTION_THRESHOLD)
            } else {
                "failures do not outnumber successes".to_string()
            };
            format!(
                "Checked for evolution: not eligible yet ({}; health={}%, {})",
                blocker, self.health, counts
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(health: u32, uses: u64, failures: u64) -> Endpoint {
        let mut ep = Endpoint::spawned("/test", "return actions.return(input)", "spawned");
        ep.health = health;
        ep.uses = uses;
        ep.failures = failures;
        ep
    }

    #[test]
    fn test_spawned_defaults() {
        let ep = Endpoint::spawned("/fresh", "return input", "hello");
        assert_eq!(ep.health, 100);
        assert_eq!(ep.uses, 0);
        assert_eq!(ep.failures, 0);
        assert_eq!(ep.desperation, 0);
        assert!(!ep.is_evolving);
        assert_eq!(ep.timeline.len(), 1);
        assert_eq!(ep.timeline[0].kind, TimelineKind::Spawn);
    }

    #[test]
    fn test_should_evolve_struggling() {
        // 15 uses, 10 failures = 5 successes
        assert!(endpoint(40, 15, 10).should_evolve());
        assert!(endpoint(40, 10, 8).should_evolve());
    }

    #[test]
    fn test_should_not_evolve_when_healthy() {
        assert!(!endpoint(80, 10, 2).should_evolve());
    }

    #[test]
    fn test_should_not_evolve_with_good_success_rate() {
        assert!(!endpoint(40, 10, 2).should_evolve());
        // Equal failures and successes does not qualify.
        assert!(!endpoint(40, 10, 5).should_evolve());
    }

    #[test]
    fn test_should_not_evolve_while_evolving_or_tracked() {
        let mut evolving = endpoint(40, 10, 8);
        evolving.is_evolving = true;
        assert!(!evolving.should_evolve());

        let mut tracked = endpoint(40, 10, 8);
        tracked.external_ref = Some("x".to_string());
        assert!(!tracked.should_evolve());
    }

    #[test]
    fn test_check_message_names_the_blocker() {
        let met = endpoint(40, 15, 10).evolution_check_message();
        assert!(met.starts_with("Evolution criteria met"), "{}", met);
        assert!(met.contains("failures=10 > successes=5"));

        let mut tracked = endpoint(40, 15, 10);
        tracked.external_ref = Some("PR-1".to_string());
        let message = tracked.evolution_check_message();
        assert!(message.contains("held by external ref PR-1"), "{}", message);
        assert!(message.contains("failures=10 > successes=5"), "{}", message);
        assert!(!message.contains("<="));

        let message = endpoint(40, 10, 2).evolution_check_message();
        assert!(message.contains("failures do not outnumber successes"), "{}", message);
        assert!(message.contains("failures=2 <= successes=8"));
    }

    #[test]
    fn test_health_is_clamped() {
        let mut ep = endpoint(98, 0, 0);
        ep.heal(SUCCESS_HEAL);
        assert_eq!(ep.health, 100);

        ep.health = 4;
        ep.wound(FAILURE_DAMAGE);
        assert_eq!(ep.health, 0);
        assert!(ep.is_dead());
    }

    #[test]
    fn test_timeline_is_capped_newest_first() {
        let mut ep = endpoint(100, 0, 0);
        for i in 0..45 {
            ep.record(TimelineKind::Success, format!("run {}", i));
        }
        assert_eq!(ep.timeline.len(), TIMELINE_CAPACITY);
        assert_eq!(ep.timeline[0].message, "run 44");
        assert_eq!(ep.timeline[TIMELINE_CAPACITY - 1].message, "run 25");
    }

    #[test]
    fn test_persisted_field_names() {
        let mut ep = endpoint(40, 3, 1);
        ep.last_error = Some("boom".to_string());
        let json = serde_json::to_value(&ep).unwrap();

        assert_eq!(json["lastError"], "boom");
        assert_eq!(json["isEvolving"], false);
        assert!(json["lastUsed"].is_string());
        assert_eq!(json["timeline"][0]["type"], "spawn");
        assert!(json.get("externalRef").is_none());
    }
}
