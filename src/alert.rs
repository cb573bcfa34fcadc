//! Violation alert coordination.
//!
//! Filters detections down to violations and deduplicates them per class under a
//! cooldown window, so a worker standing without a hardhat for a minute raises
//! one alert per window rather than one per frame.

use chrono::TimeDelta;
use std::collections::HashMap;
use std::time::Duration;

use crate::detect::Detection;
use crate::Timestamp;

/// Default minimum time between two accepted alerts of one class.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Last accepted alert time per violation class. Entries are overwritten, never removed.
#[derive(Clone, Debug, Default)]
pub struct CooldownLedger {
    last_accepted: HashMap<String, Timestamp>,
}

impl CooldownLedger {
    pub fn last_accepted(&self, class_name: &str) -> Option<Timestamp> {
        self.last_accepted.get(class_name).copied()
    }

    /// Time since the last accepted alert of `class_name`. Clock regressions count as zero.
    pub fn elapsed(&self, class_name: &str, now: Timestamp) -> Option<TimeDelta> {
        self.last_accepted(class_name)
            .map(|last| (now - last).max(TimeDelta::zero()))
    }

    fn record(&mut self, class_name: &str, now: Timestamp) {
        self.last_accepted.insert(class_name.to_string(), now);
    }

    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}

/// A violation that passed the cooldown and should be published.
#[derive(Clone, Debug, PartialEq)]
pub struct AcceptedAlert {
    pub detection: Detection,
    pub timestamp: Timestamp,
    /// Violation counter including this alert.
    pub total_violations: u64,
}

pub struct AlertCoordinator {
    cooldown: TimeDelta,
    ledger: CooldownLedger,
    total_violations: u64,
    last_violation: Option<Timestamp>,
}

impl AlertCoordinator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
            ledger: CooldownLedger::default(),
            total_violations: 0,
            last_violation: None,
        }
    }

    /// Accept or suppress each violation in `detections`, in order.
    ///
    /// Suppressed violations leave the ledger and counters untouched.
    pub fn evaluate(&mut self, detections: &[Detection], now: Timestamp) -> Vec<AcceptedAlert> {
        let mut accepted = Vec::new();
        for detection in detections.iter().filter(|d| d.is_violation) {
            if let Some(elapsed) = self.ledger.elapsed(&detection.class_name, now) {
                if elapsed < self.cooldown {
                    log::debug!(
                        "suppressing {} alert: {}s into {}s cooldown",
                        detection.class_name,
                        elapsed.num_seconds(),
                        self.cooldown.num_seconds()
                    );
                    continue;
                }
            }

            self.ledger.record(&detection.class_name, now);
            self.total_violations += 1;
            self.last_violation = Some(now);
            log::warn!(
                "PPE violation: {} ({:.2})",
                detection.class_name,
                detection.confidence
            );
            accepted.push(AcceptedAlert {
                detection: detection.clone(),
                timestamp: now,
                total_violations: self.total_violations,
            });
        }
        accepted
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown.to_std().unwrap_or(Duration::MAX)
    }

    pub fn ledger(&self) -> &CooldownLedger {
        &self.ledger
    }

    pub fn total_violations(&self) -> u64 {
        self.total_violations
    }

    pub fn last_violation(&self) -> Option<Timestamp> {
        self.last_violation
    }
}

impl Default for AlertCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
