//! Escalation rule engine
//!
//! A pure decision on a message's sentiment score, plus an idempotency ledger so
//! a redelivered message does not raise a second alert.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pulse_events::envelope::{MessageEvent, SentimentEvent, SentimentLabel};
use pulse_events::{DomainEvent, Envelope};

/// Tunable escalation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    /// Scores strictly below this raise an alert
    pub negative_threshold: f64,
    pub alert_confidence: f64,
    pub alert_escalation_risk: f64,
    /// How long a message id is remembered for alert de-duplication
    pub dedupe_window_secs: u64,
    pub dedupe_capacity: usize,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            negative_threshold: -0.5,
            alert_confidence: 0.8,
            alert_escalation_risk: 0.9,
            dedupe_window_secs: 3600,
            dedupe_capacity: 100_000,
        }
    }
}

/// Outcome of a positive rule evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDecision {
    pub score: f64,
    pub sentiment: SentimentLabel,
    pub confidence: f64,
    pub escalation_risk: f64,
}

impl EscalationPolicy {
    /// `Some` when `score` is below the negative threshold
    pub fn evaluate(&self, score: f64) -> Option<AlertDecision> {
        if score < self.negative_threshold {
            Some(AlertDecision {
                score,
                sentiment: SentimentLabel::Negative,
                confidence: self.alert_confidence,
                escalation_risk: self.alert_escalation_risk,
            })
        } else {
            None
        }
    }

    /// Derived `SENTIMENT_ALERT` envelope for a message, if one is due
    pub fn alert_for(&self, message: &MessageEvent) -> Option<Envelope> {
        let decision = self.evaluate(message.sentiment_score?)?;
        let alert = SentimentEvent {
            conversation_id: message.conversation_id.clone(),
            message_id: Some(message.message_id.clone()),
            sentiment: decision.sentiment,
            score: Some(decision.score),
            confidence: decision.confidence,
            escalation_risk: Some(decision.escalation_risk),
        };
        Some(Envelope::new(DomainEvent::SentimentAlert(alert)).with_key(message.conversation_id.clone()))
    }
}

/// Remembers which messages already produced an alert
pub struct AlertLedger {
    fired: DashMap<String, Instant>,
    window: Duration,
    capacity: usize,
}

impl AlertLedger {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            fired: DashMap::new(),
            window,
            capacity: capacity.max(1),
        }
    }

    pub fn from_policy(policy: &EscalationPolicy) -> Self {
        Self::new(Duration::from_secs(policy.dedupe_window_secs), policy.dedupe_capacity)
    }

    /// Claim `key`; `false` if it was claimed within the window
    pub fn claim(&self, key: &str) -> bool {
        let now = Instant::now();
        if self.fired.len() >= self.capacity {
            self.prune(now);
        }

        let mut claimed = false;
        self.fired
            .entry(key.to_string())
            .and_modify(|at| {
                if now.duration_since(*at) >= self.window {
                    *at = now;
                    claimed = true;
                }
            })
            .or_insert_with(|| {
                claimed = true;
                now
            });
        claimed
    }

    /// Give a claim back, e.g. when publishing the alert failed
    pub fn release(&self, key: &str) {
        self.fired.remove(key);
    }

    pub fn len(&self) -> usize {
        self.fired.len()
    }

    fn prune(&self, now: Instant) {
        let before = self.fired.len();
        self.fired.retain(|_, at| now.duration_since(*at) < self.window);

        // Still full: drop the oldest half
        if self.fired.len() >= self.capacity {
            let mut stamps: Vec<(String, Instant)> =
                self.fired.iter().map(|e| (e.key().clone(), *e.value())).collect();
            stamps.sort_by_key(|(_, at)| *at);
            for (key, _) in stamps.into_iter().take(self.capacity / 2 + 1) {
                self.fired.remove(&key);
            }
        }
        debug!(before, after = self.fired.len(), "Pruned alert ledger");
    }
}
