//! Relationship gauges and the forward-only stage ladder.
//!
//! Affection, trust and intimacy are bounded 0-100 gauges. A separate
//! lifetime counter accumulates every positive affection delta, so the
//! "total gained" view survives the gauge being capped.
//!
//! Stages are derived from the gauges through a pure threshold table and
//! never move backwards: a bad turn can lower gauges but cannot demote.

use crate::scenario::ScenarioType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const GAUGE_MAX: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStage {
    #[default]
    Stranger,
    Acquaintance,
    #[serde(alias = "close")]
    Friend,
    Intimate,
    Lover,
}

impl RelationshipStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStage::Stranger => "stranger",
            RelationshipStage::Acquaintance => "acquaintance",
            RelationshipStage::Friend => "friend",
            RelationshipStage::Intimate => "intimate",
            RelationshipStage::Lover => "lover",
        }
    }

    /// How the persona should treat someone at this stage (prompt hint).
    pub fn behavior_hint(&self) -> &'static str {
        match self {
            RelationshipStage::Stranger => "You just met. Be friendly but a little guarded.",
            RelationshipStage::Acquaintance => "You know each other a bit. Be warm and curious.",
            RelationshipStage::Friend => "You are close friends. Be relaxed, teasing is fine.",
            RelationshipStage::Intimate => "You have strong feelings for each other. Be tender and open.",
            RelationshipStage::Lover => "You are partners. Be affectionate and devoted.",
        }
    }
}

impl fmt::Display for RelationshipStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the stage ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageThreshold {
    pub stage: RelationshipStage,
    /// Minimum composite score (0-100).
    pub min_score: f32,
    /// Minimum lifetime message count with this persona.
    pub min_messages: u64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StageTableError {
    #[error("stage thresholds must be strictly increasing by stage, score and message count (at {0})")]
    NotMonotonic(RelationshipStage),
    #[error("stranger is the implicit base stage and cannot carry a threshold")]
    StrangerThreshold,
}

/// Deterministic step function from gauges to stage.
///
/// Composite score = 0.5 * affection + 0.3 * trust + 0.2 * intimacy.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTable {
    thresholds: Vec<StageThreshold>,
}

impl Default for StageTable {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
        }
    }
}

pub fn default_thresholds() -> Vec<StageThreshold> {
    vec![
        StageThreshold {
            stage: RelationshipStage::Acquaintance,
            min_score: 10.0,
            min_messages: 3,
        },
        StageThreshold {
            stage: RelationshipStage::Friend,
            min_score: 30.0,
            min_messages: 15,
        },
        StageThreshold {
            stage: RelationshipStage::Intimate,
            min_score: 55.0,
            min_messages: 40,
        },
        StageThreshold {
            stage: RelationshipStage::Lover,
            min_score: 80.0,
            min_messages: 80,
        },
    ]
}

impl StageTable {
    pub fn new(mut thresholds: Vec<StageThreshold>) -> Result<Self, StageTableError> {
        thresholds.sort_by_key(|t| t.stage);
        let mut prev: Option<&StageThreshold> = None;
        for t in &thresholds {
            if t.stage == RelationshipStage::Stranger {
                return Err(StageTableError::StrangerThreshold);
            }
            if let Some(p) = prev {
                if p.stage == t.stage || p.min_score >= t.min_score || p.min_messages > t.min_messages {
                    return Err(StageTableError::NotMonotonic(t.stage));
                }
            }
            prev = Some(t);
        }
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &[StageThreshold] {
        &self.thresholds
    }

    pub fn composite_score(affection: u8, trust: u8, intimacy: u8) -> f32 {
        0.5 * affection as f32 + 0.3 * trust as f32 + 0.2 * intimacy as f32
    }

    /// Highest stage whose thresholds are all met. Pure.
    pub fn stage_for(&self, affection: u8, trust: u8, intimacy: u8, messages: u64) -> RelationshipStage {
        let score = Self::composite_score(affection, trust, intimacy);
        self.thresholds
            .iter()
            .filter(|t| score >= t.min_score && messages >= t.min_messages)
            .map(|t| t.stage)
            .max()
            .unwrap_or(RelationshipStage::Stranger)
    }
}

/// Requested change to the gauges for one resolved turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDelta {
    pub affection: i32,
    pub trust: i32,
    pub intimacy: i32,
}

impl RelationshipDelta {
    pub fn affection(affection: i32) -> Self {
        Self {
            affection,
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.affection == 0 && self.trust == 0 && self.intimacy == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: RelationshipStage,
    pub to: RelationshipStage,
}

/// Permanent per (user, persona) relationship ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipState {
    pub user_id: String,
    pub persona_id: String,
    pub affection: u8,
    pub trust: u8,
    pub intimacy: u8,
    /// Sum of every positive affection delta ever requested.
    pub lifetime_affection: u64,
    pub stage: RelationshipStage,
    pub message_count: u64,
    pub first_interaction_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
    /// What the user calls the persona.
    #[serde(default)]
    pub persona_nickname: Option<String>,
    /// What the persona calls the user.
    #[serde(default)]
    pub user_nickname: Option<String>,
    /// Scenario types declined when suppression is relationship-scoped.
    #[serde(default)]
    pub declined_scenarios: BTreeSet<ScenarioType>,
    /// Optimistic-concurrency token. 0 means never persisted.
    #[serde(default)]
    pub version: u64,
}

fn clamp_gauge(current: u8, delta: i32) -> u8 {
    (current as i64 + delta as i64).clamp(0, GAUGE_MAX as i64) as u8
}

impl RelationshipState {
    pub fn new(user_id: &str, persona_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            affection: 0,
            trust: 0,
            intimacy: 0,
            lifetime_affection: 0,
            stage: RelationshipStage::Stranger,
            message_count: 0,
            first_interaction_at: now,
            last_interaction_at: now,
            persona_nickname: None,
            user_nickname: None,
            declined_scenarios: BTreeSet::new(),
            version: 0,
        }
    }

    /// Apply one turn's delta: clamp gauges, count the message, recompute stage.
    ///
    /// Returns the stage transition if the stage advanced.
    pub fn apply_delta(
        &mut self,
        delta: &RelationshipDelta,
        table: &StageTable,
        now: DateTime<Utc>,
    ) -> Option<StageTransition> {
        self.affection = clamp_gauge(self.affection, delta.affection);
        self.trust = clamp_gauge(self.trust, delta.trust);
        self.intimacy = clamp_gauge(self.intimacy, delta.intimacy);
        if delta.affection > 0 {
            self.lifetime_affection = self.lifetime_affection.saturating_add(delta.affection as u64);
        }
        self.message_count = self.message_count.saturating_add(1);
        self.last_interaction_at = now;
        self.advance_stage(table)
    }

    /// Administrative or negative-choice penalty. Lowers gauges only; the
    /// reached stage is kept and the message counter is untouched.
    pub fn apply_penalty(&mut self, delta: &RelationshipDelta, now: DateTime<Utc>) {
        let neg = |d: i32| -(d.abs());
        self.affection = clamp_gauge(self.affection, neg(delta.affection));
        self.trust = clamp_gauge(self.trust, neg(delta.trust));
        self.intimacy = clamp_gauge(self.intimacy, neg(delta.intimacy));
        self.last_interaction_at = now;
    }

    fn advance_stage(&mut self, table: &StageTable) -> Option<StageTransition> {
        let computed = table.stage_for(self.affection, self.trust, self.intimacy, self.message_count);
        if computed > self.stage {
            let transition = StageTransition {
                from: self.stage,
                to: computed,
            };
            self.stage = computed;
            Some(transition)
        } else {
            None
        }
    }

    pub fn composite_score(&self) -> f32 {
        StageTable::composite_score(self.affection, self.trust, self.intimacy)
    }

    /// Prompt fragment describing the relationship.
    pub fn describe_for_context(&self) -> String {
        let mut lines = vec![
            format!("Relationship stage: {}. {}", self.stage, self.stage.behavior_hint()),
            format!(
                "Affection {}/100, trust {}/100, intimacy {}/100, {} messages exchanged.",
                self.affection, self.trust, self.intimacy, self.message_count
            ),
        ];
        if let Some(nick) = &self.user_nickname {
            lines.push(format!("You call the user \"{}\".", nick));
        }
        if let Some(nick) = &self.persona_nickname {
            lines.push(format!("The user calls you \"{}\".", nick));
        }
        lines.join("\n")
    }
}
