//! ChoiceGate: premium gating for presented choices.
//!
//! Gating runs before any content generation. A premium choice that fails the
//! entitlement check produces a paywall signal and nothing else.

use crate::choice::Choice;
use async_trait::async_trait;
use std::collections::HashSet;

/// Subscription / credit-balance collaborator.
#[async_trait]
pub trait EntitlementCheck: Send + Sync {
    async fn check_premium_access(&self, user_id: &str) -> anyhow::Result<bool>;

    /// Remaining token balance for the response payload, when known.
    async fn token_balance(&self, _user_id: &str) -> anyhow::Result<Option<i64>> {
        Ok(None)
    }
}

/// Entitlements from a fixed set of premium users.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlement {
    premium_users: HashSet<String>,
    grant_all: bool,
    balance: Option<i64>,
}

impl StaticEntitlement {
    pub fn new<I, S>(premium_users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            premium_users: premium_users.into_iter().map(Into::into).collect(),
            grant_all: false,
            balance: None,
        }
    }

    pub fn allow_all() -> Self {
        Self {
            grant_all: true,
            ..Self::default()
        }
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn with_balance(mut self, balance: i64) -> Self {
        self.balance = Some(balance);
        self
    }
}

#[async_trait]
impl EntitlementCheck for StaticEntitlement {
    async fn check_premium_access(&self, user_id: &str) -> anyhow::Result<bool> {
        Ok(self.grant_all || self.premium_users.contains(user_id))
    }

    async fn token_balance(&self, _user_id: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.balance)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChoicePartition {
    pub free: Vec<Choice>,
    pub premium: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// `premium_checked` is true when an entitlement check passed this turn.
    Authorized { premium_checked: bool },
    PaywallRequired { choice_id: String, tease: String },
}

impl GateDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, GateDecision::Authorized { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ChoiceGate {
    tease_chars: usize,
}

impl Default for ChoiceGate {
    fn default() -> Self {
        Self::new(40)
    }
}

impl ChoiceGate {
    pub fn new(tease_chars: usize) -> Self {
        Self {
            tease_chars: tease_chars.max(8),
        }
    }

    pub fn classify(choices: &[Choice]) -> ChoicePartition {
        let (premium, free): (Vec<Choice>, Vec<Choice>) =
            choices.iter().cloned().partition(|c| c.is_premium);
        ChoicePartition { free, premium }
    }

    /// Authorize resolving `choice` for `user_id`.
    ///
    /// Entitlement collaborator errors fail closed.
    pub async fn authorize(
        &self,
        user_id: &str,
        choice: &Choice,
        entitlement: &dyn EntitlementCheck,
    ) -> GateDecision {
        if !choice.is_premium {
            return GateDecision::Authorized {
                premium_checked: false,
            };
        }

        let granted = match entitlement.check_premium_access(user_id).await {
            Ok(granted) => granted,
            Err(e) => {
                tracing::warn!(
                    "Entitlement check failed for user {}, treating as no access: {}",
                    user_id,
                    e
                );
                false
            }
        };

        if granted {
            GateDecision::Authorized {
                premium_checked: true,
            }
        } else {
            tracing::info!("Paywall hit: user={} choice={}", user_id, choice.id);
            GateDecision::PaywallRequired {
                choice_id: choice.id.clone(),
                tease: self.tease_for(choice),
            }
        }
    }

    /// Preview of a premium choice: the first few words, never the full text.
    pub fn tease_for(&self, choice: &Choice) -> String {
        let total = choice.text.chars().count();
        let keep = self.tease_chars.min(total / 2).max(1);
        let preview: String = choice.text.chars().take(keep).collect();
        format!("{}… Unlock premium to see what happens next.", preview.trim_end())
    }

    /// Guarantee at least one free option. Returns true when a choice was demoted.
    pub fn ensure_free_choice(choices: &mut [Choice]) -> bool {
        if choices.is_empty() || choices.iter().any(|c| !c.is_premium) {
            return false;
        }
        choices[0].is_premium = false;
        tracing::debug!("All proposed choices were premium, demoted '{}' to free", choices[0].id);
        true
    }
}
