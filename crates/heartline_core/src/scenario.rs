//! ScenarioTrigger: decides when free-form chat should escalate into a
//! structured scenario.
//!
//! Rules follow the condition -> action shape: every rule carries its
//! thresholds and the hand-off payload it produces. The evaluator never
//! starts a scenario by itself; it only emits a signal the client must
//! confirm.

use crate::relationship::{RelationshipStage, RelationshipState};
use crate::session::{ConversationSession, Message, Role};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioType {
    Meeting,
    Date,
    Confession,
    Conflict,
    Intimate,
    Custom,
}

impl ScenarioType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioType::Meeting => "meeting",
            ScenarioType::Date => "date",
            ScenarioType::Confession => "confession",
            ScenarioType::Conflict => "conflict",
            ScenarioType::Intimate => "intimate",
            ScenarioType::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Option<ScenarioType> {
        match raw.trim().to_lowercase().as_str() {
            "meeting" => Some(ScenarioType::Meeting),
            "date" => Some(ScenarioType::Date),
            "confession" => Some(ScenarioType::Confession),
            "conflict" => Some(ScenarioType::Conflict),
            "intimate" => Some(ScenarioType::Intimate),
            "custom" => Some(ScenarioType::Custom),
            _ => None,
        }
    }

    /// Higher wins when several rules match in the same turn.
    pub fn priority(&self) -> u8 {
        match self {
            ScenarioType::Confession => 6,
            ScenarioType::Intimate => 5,
            ScenarioType::Conflict => 4,
            ScenarioType::Date => 3,
            ScenarioType::Meeting => 2,
            ScenarioType::Custom => 1,
        }
    }

    /// Episode id a session carries while inside this scenario.
    pub fn episode_id(&self) -> String {
        format!("scenario:{}", self.as_str())
    }

    pub fn opening_scene(&self) -> String {
        format!("scenario:{}:opening", self.as_str())
    }
}

impl fmt::Display for ScenarioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived per-turn hand-off signal. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioTriggerSignal {
    pub should_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_type: Option<ScenarioType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_message: Option<String>,
}

impl ScenarioTriggerSignal {
    pub fn none() -> Self {
        Self {
            should_start: false,
            scenario_type: None,
            scenario_context: None,
            location: None,
            transition_message: None,
        }
    }
}

/// Where declined scenario types are remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionScope {
    /// Declines are forgotten when a new session starts.
    #[default]
    Session,
    /// Declines stick to the (user, persona) relationship.
    Relationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioRule {
    pub scenario_type: ScenarioType,
    /// Any keyword in the latest exchange matches (case-insensitive).
    /// Empty means no keyword requirement.
    pub keywords: Vec<String>,
    pub min_affection: u8,
    pub min_stage: RelationshipStage,
    pub min_session_messages: u64,
    pub location: Option<String>,
    pub context: String,
    pub transition_message: Option<String>,
}

impl Default for ScenarioRule {
    fn default() -> Self {
        Self {
            scenario_type: ScenarioType::Custom,
            keywords: Vec::new(),
            min_affection: 0,
            min_stage: RelationshipStage::Stranger,
            min_session_messages: 0,
            location: None,
            context: String::new(),
            transition_message: None,
        }
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn builtin_rules() -> Vec<ScenarioRule> {
    vec![
        ScenarioRule {
            scenario_type: ScenarioType::Meeting,
            keywords: words(&["meet up", "meet you", "hang out", "in person", "grab coffee", "见面"]),
            min_affection: 10,
            min_stage: RelationshipStage::Stranger,
            min_session_messages: 4,
            location: Some("a quiet cafe downtown".into()),
            context: "The two of you agreed to meet face to face for the first time.".into(),
            transition_message: Some("Your phone buzzes: \"I'm here, by the window.\"".into()),
        },
        ScenarioRule {
            scenario_type: ScenarioType::Date,
            keywords: words(&["date", "dinner", "movie", "go out", "约会"]),
            min_affection: 30,
            min_stage: RelationshipStage::Acquaintance,
            min_session_messages: 6,
            location: Some("a candle-lit restaurant".into()),
            context: "An evening date you have both been looking forward to.".into(),
            transition_message: Some("Later that evening...".into()),
        },
        ScenarioRule {
            scenario_type: ScenarioType::Confession,
            keywords: words(&["i love you", "i like you", "have feelings", "confess", "喜欢你", "爱你"]),
            min_affection: 50,
            min_stage: RelationshipStage::Friend,
            min_session_messages: 8,
            location: Some("a rooftop under the city lights".into()),
            context: "Feelings that have been building up are finally spoken aloud.".into(),
            transition_message: Some("The air suddenly feels different between you...".into()),
        },
        ScenarioRule {
            scenario_type: ScenarioType::Conflict,
            keywords: words(&["jealous", "we need to talk", "angry at you", "you ignored", "生气"]),
            min_affection: 20,
            min_stage: RelationshipStage::Acquaintance,
            min_session_messages: 4,
            location: None,
            context: "A misunderstanding has put some distance between you.".into(),
            transition_message: Some("Something is clearly bothering them...".into()),
        },
        ScenarioRule {
            scenario_type: ScenarioType::Intimate,
            keywords: words(&["stay the night", "hold me", "come closer", "stay with me"]),
            min_affection: 75,
            min_stage: RelationshipStage::Intimate,
            min_session_messages: 10,
            location: Some("your apartment, late at night".into()),
            context: "A quiet, private moment together.".into(),
            transition_message: Some("The night is still young...".into()),
        },
    ]
}

/// Compiled keyword set of one rule.
///
/// ASCII keywords match on word boundaries; keywords with non-ASCII text
/// (CJK has no word separators) fall back to substring matching.
#[derive(Debug, Clone)]
struct KeywordMatcher {
    pattern: Option<Regex>,
    substrings: Vec<String>,
}

impl KeywordMatcher {
    fn new(keywords: &[String]) -> Self {
        let mut alternatives = Vec::new();
        let mut substrings = Vec::new();
        for keyword in keywords.iter().map(|k| k.trim().to_lowercase()) {
            if keyword.is_empty() {
                continue;
            }
            if !keyword.is_ascii() {
                substrings.push(keyword);
                continue;
            }
            let starts_word = keyword.starts_with(|c: char| c.is_alphanumeric());
            let ends_word = keyword.ends_with(|c: char| c.is_alphanumeric());
            alternatives.push(format!(
                "{}{}{}",
                if starts_word { r"\b" } else { "" },
                regex::escape(&keyword),
                if ends_word { r"\b" } else { "" },
            ));
        }

        let pattern = if alternatives.is_empty() {
            None
        } else {
            match Regex::new(&format!("(?i)(?:{})", alternatives.join("|"))) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Keyword pattern rejected, using substring matching: {}", e);
                    substrings.extend(keywords.iter().map(|k| k.trim().to_lowercase()));
                    None
                }
            }
        };
        Self { pattern, substrings }
    }

    fn is_empty(&self) -> bool {
        self.pattern.is_none() && self.substrings.is_empty()
    }

    fn matches(&self, exchange: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(exchange))
            || self.substrings.iter().any(|k| exchange.contains(k.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioTrigger {
    rules: Vec<ScenarioRule>,
    matchers: Vec<KeywordMatcher>,
    scope: SuppressionScope,
}

impl Default for ScenarioTrigger {
    fn default() -> Self {
        Self::new(builtin_rules(), SuppressionScope::Session)
    }
}

impl ScenarioTrigger {
    pub fn new(rules: Vec<ScenarioRule>, scope: SuppressionScope) -> Self {
        let matchers = rules.iter().map(|r| KeywordMatcher::new(&r.keywords)).collect();
        Self {
            rules,
            matchers,
            scope,
        }
    }

    pub fn scope(&self) -> SuppressionScope {
        self.scope
    }

    pub fn rules(&self) -> &[ScenarioRule] {
        &self.rules
    }

    pub fn is_suppressed(
        &self,
        scenario_type: ScenarioType,
        session: &ConversationSession,
        relationship: &RelationshipState,
    ) -> bool {
        match self.scope {
            SuppressionScope::Session => session.declined_scenarios.contains(&scenario_type),
            SuppressionScope::Relationship => {
                relationship.declined_scenarios.contains(&scenario_type)
                    || session.declined_scenarios.contains(&scenario_type)
            }
        }
    }

    /// Remember a decline in the configured scope.
    pub fn record_decline(
        &self,
        scenario_type: ScenarioType,
        session: &mut ConversationSession,
        relationship: &mut RelationshipState,
    ) {
        session.declined_scenarios.insert(scenario_type);
        if self.scope == SuppressionScope::Relationship {
            relationship.declined_scenarios.insert(scenario_type);
        }
    }

    /// Evaluate all rules against the post-turn state.
    ///
    /// `recent` is the session tail in sequence order; only the latest user
    /// and assistant messages are scanned for keywords.
    pub fn evaluate(
        &self,
        session: &ConversationSession,
        relationship: &RelationshipState,
        recent: &[Message],
    ) -> ScenarioTriggerSignal {
        if !session.is_freeform() {
            return ScenarioTriggerSignal::none();
        }

        let exchange = latest_exchange(recent);
        let best = self
            .rules
            .iter()
            .zip(&self.matchers)
            .filter(|(rule, matcher)| self.rule_matches(rule, matcher, session, relationship, &exchange))
            .map(|(rule, _)| rule)
            .max_by_key(|rule| rule.scenario_type.priority());

        match best {
            Some(rule) => {
                tracing::debug!(
                    "Scenario rule '{}' matched for session {}",
                    rule.scenario_type,
                    session.id
                );
                ScenarioTriggerSignal {
                    should_start: true,
                    scenario_type: Some(rule.scenario_type),
                    scenario_context: Some(format!(
                        "{} Relationship stage: {}, affection {}/100.",
                        rule.context, relationship.stage, relationship.affection
                    )),
                    location: rule.location.clone(),
                    transition_message: rule.transition_message.clone(),
                }
            }
            None => ScenarioTriggerSignal::none(),
        }
    }

    fn rule_matches(
        &self,
        rule: &ScenarioRule,
        matcher: &KeywordMatcher,
        session: &ConversationSession,
        relationship: &RelationshipState,
        exchange: &str,
    ) -> bool {
        if self.is_suppressed(rule.scenario_type, session, relationship) {
            return false;
        }
        if relationship.affection < rule.min_affection
            || relationship.stage < rule.min_stage
            || session.message_count() < rule.min_session_messages
        {
            return false;
        }
        matcher.is_empty() || matcher.matches(exchange)
    }
}

/// Lower-cased text of the most recent user and assistant messages.
fn latest_exchange(recent: &[Message]) -> String {
    let last_user = recent.iter().rev().find(|m| m.role == Role::User);
    let last_assistant = recent.iter().rev().find(|m| m.role == Role::Assistant);
    [last_user, last_assistant]
        .iter()
        .flatten()
        .map(|m| m.content.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::Mood;
    use chrono::Utc;

    fn setup(affection: u8, stage: RelationshipStage, messages: u64) -> (ConversationSession, RelationshipState) {
        let mut session = ConversationSession::new("u", "p", Utc::now());
        session.last_sequence = messages;
        let mut rel = RelationshipState::new("u", "p", Utc::now());
        rel.affection = affection;
        rel.stage = stage;
        (session, rel)
    }

    fn exchange(session: &ConversationSession, user: &str, reply: &str) -> Vec<Message> {
        vec![
            Message::user(session.id, user),
            Message::assistant(session.id, reply, Mood::Happy, None, vec![]),
        ]
    }

    #[test]
    fn test_default_is_no_trigger() {
        let (session, rel) = setup(0, RelationshipStage::Stranger, 1);
        let trigger = ScenarioTrigger::default();
        let signal = trigger.evaluate(&session, &rel, &exchange(&session, "hi", "hello"));
        assert_eq!(signal, ScenarioTriggerSignal::none());
    }

    #[test]
    fn test_meeting_triggers_on_keyword_and_thresholds() {
        let (session, rel) = setup(15, RelationshipStage::Acquaintance, 5);
        let trigger = ScenarioTrigger::default();
        let signal = trigger.evaluate(
            &session,
            &rel,
            &exchange(&session, "Want to grab coffee sometime?", "I'd love that"),
        );
        assert!(signal.should_start);
        assert_eq!(signal.scenario_type, Some(ScenarioType::Meeting));
        assert!(signal.location.is_some());
        assert!(signal.transition_message.is_some());
    }

    #[test]
    fn test_thresholds_block_trigger() {
        let (session, rel) = setup(5, RelationshipStage::Stranger, 5);
        let trigger = ScenarioTrigger::default();
        let signal = trigger.evaluate(&session, &rel, &exchange(&session, "let's meet up", "sure"));
        assert!(!signal.should_start);
    }

    #[test]
    fn test_confession_outranks_meeting() {
        let (session, rel) = setup(60, RelationshipStage::Friend, 12);
        let trigger = ScenarioTrigger::default();
        let signal = trigger.evaluate(
            &session,
            &rel,
            &exchange(&session, "Can we meet up? I think I like you", "Oh..."),
        );
        assert_eq!(signal.scenario_type, Some(ScenarioType::Confession));
    }

    #[test]
    fn test_declined_type_is_suppressed_for_session() {
        let (mut session, mut rel) = setup(15, RelationshipStage::Acquaintance, 5);
        let trigger = ScenarioTrigger::default();
        let msgs = exchange(&session, "let's hang out", "yes!");

        assert!(trigger.evaluate(&session, &rel, &msgs).should_start);
        assert!(trigger.evaluate(&session, &rel, &msgs).should_start);

        trigger.record_decline(ScenarioType::Meeting, &mut session, &mut rel);
        assert!(!trigger.evaluate(&session, &rel, &msgs).should_start);
        // Session scope: the relationship keeps no record
        assert!(rel.declined_scenarios.is_empty());
    }

    #[test]
    fn test_relationship_scope_survives_new_session() {
        let (mut session, mut rel) = setup(15, RelationshipStage::Acquaintance, 5);
        let trigger = ScenarioTrigger::new(builtin_rules(), SuppressionScope::Relationship);
        trigger.record_decline(ScenarioType::Meeting, &mut session, &mut rel);

        let mut fresh = ConversationSession::new("u", "p", Utc::now());
        fresh.last_sequence = 5;
        let msgs = exchange(&fresh, "let's hang out", "yes!");
        assert!(!trigger.evaluate(&fresh, &rel, &msgs).should_start);
    }

    #[test]
    fn test_keyword_inside_other_word_does_not_trigger() {
        let (session, rel) = setup(40, RelationshipStage::Acquaintance, 10);
        let trigger = ScenarioTrigger::default();
        for text in [
            "Any update on your exam?",
            "I had to validate the form",
            "She is a strong candidate",
            "That question felt in personal territory",
        ] {
            let signal = trigger.evaluate(&session, &rel, &exchange(&session, text, "I see."));
            assert!(!signal.should_start, "unexpected trigger for {:?}", text);
        }
    }

    #[test]
    fn test_keyword_matches_as_whole_word() {
        let (session, rel) = setup(40, RelationshipStage::Acquaintance, 10);
        let trigger = ScenarioTrigger::default();
        let signal = trigger.evaluate(
            &session,
            &rel,
            &exchange(&session, "Is this a DATE, then?", "Maybe it is."),
        );
        assert_eq!(signal.scenario_type, Some(ScenarioType::Date));
    }

    #[test]
    fn test_cjk_keyword_matches_without_spaces() {
        let (session, rel) = setup(40, RelationshipStage::Acquaintance, 10);
        let trigger = ScenarioTrigger::default();
        let signal = trigger.evaluate(&session, &rel, &exchange(&session, "我们去约会吧", "好呀"));
        assert_eq!(signal.scenario_type, Some(ScenarioType::Date));
    }

    #[test]
    fn test_no_trigger_inside_episode() {
        let (mut session, rel) = setup(90, RelationshipStage::Lover, 50);
        session.current_episode = Some("onboarding".into());
        let trigger = ScenarioTrigger::default();
        let signal = trigger.evaluate(&session, &rel, &exchange(&session, "i love you", "!"));
        assert!(!signal.should_start);
    }

    #[test]
    fn test_keywordless_custom_rule() {
        let rule = ScenarioRule {
            scenario_type: ScenarioType::Custom,
            min_session_messages: 3,
            context: "Anniversary".into(),
            ..ScenarioRule::default()
        };
        let trigger = ScenarioTrigger::new(vec![rule], SuppressionScope::Session);
        let (session, rel) = setup(0, RelationshipStage::Stranger, 3);
        let signal = trigger.evaluate(&session, &rel, &[]);
        assert_eq!(signal.scenario_type, Some(ScenarioType::Custom));
    }

    #[test]
    fn test_signal_serializes_camel_case() {
        let signal = ScenarioTriggerSignal {
            should_start: true,
            scenario_type: Some(ScenarioType::Date),
            scenario_context: Some("ctx".into()),
            location: None,
            transition_message: Some("Later...".into()),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["shouldStart"], true);
        assert_eq!(json["scenarioType"], "date");
        assert_eq!(json["transitionMessage"], "Later...");
        assert!(json.get("location").is_none());
    }
}
