use crate::api_types::ChatMessage;
use heartline_core::scenario::ScenarioRule;
use heartline_core::{ConversationSession, Message, Mood, PersonaProfile, RelationshipState, Role};

const REPLY_FORMAT: &str = r#"Reply with a single JSON object and nothing else:
{"reply": "what you say", "emotion": "<one of the moods>", "inner_thought": "a private thought or null",
 "choices": [{"text": "a short reply the user could pick", "tone": "playful", "is_premium": false, "affection_hint": 2}],
 "affection_delta": 0, "trust_delta": 0, "intimacy_delta": 0}
Offer 2 to 4 choices. affection_delta is how this exchange changed your feelings, from -10 to 10."#;

pub const SUMMARY_SYSTEM_PROMPT: &str = "You maintain the running memory of a conversation between a user and a companion character. \
Merge the previous summary with the new messages into one short paragraph in the third person. \
Keep names, nicknames, promises, preferences and emotional turning points. Drop small talk. \
Answer with the summary text only.";

pub struct ContextAssembler;

impl ContextAssembler {
    /// System prompt for one dialogue turn.
    pub fn build_system_prompt(
        persona: &PersonaProfile,
        relationship: &RelationshipState,
        session: &ConversationSession,
        scenario: Option<&ScenarioRule>,
    ) -> String {
        let mut sections = vec![
            persona.format_context(),
            format!("== Relationship ==\n{}", relationship.describe_for_context()),
            format!("== Mood ==\nYou are currently feeling {}.", session.emotional_state.describe()),
        ];
        if !session.context_summary.is_empty() {
            sections.push(format!("== Earlier in this conversation ==\n{}", session.context_summary));
        }
        if let Some(rule) = scenario {
            let mut block = format!(
                "== Scene ==\nYou are in a {} scene with the user. {}",
                rule.scenario_type, rule.context
            );
            if let Some(location) = &rule.location {
                block.push_str(&format!("\nLocation: {}.", location));
            }
            block.push_str("\nStay in the scene. Add \"end_scene\": true to your JSON once it reaches a natural end.");
            sections.push(block);
        }
        sections.push(format!(
            "== Format ==\n{}\nMoods: {}.",
            REPLY_FORMAT,
            Mood::vocabulary()
        ));
        sections.join("\n\n")
    }

    /// Recent raw messages followed by the new user input.
    pub fn build_messages(recent: &[Message], user_input: &str) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = recent
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(ChatMessage::user(m.content.clone())),
                Role::Assistant => Some(ChatMessage::assistant(m.content.clone())),
                // System notes are already reflected in the scene block
                Role::System => None,
            })
            .collect();
        messages.push(ChatMessage::user(user_input));
        messages
    }

    /// User message for a summary request.
    pub fn build_summary_request(previous_summary: &str, messages: &[Message], persona_name: Option<&str>) -> String {
        let speaker = persona_name.unwrap_or("Companion");
        let transcript = messages
            .iter()
            .map(|m| match m.role {
                Role::User => format!("User: {}", m.content),
                Role::Assistant => format!("{}: {}", speaker, m.content),
                Role::System => format!("[{}]", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let previous = if previous_summary.is_empty() {
            "(none)"
        } else {
            previous_summary
        };
        format!("Previous summary:\n{}\n\nNew messages:\n{}", previous, transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use heartline_core::scenario::builtin_rules;
    use heartline_core::ScenarioType;

    fn fixtures() -> (PersonaProfile, RelationshipState, ConversationSession) {
        let persona = PersonaProfile::new("luna", "Luna", "gentle bookworm");
        let mut rel = RelationshipState::new("u1", "luna", Utc::now());
        rel.user_nickname = Some("sunshine".into());
        let mut session = ConversationSession::new("u1", "luna", Utc::now());
        session.context_summary = "They bonded over cats.".into();
        (persona, rel, session)
    }

    #[test]
    fn test_system_prompt_sections() {
        let (persona, rel, session) = fixtures();
        let prompt = ContextAssembler::build_system_prompt(&persona, &rel, &session, None);
        assert!(prompt.contains("You are Luna"));
        assert!(prompt.contains("Relationship stage: stranger"));
        assert!(prompt.contains("sunshine"));
        assert!(prompt.contains("They bonded over cats."));
        assert!(prompt.contains("\"reply\""));
        assert!(prompt.contains("jealous"));
        assert!(!prompt.contains("== Scene =="));
    }

    #[test]
    fn test_scene_block_included() {
        let (persona, rel, session) = fixtures();
        let rules = builtin_rules();
        let date = rules
            .iter()
            .find(|r| r.scenario_type == ScenarioType::Date)
            .unwrap();
        let prompt = ContextAssembler::build_system_prompt(&persona, &rel, &session, Some(date));
        assert!(prompt.contains("== Scene =="));
        assert!(prompt.contains("date"));
        assert!(prompt.contains("end_scene"));
    }

    #[test]
    fn test_messages_skip_system_and_append_input() {
        let sid = uuid::Uuid::new_v4();
        let recent = vec![
            Message::user(sid, "hi"),
            Message::system(sid, "scene changed"),
            Message::assistant(sid, "hello!", Mood::Happy, None, vec![]),
        ];
        let msgs = ContextAssembler::build_messages(&recent, "how are you?");
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1], ChatMessage::assistant("hello!"));
        assert_eq!(msgs[2], ChatMessage::user("how are you?"));
    }

    #[test]
    fn test_summary_request() {
        let sid = uuid::Uuid::new_v4();
        let msgs = vec![Message::user(sid, "I have a cat named Mochi")];
        let req = ContextAssembler::build_summary_request("", &msgs, Some("Luna"));
        assert!(req.contains("(none)"));
        assert!(req.contains("User: I have a cat named Mochi"));
    }
}
