use heartline_core::{Choice, ConversationSession, Message, Mood, ScenarioTriggerSignal, ScenarioType};
use heartline_reasoning::{Paywall, ScenarioResponse, TurnOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Response body of `POST /api/ai/chat`. Field names are part of the client contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: Uuid,
    /// Assistant message presenting `choices`; absent on paywall turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub response: ReplyBody,
    pub choices: Vec<ChoiceView>,
    pub affection_change: i32,
    /// `null` when the balance is unknown.
    pub token_balance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_trigger: Option<ScenarioTriggerSignal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paywall: Option<Paywall>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyBody {
    pub content: String,
    pub emotion: Mood,
    pub inner_thought: Option<String>,
}

/// Client view of a choice. Hints and scene targets stay server-side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceView {
    pub id: String,
    pub text: String,
    pub is_premium: bool,
}

impl From<&Choice> for ChoiceView {
    fn from(c: &Choice) -> Self {
        Self {
            id: c.id.clone(),
            text: c.text.clone(),
            is_premium: c.is_premium,
        }
    }
}

impl From<TurnOutcome> for ChatResponse {
    fn from(out: TurnOutcome) -> Self {
        Self {
            session_id: out.session_id,
            message_id: out.message_id,
            response: ReplyBody {
                content: out.content,
                emotion: out.emotion,
                inner_thought: out.inner_thought,
            },
            choices: out.choices.iter().map(ChoiceView::from).collect(),
            affection_change: out.affection_change,
            token_balance: out.token_balance,
            scenario_trigger: out.scenario_trigger,
            paywall: out.paywall,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionBody {
    pub persona_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndSessionResponse {
    pub ended: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioBody {
    pub scenario_type: ScenarioType,
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReply {
    pub session: ConversationSession,
    pub scenario_type: ScenarioType,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opening: Option<Message>,
}

impl From<ScenarioResponse> for ScenarioReply {
    fn from(resp: ScenarioResponse) -> Self {
        Self {
            session: resp.session,
            scenario_type: resp.scenario_type,
            accepted: resp.accepted,
            opening: resp.opening.as_ref().map(Message::redacted),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: Uuid,
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use heartline_core::RelationshipState;

    fn outcome() -> TurnOutcome {
        TurnOutcome {
            session_id: Uuid::nil(),
            message_id: Some(Uuid::nil()),
            content: "Hi there!".into(),
            emotion: Mood::Shy,
            inner_thought: Some("they came back".into()),
            choices: vec![
                Choice::free("c1", "Hello").with_hint(2),
                Choice::premium("c2", "Ask her out"),
            ],
            affection_change: 2,
            token_balance: None,
            scenario_trigger: None,
            paywall: None,
            relationship: RelationshipState::new("u1", "luna", chrono::Utc::now()),
            stage_changed: None,
            degraded: false,
        }
    }

    #[test]
    fn test_chat_response_wire_shape() {
        let v = serde_json::to_value(ChatResponse::from(outcome())).unwrap();
        assert_eq!(v["sessionId"], Uuid::nil().to_string());
        assert_eq!(v["messageId"], Uuid::nil().to_string());
        assert_eq!(v["response"]["content"], "Hi there!");
        assert_eq!(v["response"]["emotion"], "shy");
        assert_eq!(v["response"]["innerThought"], "they came back");
        assert_eq!(v["choices"][1]["isPremium"], true);
        assert!(v["choices"][0].get("affectionHint").is_none());
        assert_eq!(v["affectionChange"], 2);
        assert!(v["tokenBalance"].is_null());
        assert!(v.get("scenarioTrigger").is_none());
        assert!(v.get("paywall").is_none());
    }

    #[test]
    fn test_paywall_serialized_when_present() {
        let mut out = outcome();
        out.affection_change = 0;
        out.message_id = None;
        out.paywall = Some(Paywall {
            choice_id: "c2".into(),
            tease: "Ask… Unlock premium to see what happens next.".into(),
        });
        let v = serde_json::to_value(ChatResponse::from(out)).unwrap();
        assert_eq!(v["paywall"]["choiceId"], "c2");
        assert_eq!(v["affectionChange"], 0);
        assert!(v.get("messageId").is_none());
    }

    #[test]
    fn test_scenario_body_parses() {
        let body: ScenarioBody = serde_json::from_str(r#"{"scenarioType": "date", "accepted": false}"#).unwrap();
        assert_eq!(body.scenario_type, ScenarioType::Date);
        assert!(!body.accepted);
    }
}
