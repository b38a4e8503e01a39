use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A response option presented to the user after a persona turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    pub id: String,
    pub text: String,
    /// Free-text tone category ("playful", "serious", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
    /// Suggested, not guaranteed, affection delta if this choice is taken.
    #[serde(default)]
    pub affection_hint: i32,
    /// Target scene for scripted scenarios; `None` in freeform chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scene: Option<String>,
}

impl Choice {
    pub fn free(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            tone: None,
            is_premium: false,
            affection_hint: 0,
            next_scene: None,
        }
    }

    pub fn premium(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            is_premium: true,
            ..Self::free(id, text)
        }
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = Some(tone.into());
        self
    }

    pub fn with_hint(mut self, hint: i32) -> Self {
        self.affection_hint = hint;
        self
    }

    pub fn with_next_scene(mut self, scene: impl Into<String>) -> Self {
        self.next_scene = Some(scene.into());
        self
    }

    /// Bind the id to the message presenting it: `c1` on message #4 becomes
    /// `m4-c1`. A selection re-sent after its message was answered then no
    /// longer matches the choices of the newer message.
    pub fn scoped_to(mut self, sequence_number: u64) -> Self {
        self.id = format!("m{}-{}", sequence_number, self.local_id());
        self
    }

    /// The id without its message scope, as scripts and the model name it.
    pub fn local_id(&self) -> &str {
        local_choice_id(&self.id)
    }
}

pub fn local_choice_id(id: &str) -> &str {
    match id.split_once('-') {
        Some((scope, local))
            if scope.len() > 1
                && scope.starts_with('m')
                && scope[1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            local
        }
        _ => id,
    }
}

/// The client's selection of a previously presented choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceData {
    pub choice_id: String,
    /// Message that presented the choice; defaults to the latest assistant message.
    #[serde(default)]
    pub message_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let c = Choice::premium("c1", "Kiss her")
            .with_tone("romantic")
            .with_hint(6)
            .with_next_scene("rooftop");
        assert!(c.is_premium);
        assert_eq!(c.tone.as_deref(), Some("romantic"));
        assert_eq!(c.affection_hint, 6);
        assert_eq!(c.next_scene.as_deref(), Some("rooftop"));
    }

    #[test]
    fn test_choice_json_uses_camel_case() {
        let json = serde_json::to_value(Choice::premium("c2", "Stay")).unwrap();
        assert_eq!(json["isPremium"], true);
        assert!(json.get("nextScene").is_none());
    }

    #[test]
    fn test_scoped_ids() {
        let c = Choice::free("c1", "Hi").scoped_to(4);
        assert_eq!(c.id, "m4-c1");
        assert_eq!(c.local_id(), "c1");
        // Re-scoping replaces the old scope
        assert_eq!(c.scoped_to(6).id, "m6-c1");
        assert_eq!(local_choice_id("say-hi"), "say-hi");
        assert_eq!(local_choice_id("m-x"), "m-x");
        assert_eq!(local_choice_id("m12-ask-more"), "ask-more");
    }

    #[test]
    fn test_choice_data_without_message_id() {
        let data: ChoiceData = serde_json::from_str(r#"{"choiceId":"c1"}"#).unwrap();
        assert_eq!(data.choice_id, "c1");
        assert!(data.message_id.is_none());
    }
}
