//! Reply extraction: turn raw completion text into a structured reply.
//!
//! The model is asked for a JSON object, but real output arrives wrapped in
//! code fences, prefixed with chatter, or as plain prose. Parsing is lenient
//! and only gives up on empty output.

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::LazyLock;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("valid regex"));

static EMOTION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<emotion>\s*([a-z_]+)\s*</emotion>").expect("valid regex"));

/// A choice as proposed by the model, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeneratedChoice {
    #[serde(deserialize_with = "lenient::string")]
    pub text: String,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub tone: Option<String>,
    #[serde(alias = "isPremium", deserialize_with = "lenient::flag")]
    pub is_premium: bool,
    #[serde(alias = "affectionHint", deserialize_with = "lenient::opt_int")]
    pub affection_hint: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeneratedReply {
    #[serde(
        alias = "text",
        alias = "content",
        alias = "response",
        deserialize_with = "lenient::string"
    )]
    pub reply: String,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub emotion: Option<String>,
    #[serde(alias = "innerThought", deserialize_with = "lenient::opt_string")]
    pub inner_thought: Option<String>,
    #[serde(deserialize_with = "lenient::choices")]
    pub choices: Vec<GeneratedChoice>,
    #[serde(alias = "affectionDelta", deserialize_with = "lenient::opt_int")]
    pub affection_delta: Option<i32>,
    #[serde(alias = "trustDelta", deserialize_with = "lenient::opt_int")]
    pub trust_delta: Option<i32>,
    #[serde(alias = "intimacyDelta", deserialize_with = "lenient::opt_int")]
    pub intimacy_delta: Option<i32>,
    /// Set by the model when a scenario scene has reached its end.
    #[serde(alias = "endScene", alias = "scene_complete", deserialize_with = "lenient::flag")]
    pub end_scene: bool,
}

/// Field deserializers that accept what models actually emit: `null` for
/// absent values, floats or numeric strings for integers, strings for flags.
/// A malformed field falls back to its default instead of failing the reply.
mod lenient {
    use super::*;

    pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(opt_string(deserializer)?.unwrap_or_default())
    }

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn opt_int<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let number = match &value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_start_matches('+').parse::<f64>().ok(),
            _ => None,
        };
        Ok(number
            .filter(|n| n.is_finite())
            .map(|n| n.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32))
    }

    pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => false,
        })
    }

    /// Entries may be objects or bare strings; anything else is dropped.
    pub fn choices<'de, D>(deserializer: D) -> Result<Vec<GeneratedChoice>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Value::Array(items) = Value::deserialize(deserializer)? else {
            return Ok(Vec::new());
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(GeneratedChoice {
                    text,
                    ..GeneratedChoice::default()
                }),
                obj @ Value::Object(_) => serde_json::from_value(obj).ok(),
                _ => None,
            })
            .collect())
    }
}

/// Parse a completion. Returns `None` only when there is nothing usable.
pub fn parse_reply(text: &str) -> Option<GeneratedReply> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidates = [
        Some(trimmed),
        CODE_FENCE
            .captures(trimmed)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str()),
        outer_object(trimmed),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(reply) = serde_json::from_str::<GeneratedReply>(candidate) {
            if !reply.reply.trim().is_empty() {
                return Some(GeneratedReply {
                    reply: reply.reply.trim().to_string(),
                    ..reply
                });
            }
        }
    }

    // A JSON object without a reply is a failed generation, not prose
    if trimmed.starts_with('{') {
        tracing::debug!("Completion was JSON without a reply field");
        return None;
    }

    // Plain prose, possibly with an <emotion> tag
    let emotion = EMOTION_TAG
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let prose = EMOTION_TAG.replace_all(trimmed, "").trim().to_string();
    if prose.is_empty() {
        return None;
    }
    tracing::debug!("Completion was not JSON, using it as plain prose");
    Some(GeneratedReply {
        reply: prose,
        emotion,
        ..GeneratedReply::default()
    })
}

fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_json() {
        let raw = r#"{"reply": "Hi!", "emotion": "happy", "inner_thought": "yay",
            "choices": [{"text": "Hello", "affection_hint": 2}], "affection_delta": 3}"#;
        let r = parse_reply(raw).unwrap();
        assert_eq!(r.reply, "Hi!");
        assert_eq!(r.emotion.as_deref(), Some("happy"));
        assert_eq!(r.inner_thought.as_deref(), Some("yay"));
        assert_eq!(r.choices.len(), 1);
        assert_eq!(r.choices[0].affection_hint, Some(2));
        assert_eq!(r.affection_delta, Some(3));
        assert!(!r.end_scene);
    }

    #[test]
    fn test_parse_camel_case_aliases() {
        let raw = r#"{"content": "Hey", "innerThought": "hmm", "affectionDelta": -2,
            "choices": [{"text": "x", "isPremium": true}], "endScene": true}"#;
        let r = parse_reply(raw).unwrap();
        assert_eq!(r.reply, "Hey");
        assert_eq!(r.inner_thought.as_deref(), Some("hmm"));
        assert_eq!(r.affection_delta, Some(-2));
        assert!(r.choices[0].is_premium);
        assert!(r.end_scene);
    }

    #[test]
    fn test_parse_code_block_wrapped() {
        let raw = "Sure!\n```json\n{\"reply\": \"Morning~\", \"emotion\": \"playful\"}\n```";
        let r = parse_reply(raw).unwrap();
        assert_eq!(r.reply, "Morning~");
        assert_eq!(r.emotion.as_deref(), Some("playful"));
    }

    #[test]
    fn test_parse_json_with_chatter() {
        let raw = "Here you go: {\"reply\": \"ok\"} hope that helps";
        assert_eq!(parse_reply(raw).unwrap().reply, "ok");
    }

    #[test]
    fn test_plain_prose_with_emotion_tag() {
        let r = parse_reply("<emotion>Shy</emotion> You noticed? That's sweet.").unwrap();
        assert_eq!(r.reply, "You noticed? That's sweet.");
        assert_eq!(r.emotion.as_deref(), Some("Shy"));
        assert!(r.choices.is_empty());
        assert!(r.affection_delta.is_none());
    }

    #[test]
    fn test_null_fields_fall_back_to_defaults() {
        let r = parse_reply(r#"{"reply":"Hi there!","choices":null}"#).unwrap();
        assert_eq!(r.reply, "Hi there!");
        assert!(r.choices.is_empty());

        let r = parse_reply(r#"{"reply":"Hi","end_scene":null,"emotion":null,"affection_delta":null}"#).unwrap();
        assert!(!r.end_scene);
        assert!(r.emotion.is_none());
        assert!(r.affection_delta.is_none());
    }

    #[test]
    fn test_float_and_string_deltas_are_rounded() {
        let r = parse_reply(r#"{"reply":"Hi there!","affection_delta":2.0}"#).unwrap();
        assert_eq!(r.affection_delta, Some(2));

        let r = parse_reply(r#"{"reply":"ok","trust_delta":1.6,"intimacy_delta":"-3"}"#).unwrap();
        assert_eq!(r.trust_delta, Some(2));
        assert_eq!(r.intimacy_delta, Some(-3));

        let r = parse_reply(r#"{"reply":"ok","affection_delta":"a lot"}"#).unwrap();
        assert!(r.affection_delta.is_none());
    }

    #[test]
    fn test_loose_flags_and_choice_entries() {
        let raw = r#"{"reply":"Shall we?","endScene":"true",
            "choices":["Sure", {"text":"Later","isPremium":1,"affection_hint":1.2}, 7, null]}"#;
        let r = parse_reply(raw).unwrap();
        assert!(r.end_scene);
        assert_eq!(r.choices.len(), 2);
        assert_eq!(r.choices[0].text, "Sure");
        assert!(!r.choices[0].is_premium);
        assert!(r.choices[1].is_premium);
        assert_eq!(r.choices[1].affection_hint, Some(1));
    }

    #[test]
    fn test_empty_and_replyless_json_rejected() {
        assert!(parse_reply("   ").is_none());
        assert!(parse_reply(r#"{"emotion": "happy"}"#).is_none());
        assert!(parse_reply(r#"{"reply": "   "}"#).is_none());
        assert!(parse_reply("<emotion>happy</emotion>").is_none());
    }
}
