//! Emotion vocabulary for persona utterances.
//!
//! The LLM is asked to tag every reply with one of a fixed set of moods.
//! Anything outside the vocabulary collapses to `Neutral` instead of leaking
//! free-form labels to the client.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    #[default]
    Neutral,
    Happy,
    Shy,
    Playful,
    Excited,
    Loving,
    Sad,
    Angry,
    Jealous,
    Worried,
    Surprised,
}

impl Mood {
    pub const ALL: [Mood; 11] = [
        Mood::Neutral,
        Mood::Happy,
        Mood::Shy,
        Mood::Playful,
        Mood::Excited,
        Mood::Loving,
        Mood::Sad,
        Mood::Angry,
        Mood::Jealous,
        Mood::Worried,
        Mood::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Neutral => "neutral",
            Mood::Happy => "happy",
            Mood::Shy => "shy",
            Mood::Playful => "playful",
            Mood::Excited => "excited",
            Mood::Loving => "loving",
            Mood::Sad => "sad",
            Mood::Angry => "angry",
            Mood::Jealous => "jealous",
            Mood::Worried => "worried",
            Mood::Surprised => "surprised",
        }
    }

    /// Strict lookup: exact vocabulary words and a handful of synonyms.
    pub fn lookup(raw: &str) -> Option<Mood> {
        let key = raw.trim().trim_matches(|c: char| c == '<' || c == '>' || c == '"').to_lowercase();
        let mood = match key.as_str() {
            "neutral" | "calm" => Mood::Neutral,
            "happy" | "joy" | "joyful" | "glad" => Mood::Happy,
            "shy" | "embarrassed" | "flustered" | "blushing" => Mood::Shy,
            "playful" | "teasing" | "mischievous" => Mood::Playful,
            "excited" | "thrilled" => Mood::Excited,
            "loving" | "affectionate" | "tender" | "romantic" => Mood::Loving,
            "sad" | "lonely" | "down" => Mood::Sad,
            "angry" | "annoyed" | "upset" => Mood::Angry,
            "jealous" | "envious" => Mood::Jealous,
            "worried" | "anxious" | "nervous" => Mood::Worried,
            "surprised" | "shocked" => Mood::Surprised,
            _ => return None,
        };
        Some(mood)
    }

    /// Lenient parse used on LLM output: unknown labels become `Neutral`.
    pub fn parse_or_neutral(raw: &str) -> Mood {
        match Self::lookup(raw) {
            Some(m) => m,
            None => {
                if !raw.trim().is_empty() {
                    tracing::debug!("Unrecognized emotion tag '{}', falling back to neutral", raw);
                }
                Mood::Neutral
            }
        }
    }

    /// Rough valence used when blending emotional state between turns.
    pub fn valence(&self) -> i8 {
        match self {
            Mood::Happy | Mood::Playful | Mood::Excited | Mood::Loving => 1,
            Mood::Sad | Mood::Angry | Mood::Jealous | Mood::Worried => -1,
            Mood::Neutral | Mood::Shy | Mood::Surprised => 0,
        }
    }

    /// Comma separated vocabulary for prompt instructions.
    pub fn vocabulary() -> String {
        Self::ALL
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persona's current emotional state within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmotionalState {
    pub mood: Mood,
    /// 0-100
    pub intensity: u8,
}

impl Default for EmotionalState {
    fn default() -> Self {
        Self::neutral()
    }
}

impl EmotionalState {
    pub fn neutral() -> Self {
        Self {
            mood: Mood::Neutral,
            intensity: 20,
        }
    }

    pub fn new(mood: Mood, intensity: i32) -> Self {
        Self {
            mood,
            intensity: intensity.clamp(0, 100) as u8,
        }
    }

    /// Next state after the persona expresses `mood`.
    ///
    /// Repeating a mood deepens it, neutral replies let the current mood fade,
    /// and a new mood starts at a medium intensity.
    pub fn transition(&self, mood: Mood) -> EmotionalState {
        if mood == Mood::Neutral {
            let faded = self.intensity / 2;
            if self.mood == Mood::Neutral || faded <= 15 {
                EmotionalState::neutral()
            } else {
                EmotionalState::new(self.mood, faded as i32)
            }
        } else if mood == self.mood {
            EmotionalState::new(mood, self.intensity as i32 + 10)
        } else {
            EmotionalState::new(mood, 50)
        }
    }

    pub fn describe(&self) -> String {
        let degree = match self.intensity {
            0..=24 => "slightly",
            25..=49 => "somewhat",
            50..=74 => "quite",
            _ => "very",
        };
        if self.mood == Mood::Neutral {
            "calm, no strong feelings right now".to_string()
        } else {
            format!("{} {}", degree, self.mood)
        }
    }
}
