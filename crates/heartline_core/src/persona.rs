//! Persona profiles and the read-only persona directory.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

pub const PERSONA_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    /// 0 = very casual, 100 = very formal
    pub formality: u8,
    /// 0 = never flirts, 100 = constantly
    pub flirtiness: u8,
    pub uses_emoji: bool,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            formality: 30,
            flirtiness: 40,
            uses_emoji: true,
        }
    }
}

/// Versioned persona definition, usually one TOML file per persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub backstory: Option<String>,
    #[serde(default)]
    pub speaking_style: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub tone: ToneConfig,
    /// In-persona lines used when generation fails.
    #[serde(default)]
    pub filler_lines: Vec<String>,
}

fn default_schema_version() -> u32 {
    PERSONA_SCHEMA_VERSION
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PersonaError {
    #[error("unsupported persona schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("persona field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("persona tone value '{0}' must be within 0-100")]
    ToneOutOfRange(&'static str),
}

const DEFAULT_FILLER: &str =
    "Sorry, my signal keeps cutting out... give me a second and say that again?";

impl PersonaProfile {
    pub fn new(id: &str, name: &str, personality: &str) -> Self {
        Self {
            schema_version: PERSONA_SCHEMA_VERSION,
            id: id.to_string(),
            name: name.to_string(),
            age: None,
            personality: personality.to_string(),
            backstory: None,
            speaking_style: None,
            interests: Vec::new(),
            tone: ToneConfig::default(),
            filler_lines: Vec::new(),
        }
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let profile: PersonaProfile = toml::from_str(raw).context("Failed to parse persona TOML")?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), PersonaError> {
        if self.schema_version != PERSONA_SCHEMA_VERSION {
            return Err(PersonaError::UnsupportedVersion {
                found: self.schema_version,
                expected: PERSONA_SCHEMA_VERSION,
            });
        }
        if self.id.trim().is_empty() {
            return Err(PersonaError::EmptyField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(PersonaError::EmptyField("name"));
        }
        if self.tone.formality > 100 {
            return Err(PersonaError::ToneOutOfRange("formality"));
        }
        if self.tone.flirtiness > 100 {
            return Err(PersonaError::ToneOutOfRange("flirtiness"));
        }
        Ok(())
    }

    /// Format the persona block of the system prompt.
    pub fn format_context(&self) -> String {
        let mut out = format!("== Persona ==\nYou are {}", self.name);
        if let Some(age) = self.age {
            out.push_str(&format!(", {} years old", age));
        }
        out.push_str(".\n");
        if !self.personality.is_empty() {
            out.push_str(&format!("Personality: {}\n", self.personality));
        }
        if let Some(backstory) = &self.backstory {
            out.push_str(&format!("Backstory: {}\n", backstory));
        }
        if let Some(style) = &self.speaking_style {
            out.push_str(&format!("Speaking style: {}\n", style));
        }
        if !self.interests.is_empty() {
            out.push_str(&format!("Interests: {}\n", self.interests.join(", ")));
        }
        let formality = match self.tone.formality {
            0..=33 => "casual",
            34..=66 => "relaxed but polite",
            _ => "formal",
        };
        let flirt = match self.tone.flirtiness {
            0..=20 => "rarely flirt",
            21..=60 => "flirt now and then",
            _ => "flirt openly",
        };
        out.push_str(&format!(
            "Tone: {}, you {}{}.",
            formality,
            flirt,
            if self.tone.uses_emoji { ", emoji are fine" } else { ", no emoji" }
        ));
        out
    }

    /// "Connection trouble" line for degraded turns. `seed` picks a line.
    pub fn filler_line(&self, seed: usize) -> &str {
        if self.filler_lines.is_empty() {
            DEFAULT_FILLER
        } else {
            &self.filler_lines[seed % self.filler_lines.len()]
        }
    }
}

/// Read-only persona lookup by id.
#[async_trait]
pub trait PersonaDirectory: Send + Sync {
    async fn persona(&self, persona_id: &str) -> anyhow::Result<Option<PersonaProfile>>;
}

/// Personas held in memory, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticPersonaDirectory {
    personas: HashMap<String, PersonaProfile>,
}

impl StaticPersonaDirectory {
    pub fn new<I: IntoIterator<Item = PersonaProfile>>(personas: I) -> Self {
        Self {
            personas: personas.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    pub fn insert(&mut self, persona: PersonaProfile) {
        self.personas.insert(persona.id.clone(), persona);
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.personas.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Load all `*.toml` persona files in `root`. Invalid files are skipped
    /// with a warning; a missing directory yields an empty directory.
    pub async fn load_dir<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let mut dir = Self::default();
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Persona directory {} unavailable: {}", root.display(), e);
                return Ok(dir);
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read persona {}", path.display()))?;
            match PersonaProfile::from_toml(&raw) {
                Ok(profile) => {
                    tracing::info!("Loaded persona '{}' ({})", profile.id, profile.name);
                    dir.insert(profile);
                }
                Err(e) => tracing::warn!("Skipping persona file {}: {:#}", path.display(), e),
            }
        }
        Ok(dir)
    }
}

#[async_trait]
impl PersonaDirectory for StaticPersonaDirectory {
    async fn persona(&self, persona_id: &str) -> anyhow::Result<Option<PersonaProfile>> {
        Ok(self.personas.get(persona_id).cloned())
    }
}
