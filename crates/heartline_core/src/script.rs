//! Scripted scene graphs (onboarding and authored scenarios).
//!
//! A script is a tagged-variant graph: each scene is a plain line that
//! advances on any input, a branch that waits for one of its choices, or an
//! end marker. The server walks the graph; the client only renders the
//! scenes it is handed.

use crate::choice::Choice;
use crate::emotion::Mood;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SceneKind {
    Line { next: String },
    Branch { choices: Vec<Choice> },
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub line: String,
    #[serde(default)]
    pub emotion: Mood,
    #[serde(default)]
    pub inner_thought: Option<String>,
    pub kind: SceneKind,
}

impl Scene {
    /// Choices to present when this scene is shown.
    pub fn choices(&self) -> Vec<Choice> {
        match &self.kind {
            SceneKind::Branch { choices } => choices.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, SceneKind::End)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScriptError {
    #[error("script '{script}' has no scene '{scene}'")]
    UnknownScene { script: String, scene: String },
    #[error("scene '{scene}' in script '{script}' needs a choice selection")]
    ChoiceRequired { script: String, scene: String },
    #[error("choice '{choice}' is not offered by scene '{scene}'")]
    ChoiceNotOffered { scene: String, choice: String },
    #[error("branch choice '{choice}' in scene '{scene}' has no next_scene")]
    MissingTarget { scene: String, choice: String },
    #[error("branch scene '{0}' offers no free choice")]
    NoFreeChoice(String),
    #[error("script '{0}' has already finished")]
    Finished(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub start: String,
    pub scenes: HashMap<String, Scene>,
}

impl Script {
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct RawScript {
            id: String,
            start: String,
            scenes: Vec<Scene>,
        }
        let parsed: RawScript = toml::from_str(raw).context("Failed to parse script TOML")?;
        let script = Script {
            id: parsed.id,
            start: parsed.start,
            scenes: parsed.scenes.into_iter().map(|s| (s.id.clone(), s)).collect(),
        };
        script.validate()?;
        Ok(script)
    }

    pub fn scene(&self, id: &str) -> Result<&Scene, ScriptError> {
        self.scenes.get(id).ok_or_else(|| ScriptError::UnknownScene {
            script: self.id.clone(),
            scene: id.to_string(),
        })
    }

    /// Check that every edge lands on a known scene and every branch can be
    /// continued without paying.
    pub fn validate(&self) -> Result<(), ScriptError> {
        self.scene(&self.start)?;
        for scene in self.scenes.values() {
            match &scene.kind {
                SceneKind::Line { next } => {
                    self.scene(next)?;
                }
                SceneKind::Branch { choices } => {
                    for choice in choices {
                        let target = choice.next_scene.as_ref().ok_or_else(|| {
                            ScriptError::MissingTarget {
                                scene: scene.id.clone(),
                                choice: choice.id.clone(),
                            }
                        })?;
                        self.scene(target)?;
                    }
                    if !choices.iter().any(|c| !c.is_premium) {
                        return Err(ScriptError::NoFreeChoice(scene.id.clone()));
                    }
                }
                SceneKind::End => {}
            }
        }
        Ok(())
    }

    /// Move from `current` to the next scene.
    ///
    /// `selected` is the already validated and authorized choice, if any.
    pub fn advance(&self, current: &str, selected: Option<&Choice>) -> Result<&Scene, ScriptError> {
        let scene = self.scene(current)?;
        match &scene.kind {
            SceneKind::Line { next } => self.scene(next),
            SceneKind::Branch { choices } => {
                let chosen = selected.ok_or_else(|| ScriptError::ChoiceRequired {
                    script: self.id.clone(),
                    scene: scene.id.clone(),
                })?;
                let offered = choices.iter().find(|c| c.id == chosen.local_id()).ok_or_else(|| {
                    ScriptError::ChoiceNotOffered {
                        scene: scene.id.clone(),
                        choice: chosen.id.clone(),
                    }
                })?;
                let target = offered
                    .next_scene
                    .as_deref()
                    .ok_or_else(|| ScriptError::MissingTarget {
                        scene: scene.id.clone(),
                        choice: offered.id.clone(),
                    })?;
                self.scene(target)
            }
            SceneKind::End => Err(ScriptError::Finished(self.id.clone())),
        }
    }

    /// Built-in first-contact script.
    pub fn onboarding() -> Script {
        let scenes = vec![
            Scene {
                id: "intro".into(),
                line: "Oh! Hi there. I wasn't expecting anyone to message me tonight.".into(),
                emotion: Mood::Surprised,
                inner_thought: Some("Who is this? They seem nice...".into()),
                kind: SceneKind::Branch {
                    choices: vec![
                        Choice::free("c1", "Sorry, did I interrupt something?")
                            .with_tone("polite")
                            .with_hint(2)
                            .with_next_scene("polite"),
                        Choice::free("c2", "Lucky me, then.")
                            .with_tone("playful")
                            .with_hint(3)
                            .with_next_scene("playful"),
                        Choice::premium("c3", "I couldn't stop thinking about your profile.")
                            .with_tone("bold")
                            .with_hint(5)
                            .with_next_scene("bold"),
                    ],
                },
            },
            Scene {
                id: "polite".into(),
                line: "Not at all, I was just reading. It's nice to have someone to talk to.".into(),
                emotion: Mood::Happy,
                inner_thought: None,
                kind: SceneKind::Line {
                    next: "outro".into(),
                },
            },
            Scene {
                id: "playful".into(),
                line: "Ha, smooth. Let's see if you can keep that up.".into(),
                emotion: Mood::Playful,
                inner_thought: Some("Cute.".into()),
                kind: SceneKind::Line {
                    next: "outro".into(),
                },
            },
            Scene {
                id: "bold".into(),
                line: "W-wait, really? You're making me blush...".into(),
                emotion: Mood::Shy,
                inner_thought: Some("Nobody has said that to me in a long time.".into()),
                kind: SceneKind::Line {
                    next: "outro".into(),
                },
            },
            Scene {
                id: "outro".into(),
                line: "So, tell me something about yourself.".into(),
                emotion: Mood::Happy,
                inner_thought: None,
                kind: SceneKind::End,
            },
        ];
        Script {
            id: "onboarding".into(),
            start: "intro".into(),
            scenes: scenes.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }
}

/// All scripts known to the process, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ScriptLibrary {
    scripts: HashMap<String, Script>,
}

impl ScriptLibrary {
    pub fn with_builtin() -> Self {
        let mut lib = Self::default();
        lib.insert(Script::onboarding());
        lib
    }

    pub fn insert(&mut self, script: Script) {
        self.scripts.insert(script.id.clone(), script);
    }

    pub fn get(&self, id: &str) -> Option<&Script> {
        self.scripts.get(id)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Load every `*.toml` script in `dir` on top of the built-ins.
    /// A missing directory is not an error; invalid scripts are skipped.
    pub async fn load_dir<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let mut lib = Self::with_builtin();
        let dir = dir.as_ref();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::info!("No script directory at {} ({}), using built-in scripts", dir.display(), e);
                return Ok(lib);
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            match Script::from_toml(&raw) {
                Ok(script) => {
                    tracing::info!("Loaded script '{}' from {}", script.id, path.display());
                    lib.insert(script);
                }
                Err(e) => tracing::warn!("Skipping invalid script {}: {:#}", path.display(), e),
            }
        }
        Ok(lib)
    }
}
