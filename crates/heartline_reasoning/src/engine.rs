//! ChatEngine: one chat turn, from request to committed state.
//!
//! Order of a turn: resolve the session, validate the selection, gate
//! premium choices, produce the reply (scene graph or LLM), then commit the
//! messages, session and relationship together. A lost version race
//! re-reads state and re-applies the same reply; the LLM is never called
//! twice for one turn.

use crate::dialogue::{scripted_delta, DialogueEngine, DialogueOutput, GenerationRequest};
use crate::llm::{CompletionParams, LlmClient};
use heartline_core::analytics::TracingAnalytics;
use heartline_core::config::HeartlineConfig;
use heartline_core::scenario::ScenarioRule;
use heartline_core::script::ScriptError;
use heartline_core::{
    AnalyticsEvent, AnalyticsSink, ChatError, ChatResult, Choice, ChoiceData, ChoiceGate, ConversationSession,
    EntitlementCheck, GateDecision, Message, Mood, PersonaDirectory, PersonaProfile, RelationshipState,
    ScenarioTrigger, ScenarioTriggerSignal, ScenarioType, ScriptLibrary, StageTransition,
};
use heartline_memory::{
    ConversationStore, NicknameUpdate, RelationshipTracker, SessionManager, StoreError, TurnCommit, TurnReceipt,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const MAX_MESSAGE_CHARS: usize = 4_000;

// ============================================================================
// Turn types
// ============================================================================

/// Client chat request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub persona_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub choice_data: Option<ChoiceData>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paywall {
    pub choice_id: String,
    pub tease: String,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: Uuid,
    /// The new assistant message. `None` for paywall turns, which write nothing.
    pub message_id: Option<Uuid>,
    pub content: String,
    pub emotion: Mood,
    pub inner_thought: Option<String>,
    pub choices: Vec<Choice>,
    pub affection_change: i32,
    pub token_balance: Option<i64>,
    pub scenario_trigger: Option<ScenarioTriggerSignal>,
    pub paywall: Option<Paywall>,
    pub relationship: RelationshipState,
    pub stage_changed: Option<StageTransition>,
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct ScenarioResponse {
    pub session: ConversationSession,
    pub scenario_type: ScenarioType,
    pub accepted: bool,
    /// Opening line written on acceptance, if the scenario has one.
    pub opening: Option<Message>,
}

/// A choice picked from the latest assistant message.
#[derive(Debug, Clone)]
struct Selection {
    message_id: Uuid,
    choice: Choice,
    presented: Vec<Choice>,
}

#[derive(Debug, Clone, PartialEq)]
enum SceneMove {
    Stay,
    Goto(String),
    Freeform,
}

/// What a turn writes. Computed once, re-applied to fresh state on conflict.
#[derive(Debug, Clone)]
struct TurnPlan {
    user_text: String,
    reply: DialogueOutput,
    selection: Option<(Uuid, String)>,
    origin_scene: String,
    origin_episode: Option<String>,
    scene: SceneMove,
}

struct Committed {
    receipt: TurnReceipt,
    stage_changed: Option<StageTransition>,
    signal: ScenarioTriggerSignal,
}

// ============================================================================
// Engine
// ============================================================================

pub struct ChatEngine {
    sessions: SessionManager,
    tracker: RelationshipTracker,
    dialogue: DialogueEngine,
    gate: ChoiceGate,
    trigger: ScenarioTrigger,
    entitlement: Arc<dyn EntitlementCheck>,
    analytics: Arc<dyn AnalyticsSink>,
    commit_retries: u32,
}

impl ChatEngine {
    pub fn new(
        sessions: SessionManager,
        tracker: RelationshipTracker,
        dialogue: DialogueEngine,
        trigger: ScenarioTrigger,
        entitlement: Arc<dyn EntitlementCheck>,
    ) -> Self {
        let gate = ChoiceGate::new(dialogue.config().tease_chars);
        let commit_retries = sessions.config().commit_retries.max(1);
        Self {
            sessions,
            tracker,
            dialogue,
            gate,
            trigger,
            entitlement,
            analytics: Arc::new(TracingAnalytics),
            commit_retries,
        }
    }

    /// Wire every component from one config.
    pub fn from_config(
        cfg: &HeartlineConfig,
        store: Arc<dyn ConversationStore>,
        personas: Arc<dyn PersonaDirectory>,
        scripts: Arc<ScriptLibrary>,
        llm: Arc<dyn LlmClient>,
        entitlement: Arc<dyn EntitlementCheck>,
    ) -> anyhow::Result<Self> {
        let table = cfg.relationship.stage_table()?;
        let sessions = SessionManager::new(store.clone(), personas, scripts, cfg.session.clone());
        let tracker = RelationshipTracker::new(store, table, cfg.relationship.cas_retries);
        let dialogue = DialogueEngine::new(llm, cfg.dialogue.clone(), CompletionParams::from(&cfg.llm));
        Ok(Self::new(
            sessions,
            tracker,
            dialogue,
            cfg.scenario.build_trigger(),
            entitlement,
        ))
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tracker(&self) -> &RelationshipTracker {
        &self.tracker
    }

    // ------------------------------------------------------------------------
    // Chat turn
    // ------------------------------------------------------------------------

    pub async fn chat_turn(&self, user_id: &str, req: TurnRequest) -> ChatResult<TurnOutcome> {
        let text = req.message.trim();
        if text.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::InvalidRequest(format!(
                "message must be at most {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        if text.is_empty() && req.choice_data.is_none() {
            return Err(ChatError::InvalidRequest("message must not be empty".into()));
        }

        let resolved = self.sessions.resolve(user_id, &req.persona_id, req.session_id).await?;
        let session = resolved.session;
        let persona = resolved.persona;
        let relationship = self.tracker.get(user_id, &req.persona_id).await?;

        let selection = match &req.choice_data {
            Some(data) => Some(self.resolve_selection(&session, data).await?),
            None => None,
        };

        // Gate before anything is generated
        if let Some(sel) = &selection {
            let decision = self
                .gate
                .authorize(user_id, &sel.choice, self.entitlement.as_ref())
                .await;
            if let GateDecision::PaywallRequired { choice_id, tease } = decision {
                self.analytics.emit(AnalyticsEvent::PaywallHit {
                    user_id: user_id.to_string(),
                    persona_id: req.persona_id.clone(),
                    session_id: session.id,
                    choice_id: choice_id.clone(),
                });
                return Ok(TurnOutcome {
                    session_id: session.id,
                    message_id: None,
                    content: tease.clone(),
                    emotion: session.emotional_state.mood,
                    inner_thought: None,
                    choices: sel.presented.clone(),
                    affection_change: 0,
                    token_balance: self.token_balance(user_id).await,
                    scenario_trigger: None,
                    paywall: Some(Paywall { choice_id, tease }),
                    relationship,
                    stage_changed: None,
                    degraded: false,
                });
            }
        }

        let user_text = match (&selection, text.is_empty()) {
            (Some(sel), true) => sel.choice.text.clone(),
            _ => text.to_string(),
        };
        let selected = selection.as_ref().map(|s| &s.choice);

        let (reply, scene) = match self.scripted_reply(&session, selected, &user_text)? {
            Some(scripted) => scripted,
            None => {
                self.generated_reply(&session, &relationship, &persona, &user_text, selected)
                    .await?
            }
        };

        let plan = TurnPlan {
            user_text,
            selection: selection.as_ref().map(|s| (s.message_id, s.choice.id.clone())),
            origin_scene: session.current_scene.clone(),
            origin_episode: session.current_episode.clone(),
            reply,
            scene,
        };
        let committed = self.commit_with_retry(session, relationship, &plan).await?;
        self.emit_turn_events(&committed, &plan);

        let receipt = committed.receipt;
        if let Some(summarized) = self
            .sessions
            .maybe_summarize(&receipt.session, &self.dialogue)
            .await
        {
            tracing::debug!("Session {} summary refreshed (v{})", summarized.id, summarized.version);
        }

        let relationship = receipt
            .relationship
            .ok_or_else(|| ChatError::Internal(anyhow::anyhow!("turn committed without relationship state")))?;
        let reply_message = receipt.messages.last();
        Ok(TurnOutcome {
            session_id: receipt.session.id,
            message_id: reply_message.map(|m| m.id),
            content: plan.reply.utterance,
            emotion: plan.reply.emotion,
            inner_thought: plan.reply.inner_thought,
            choices: reply_message.map(|m| m.choices_presented.clone()).unwrap_or_default(),
            affection_change: plan.reply.delta.affection,
            token_balance: self.token_balance(user_id).await,
            scenario_trigger: committed.signal.should_start.then_some(committed.signal),
            paywall: None,
            relationship,
            stage_changed: committed.stage_changed,
            degraded: plan.reply.degraded.is_some(),
        })
    }

    /// Choices may only be picked from the latest assistant message.
    async fn resolve_selection(&self, session: &ConversationSession, data: &ChoiceData) -> ChatResult<Selection> {
        let invalid = || ChatError::InvalidChoiceSelection {
            choice_id: data.choice_id.clone(),
            message_id: data.message_id,
        };
        let latest = self
            .sessions
            .store()
            .latest_assistant_message(session.id)
            .await?
            .ok_or_else(invalid)?;
        if data.message_id.is_some_and(|id| id != latest.id) {
            tracing::debug!(
                "Rejected selection '{}' on stale message in session {}",
                data.choice_id,
                session.id
            );
            return Err(invalid());
        }
        let choice = latest.validate_selection(&data.choice_id)?.clone();
        Ok(Selection {
            message_id: latest.id,
            choice,
            presented: latest.choices_presented.clone(),
        })
    }

    /// Serve the turn from the session's scene graph, if it is in one.
    fn scripted_reply(
        &self,
        session: &ConversationSession,
        selected: Option<&Choice>,
        user_text: &str,
    ) -> ChatResult<Option<(DialogueOutput, SceneMove)>> {
        let Some(script) = session
            .current_episode
            .as_deref()
            .and_then(|id| self.sessions.scripts().get(id))
        else {
            return Ok(None);
        };

        // A fresh session has not shown its first scene yet
        let scene = if session.last_sequence == 0 {
            script.scene(&session.current_scene)
        } else {
            match script.advance(&session.current_scene, selected) {
                // Free text at a branch: present the branch again
                Err(ScriptError::ChoiceRequired { .. }) => script.scene(&session.current_scene),
                other => other,
            }
        };
        let scene = match scene {
            Ok(scene) => scene,
            Err(ScriptError::ChoiceNotOffered { choice, .. }) => {
                return Err(ChatError::InvalidChoiceSelection {
                    choice_id: choice,
                    message_id: None,
                })
            }
            Err(ScriptError::Finished(id)) => {
                tracing::warn!("Session {} was left at the end of script '{}'", session.id, id);
                return Ok(None);
            }
            Err(e) => {
                tracing::error!("Script '{}' broken for session {}: {}", script.id, session.id, e);
                return Err(ChatError::SessionNotResumable(format!("script {} is broken", script.id)));
            }
        };

        let mut choices = scene.choices();
        ChoiceGate::ensure_free_choice(&mut choices);
        let next = if scene.is_end() {
            SceneMove::Freeform
        } else {
            SceneMove::Goto(scene.id.clone())
        };
        tracing::debug!("Session {} scripted scene '{}:{}'", session.id, script.id, scene.id);
        Ok(Some((
            DialogueOutput {
                utterance: scene.line.clone(),
                emotion: scene.emotion,
                inner_thought: scene.inner_thought.clone(),
                choices,
                delta: scripted_delta(selected, user_text, self.dialogue.config()),
                end_scene: scene.is_end(),
                degraded: None,
            },
            next,
        )))
    }

    async fn generated_reply(
        &self,
        session: &ConversationSession,
        relationship: &RelationshipState,
        persona: &PersonaProfile,
        user_text: &str,
        selected: Option<&Choice>,
    ) -> ChatResult<(DialogueOutput, SceneMove)> {
        let scenario = self.active_scenario(session);
        let recent = self
            .sessions
            .recent_messages(session.id, self.dialogue.config().recent_messages)
            .await?;
        let reply = self
            .dialogue
            .generate(&GenerationRequest {
                session,
                relationship,
                persona,
                recent: &recent,
                user_input: user_text,
                selected,
                scenario,
            })
            .await;

        let scene = match (&session.current_episode, scenario) {
            (None, _) => SceneMove::Stay,
            (Some(_), Some(_)) if !reply.end_scene => SceneMove::Stay,
            // Scene finished, or the episode no longer exists
            (Some(_), _) => SceneMove::Freeform,
        };
        Ok((reply, scene))
    }

    fn active_scenario(&self, session: &ConversationSession) -> Option<&ScenarioRule> {
        let episode = session.current_episode.as_deref()?;
        let scenario_type = ScenarioType::parse(episode.strip_prefix("scenario:")?)?;
        self.trigger
            .rules()
            .iter()
            .find(|r| r.scenario_type == scenario_type)
    }

    /// Post-turn state for `plan` on top of the given session and relationship.
    fn apply_plan(
        &self,
        session: &ConversationSession,
        relationship: &RelationshipState,
        plan: &TurnPlan,
    ) -> (TurnCommit, Option<StageTransition>, ScenarioTriggerSignal) {
        let now = chrono::Utc::now();
        let mut next = session.clone();
        next.emotional_state = session.emotional_state.transition(plan.reply.emotion);
        match &plan.scene {
            SceneMove::Stay => {}
            SceneMove::Goto(scene) => next.current_scene = scene.clone(),
            SceneMove::Freeform => next.return_to_freeform(),
        }

        let mut rel = relationship.clone();
        let stage_changed = rel.apply_delta(&plan.reply.delta, self.tracker.table(), now);

        // User message first, so the reply lands at last_sequence + 2
        let reply_sequence = session.last_sequence + 2;
        let choices = plan
            .reply
            .choices
            .iter()
            .cloned()
            .map(|c| c.scoped_to(reply_sequence))
            .collect();
        let messages = vec![
            Message::user(session.id, plan.user_text.clone()),
            Message::assistant(
                session.id,
                plan.reply.utterance.clone(),
                plan.reply.emotion,
                plan.reply.inner_thought.clone(),
                choices,
            ),
        ];

        // Rules see the session as it will be once this turn lands
        let preview = ConversationSession {
            last_sequence: next.last_sequence + messages.len() as u64,
            ..next.clone()
        };
        let signal = self.trigger.evaluate(&preview, &rel, &messages);
        if let Some(offered) = signal.scenario_type.filter(|_| signal.should_start) {
            next.offered_scenarios.insert(offered);
        }

        let commit = TurnCommit {
            session: next,
            messages,
            relationship: Some(rel),
            selection: plan.selection.clone(),
        };
        (commit, stage_changed, signal)
    }

    async fn commit_with_retry(
        &self,
        mut session: ConversationSession,
        mut relationship: RelationshipState,
        plan: &TurnPlan,
    ) -> ChatResult<Committed> {
        for attempt in 1..=self.commit_retries {
            // The reply was produced for a specific scene
            if session.current_scene != plan.origin_scene || session.current_episode != plan.origin_episode {
                return Err(ChatError::ConcurrentUpdateConflict {
                    resource: "session".into(),
                    attempts: attempt,
                });
            }

            let (commit, stage_changed, signal) = self.apply_plan(&session, &relationship, plan);
            match self.sessions.append_turn(&commit).await {
                Ok(receipt) => {
                    return Ok(Committed {
                        receipt,
                        stage_changed,
                        signal,
                    })
                }
                Err(StoreError::Conflict { resource }) if attempt < self.commit_retries => {
                    tracing::debug!(
                        "{} conflict committing turn for session {} (attempt {}), re-reading",
                        resource,
                        session.id,
                        attempt
                    );
                    tokio::task::yield_now().await;
                    session = self
                        .sessions
                        .store()
                        .get_session(session.id)
                        .await?
                        .filter(|s| s.active)
                        .ok_or_else(|| ChatError::SessionNotResumable("session ended during the turn".into()))?;
                    relationship = self.tracker.get(&session.user_id, &session.persona_id).await?;
                }
                Err(e) => {
                    if e.is_conflict() {
                        tracing::warn!(
                            "Turn for session {} still conflicting after {} attempts",
                            session.id,
                            attempt
                        );
                    }
                    return Err(e.into_chat_error(attempt));
                }
            }
        }
        Err(ChatError::ConcurrentUpdateConflict {
            resource: "session".into(),
            attempts: self.commit_retries,
        })
    }

    fn emit_turn_events(&self, committed: &Committed, plan: &TurnPlan) {
        let session = &committed.receipt.session;
        if let Some(t) = &committed.stage_changed {
            self.analytics.emit(AnalyticsEvent::StageTransition {
                user_id: session.user_id.clone(),
                persona_id: session.persona_id.clone(),
                from: t.from,
                to: t.to,
            });
        }
        if let Some(scenario_type) = committed.signal.scenario_type.filter(|_| committed.signal.should_start) {
            self.analytics.emit(AnalyticsEvent::ScenarioOffered {
                session_id: session.id,
                scenario_type,
            });
        }
        if let Some(reason) = &plan.reply.degraded {
            self.analytics.emit(AnalyticsEvent::GenerationDegraded {
                session_id: session.id,
                reason: reason.clone(),
            });
        }
    }

    async fn token_balance(&self, user_id: &str) -> Option<i64> {
        match self.entitlement.token_balance(user_id).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!("Token balance lookup failed for {}: {:#}", user_id, e);
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Scenario hand-off
    // ------------------------------------------------------------------------

    /// Accept or decline a scenario offered in this session.
    pub async fn respond_to_scenario(
        &self,
        user_id: &str,
        session_id: Uuid,
        scenario_type: ScenarioType,
        accepted: bool,
    ) -> ChatResult<ScenarioResponse> {
        for attempt in 1..=self.commit_retries {
            let session = self.sessions.owned_session(session_id, user_id).await?;
            if !session.active {
                return Err(ChatError::InvalidRequest(format!("session {} has ended", session_id)));
            }
            if !session.offered_scenarios.contains(&scenario_type) {
                return Err(ChatError::InvalidRequest(format!(
                    "scenario {} was not offered in this session",
                    scenario_type
                )));
            }
            let relationship = self.tracker.get(user_id, &session.persona_id).await?;

            let commit = if accepted {
                self.acceptance(session, scenario_type)?
            } else {
                self.refusal(session, relationship, scenario_type)
            };
            match self.sessions.append_turn(&commit).await {
                Ok(receipt) => {
                    let event = if accepted {
                        AnalyticsEvent::ScenarioAccepted {
                            session_id,
                            scenario_type,
                        }
                    } else {
                        AnalyticsEvent::ScenarioDeclined {
                            session_id,
                            scenario_type,
                        }
                    };
                    self.analytics.emit(event);
                    tracing::info!(
                        "Scenario {} {} in session {}",
                        scenario_type,
                        if accepted { "accepted" } else { "declined" },
                        session_id
                    );
                    return Ok(ScenarioResponse {
                        opening: receipt.messages.into_iter().last(),
                        session: receipt.session,
                        scenario_type,
                        accepted,
                    });
                }
                Err(StoreError::Conflict { .. }) if attempt < self.commit_retries => {
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into_chat_error(attempt)),
            }
        }
        Err(ChatError::ConcurrentUpdateConflict {
            resource: "session".into(),
            attempts: self.commit_retries,
        })
    }

    fn acceptance(&self, mut session: ConversationSession, scenario_type: ScenarioType) -> ChatResult<TurnCommit> {
        if !session.is_freeform() {
            return Err(ChatError::InvalidRequest("a scenario is already in progress".into()));
        }
        session.offered_scenarios.remove(&scenario_type);
        session.current_episode = Some(scenario_type.episode_id());
        session.current_scene = scenario_type.opening_scene();

        let mut messages = Vec::new();
        if let Some(script) = self.sessions.scripts().get(&scenario_type.episode_id()) {
            // Scripted scenarios open on their first scene right away
            let scene = script.scene(&script.start).map_err(|e| {
                tracing::error!("Scenario script '{}' is broken: {}", script.id, e);
                ChatError::SessionNotResumable(format!("script {} is broken", script.id))
            })?;
            let mut choices: Vec<Choice> = scene
                .choices()
                .into_iter()
                .map(|c| c.scoped_to(session.last_sequence + 1))
                .collect();
            ChoiceGate::ensure_free_choice(&mut choices);
            session.current_scene = scene.id.clone();
            session.emotional_state = session.emotional_state.transition(scene.emotion);
            messages.push(Message::assistant(
                session.id,
                scene.line.clone(),
                scene.emotion,
                scene.inner_thought.clone(),
                choices,
            ));
        } else if let Some(line) = self
            .trigger
            .rules()
            .iter()
            .find(|r| r.scenario_type == scenario_type)
            .and_then(|r| r.transition_message.clone())
        {
            messages.push(Message::system(session.id, line));
        }

        Ok(TurnCommit {
            session,
            messages,
            relationship: None,
            selection: None,
        })
    }

    fn refusal(
        &self,
        mut session: ConversationSession,
        mut relationship: RelationshipState,
        scenario_type: ScenarioType,
    ) -> TurnCommit {
        session.offered_scenarios.remove(&scenario_type);
        let before = relationship.declined_scenarios.len();
        self.trigger
            .record_decline(scenario_type, &mut session, &mut relationship);
        let relationship_changed = relationship.declined_scenarios.len() != before;
        TurnCommit {
            session,
            messages: Vec::new(),
            relationship: relationship_changed.then_some(relationship),
            selection: None,
        }
    }

    // ------------------------------------------------------------------------
    // Session and relationship operations
    // ------------------------------------------------------------------------

    /// Archive the current session and open a fresh one.
    pub async fn start_session(&self, user_id: &str, persona_id: &str) -> ChatResult<ConversationSession> {
        Ok(self.sessions.start_session(user_id, persona_id).await?.session)
    }

    pub async fn end_session(&self, user_id: &str, session_id: Uuid) -> ChatResult<bool> {
        self.sessions.end_session(session_id, user_id).await
    }

    pub async fn history(&self, user_id: &str, session_id: Uuid) -> ChatResult<Vec<Message>> {
        self.sessions.history(session_id, user_id).await
    }

    pub async fn relationship(&self, user_id: &str, persona_id: &str) -> ChatResult<RelationshipState> {
        self.sessions.persona(persona_id).await?;
        self.tracker.get(user_id, persona_id).await
    }

    pub async fn set_nicknames(
        &self,
        user_id: &str,
        persona_id: &str,
        update: NicknameUpdate,
    ) -> ChatResult<RelationshipState> {
        self.sessions.persona(persona_id).await?;
        self.tracker.set_nicknames(user_id, persona_id, update).await
    }
}
