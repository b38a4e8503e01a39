pub mod analytics;
pub mod choice;
pub mod config;
pub mod emotion;
pub mod error;
pub mod gate;
pub mod persona;
pub mod relationship;
pub mod scenario;
pub mod script;
pub mod sentiment;
pub mod session;

pub use analytics::{AnalyticsEvent, AnalyticsSink, ChannelAnalytics, TracingAnalytics};
pub use choice::{Choice, ChoiceData};
pub use config::HeartlineConfig;
pub use emotion::{EmotionalState, Mood};
pub use error::{ChatError, ChatResult};
pub use gate::{ChoiceGate, ChoicePartition, EntitlementCheck, GateDecision, StaticEntitlement};
pub use persona::{PersonaDirectory, PersonaProfile, StaticPersonaDirectory};
pub use relationship::{
    RelationshipDelta, RelationshipStage, RelationshipState, StageTable, StageTransition,
};
pub use scenario::{ScenarioTrigger, ScenarioTriggerSignal, ScenarioType, SuppressionScope};
pub use script::{Scene, SceneKind, Script, ScriptLibrary};
pub use session::{ConversationSession, Message, Role, DEFAULT_SCENE};

use async_trait::async_trait;

/// Compresses older conversation into the rolling context summary.
///
/// SessionManager decides when and over which window; the implementation
/// (normally the LLM) decides how.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, previous_summary: &str, messages: &[Message]) -> anyhow::Result<String>;
}
