pub mod api_types;
pub mod dialogue;
pub mod engine;
pub mod extraction;
pub mod llm;
pub mod prompts;
pub mod providers;
pub mod retry;

pub use dialogue::{DialogueEngine, DialogueOutput, GenerationRequest};
pub use engine::{ChatEngine, Paywall, ScenarioResponse, TurnOutcome, TurnRequest};
pub use llm::{CompletionParams, LlmClient};
