//! Turn-taking: prompt assembly and the orchestrator that drives the model.

pub mod orchestrator;
pub mod prompt;

pub use orchestrator::{
    DialogOrchestrator, DialogState, DialogStatus, IdleTracker, SummarySelection, TurnOutcome,
};
pub use prompt::{PromptBuilder, PromptInput, AUTO_TRIGGER_INSTRUCTION, DEFAULT_SYSTEM_PROMPT};
