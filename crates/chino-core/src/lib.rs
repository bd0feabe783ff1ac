//! Chino core: the coordination layer of a real-time voice assistant.
//!
//! Components talk through the [`bus::EventBus`]. The [`memory::MemoryManager`] keeps a
//! bounded short-term buffer and folds old turns into long-term summaries, the
//! [`dialog::DialogOrchestrator`] turns transcripts into structured replies, and the
//! [`router::TokenRouter`] fans reply sentences out to synthesis lanes while keeping
//! playback order. [`registry::CoreRegistry`] wires them together from a [`config::CoreConfig`].

pub mod bus;
pub mod config;
pub mod dialog;
pub mod error;
pub mod llm;
pub mod memory;
pub mod registry;
pub mod router;

pub use bus::{Event, EventBus, EventPayload, Priority};
pub use config::CoreConfig;
pub use dialog::{DialogOrchestrator, TurnOutcome};
pub use error::{CoreError, CoreResult};
pub use llm::{LanguageModel, LlmBackend, ReplySentence};
pub use memory::MemoryManager;
pub use registry::{CoreRegistry, RegistryBuilder};
pub use router::TokenRouter;
