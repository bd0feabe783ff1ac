//! Tiered conversation memory: a bounded short-term buffer of turns and a
//! long-term archive of summaries, coordinated by [`MemoryManager`].

pub mod long_term;
pub mod manager;
pub mod short_term;
pub mod store;
pub mod summarizer;
pub mod turn;

pub use long_term::{
    InMemorySummaryStore, NewSummary, SqliteSummaryStore, Summary, SummaryStats, SummaryStore,
    HIGH_IMPORTANCE,
};
pub use manager::{CompressionOutcome, MemoryManager, MemoryStats};
pub use short_term::{ShortTermMemory, StoredTurn};
pub use store::{InMemoryListStore, ShortTermStore, SledListStore};
pub use summarizer::Summarizer;
pub use turn::{
    estimate_tokens, AssistantTurn, ContextMessage, ContextRole, Turn, UserInput, UserTurn,
};
