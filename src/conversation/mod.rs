//! Conversation sessions triggered by the wake listener

mod chunker;
mod orchestrator;
mod session;

pub use chunker::SentenceChunker;
pub use orchestrator::{Collaborators, ConversationOrchestrator, OrchestratorPhase};
pub use session::{
    ConversationSession, MissReason, SessionEnd, SessionSummary, TurnResult,
};
