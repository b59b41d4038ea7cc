//! Conversation runtime: the per-session orchestrator, the LLM/tool
//! loop, and the memory recall gate.

mod chat_loop;
mod orchestrator;
mod recall_gate;

pub use chat_loop::{flatten_blocks, run_chat_loop, ChatLoopOutcome};
pub use orchestrator::Orchestrator;
pub use recall_gate::{is_explicit_memory_query, quick_recall_decision, RecallGate};
