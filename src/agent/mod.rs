pub mod approval;
pub mod handler;
pub mod history;
pub mod interrupt;
pub mod llm_client;
pub mod orchestrator;
pub mod prompt;
pub mod sse;

pub use approval::{ApprovalGate, ApprovalPrompt, BatchDecision, CommandDecision, ScriptedPrompt, StdinPrompt};
pub use handler::{CommandDispatcher, ExternalHandler};
pub use history::{Message, Role};
pub use interrupt::InterruptHandle;
pub use llm_client::{ChatClient, OpenAiCompatClient, ScriptedChatClient};
pub use orchestrator::{Agent, FileStat, TurnOutcome, TurnReport, TurnRollback};
