// Chatvend — a Telegram bot that sells credit-metered LLM chat.
// Library surface for the binary and the integration tests.

pub mod atoms;
pub mod engine;

pub use atoms::config::AppConfig;
pub use atoms::error::{EngineError, EngineResult};
pub use engine::state::EngineState;
