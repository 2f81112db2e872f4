pub mod agent;
pub mod config;
pub mod database;
pub mod error;
pub mod http_client;
pub mod llm_client;
pub mod runtime;
pub mod server;

pub use agent::{ChatEngine, Engagement, EngagementState, EngineConfig, SubmitOutcome};
pub use database::{ConversationStore, PersonalityProfile, Sender, Turn};
pub use error::{ChatError, ChatResult};
