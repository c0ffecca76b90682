pub mod config;
pub mod error;
pub mod llm;
pub mod npc;
pub mod session;

// Re-exports for convenience
pub use config::PlannerConfig;
pub use error::{ErrorKind, PlannerError, Result};
pub use npc::{Behavior, Decision, DecisionRequest, DecisionSchema, DecisionTrace, GridPos, NpcAction, NpcPlanner};
pub use session::{Lifecycle, SessionManager, SessionOptions};
