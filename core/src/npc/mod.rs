//! NPC decision protocol
//!
//! Structured game state in, validated decision out. Everything here except
//! [`planner`] is pure and synchronous.

pub mod extract;
pub mod grammar;
pub mod planner;
pub mod prompt;
pub mod repair;
pub mod types;

pub use extract::{contains_complete_object, try_extract_first_json_object};
pub use grammar::{build_grammar, Grammar, GrammarError};
pub use planner::NpcPlanner;
pub use prompt::{normalize, PromptBuilder};
pub use repair::{fallback_decision, parse_and_repair, repair, resolve, Proposal, RejectionReason};
pub use types::{
    Behavior, Decision, DecisionRequest, DecisionSchema, DecisionTrace, GridPos, NpcAction,
    MAX_GRID_SIZE,
};
