//! Inference engine interface
//!
//! The planner treats the language model as an opaque text-completion oracle.
//! Everything it needs from a backend is captured by [`InferenceEngine`]
//! (generation plus state checkpoints) and [`EngineLoader`] (weight loading).

pub mod bootstrap;
pub mod client;
pub mod scripted;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{PlannerError, Result};

pub use client::{LlamaServerEngine, LlamaServerLoader};
pub use scripted::{ScriptedEngine, ScriptedLoader};

/// Role of message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Single message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub repeat_penalty: f32,
    pub repeat_last_tokens_count: u32,
    pub stop_sequences: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 96,
            repeat_penalty: 1.1,
            repeat_last_tokens_count: 64,
            stop_sequences: Vec::new(),
        }
    }
}

/// Opaque snapshot of an engine's internal state.
///
/// Only the session manager holds these; callers never see one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineState(Vec<u8>);

impl EngineState {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checkpoint for engines whose whole state is the processed transcript
    pub(crate) fn from_transcript(transcript: &[Message]) -> Self {
        Self(serde_json::to_vec(transcript).unwrap_or_default())
    }

    pub(crate) fn to_transcript(&self) -> Result<Vec<Message>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&self.0).map_err(|e| PlannerError::StateRestore {
            reason: e.to_string(),
        })
    }
}

/// Grammar text that an engine accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledGrammar {
    source: String,
}

impl CompiledGrammar {
    pub(crate) fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Lazily produced token strings, strictly ordered
pub type TokenStream<'a> = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'a>>;

/// A loaded model plus its execution context.
///
/// `generate` feeds `turn` on top of the current state and streams the
/// assistant reply. The reply becomes part of the state token by token, so a
/// stream dropped halfway leaves the state holding the partial reply.
pub trait InferenceEngine: Send + 'static {
    fn generate<'a>(
        &'a mut self,
        turn: &'a [Message],
        sampling: &'a SamplingConfig,
        grammar: Option<&'a CompiledGrammar>,
    ) -> TokenStream<'a>;

    fn save_state(&self) -> EngineState;

    fn load_state(&mut self, state: &EngineState) -> Result<()>;

    /// Check that the engine can run with this grammar
    fn compile_grammar(&self, gbnf: &str) -> Result<CompiledGrammar>;
}

/// Loads weights and builds an engine (`loadWeights(path, contextSize, gpuLayers)`)
#[async_trait]
pub trait EngineLoader: Send + Sync {
    type Engine: InferenceEngine;

    async fn load(&self, model: &ModelConfig) -> Result<Self::Engine>;
}
