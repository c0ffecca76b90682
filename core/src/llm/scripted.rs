//! Deterministic in-process engine
//!
//! Replays canned replies in small chunks and keeps a real transcript
//! checkpoint, so session handling can be exercised without a model. Used by
//! the tests and by the CLI's `--offline` mode.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    CompiledGrammar, EngineLoader, EngineState, InferenceEngine, Message, MessageRole,
    SamplingConfig, TokenStream,
};
use crate::config::ModelConfig;
use crate::error::{PlannerError, Result};
use crate::npc::grammar;

/// Produces the full reply for a context (transcript plus new turn)
pub type Responder = Arc<dyn Fn(&[Message]) -> String + Send + Sync>;

/// One call to `generate`, as the engine saw it
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRecord {
    /// Transcript before the turn was fed
    pub context: Vec<Message>,
    pub turn: Vec<Message>,
    pub grammar: Option<String>,
}

/// Shared view of every generation an engine (and its clones) performed
pub type GenerationLog = Arc<Mutex<Vec<GenerationRecord>>>;

const CHUNK_CHARS: usize = 3;

#[derive(Clone)]
pub struct ScriptedEngine {
    transcript: Vec<Message>,
    responder: Responder,
    token_delay: Option<Duration>,
    reject_grammars: bool,
    log: GenerationLog,
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("transcript_len", &self.transcript.len())
            .field("token_delay", &self.token_delay)
            .field("reject_grammars", &self.reject_grammars)
            .finish()
    }
}

impl ScriptedEngine {
    pub fn new(responder: Responder) -> Self {
        Self {
            transcript: Vec::new(),
            responder,
            token_delay: None,
            reject_grammars: false,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reply with each entry in turn, repeating the last one once exhausted
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(replies.into_iter().map(Into::into).collect()));
        Self::new(Arc::new(move |_context: &[Message]| {
            let mut queue = queue.lock();
            if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            }
        }))
    }

    /// Offline stand-in: decision prompts get a (deliberately sloppy) JSON
    /// answer, anything else is echoed back
    pub fn offline() -> Self {
        Self::new(Arc::new(|context: &[Message]| {
            let wants_json = context
                .iter()
                .any(|m| m.role == MessageRole::System && m.content.contains("JSON object"));
            if wants_json {
                r#"Sure! {"action":"move_near_ping","target_x":0,"target_y":0} is my pick."#
                    .to_string()
            } else {
                let last = context
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                format!("(offline) {}", last)
            }
        }))
    }

    /// Sleep before every chunk
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Refuse every grammar, like a backend without grammar support
    pub fn rejecting_grammars(mut self) -> Self {
        self.reject_grammars = true;
        self
    }

    pub fn log(&self) -> GenerationLog {
        Arc::clone(&self.log)
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }
}

fn chunk(reply: &str) -> Vec<String> {
    let chars: Vec<char> = reply.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

impl InferenceEngine for ScriptedEngine {
    fn generate<'a>(
        &'a mut self,
        turn: &'a [Message],
        sampling: &'a SamplingConfig,
        grammar: Option<&'a CompiledGrammar>,
    ) -> TokenStream<'a> {
        self.log.lock().push(GenerationRecord {
            context: self.transcript.clone(),
            turn: turn.to_vec(),
            grammar: grammar.map(|g| g.source().to_string()),
        });

        let mut context = self.transcript.clone();
        context.extend_from_slice(turn);
        let chunks = chunk(&(self.responder)(&context));

        self.transcript.extend_from_slice(turn);
        self.transcript.push(Message::assistant(String::new()));

        let delay = self.token_delay;
        let transcript = &mut self.transcript;

        Box::pin(async_stream::stream! {
            let stops: Vec<&str> = sampling
                .stop_sequences
                .iter()
                .map(String::as_str)
                .filter(|s| !s.is_empty())
                .collect();
            // A stop sequence may straddle chunks, so its possible prefix is held back
            let hold_back = stops.iter().map(|s| s.len()).max().unwrap_or(0).saturating_sub(1);

            let mut produced = String::new();
            let mut emitted = 0;
            let mut stopped = false;
            for (index, piece) in chunks.into_iter().enumerate() {
                if index >= sampling.max_tokens as usize {
                    break;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                produced.push_str(&piece);

                let stop_at = stops.iter().filter_map(|s| produced.find(*s)).min();
                let mut end = match stop_at {
                    Some(pos) => pos,
                    None => produced.len().saturating_sub(hold_back),
                };
                while end > emitted && !produced.is_char_boundary(end) {
                    end -= 1;
                }

                if end > emitted {
                    let piece = produced[emitted..end].to_string();
                    emitted = end;
                    if let Some(last) = transcript.last_mut() {
                        last.content.push_str(&piece);
                    }
                    yield Ok::<_, PlannerError>(piece);
                }

                if stop_at.is_some() {
                    stopped = true;
                    break;
                }
            }

            if !stopped && emitted < produced.len() {
                let rest = produced[emitted..].to_string();
                if let Some(last) = transcript.last_mut() {
                    last.content.push_str(&rest);
                }
                yield Ok(rest);
            }
        })
    }

    fn save_state(&self) -> EngineState {
        EngineState::from_transcript(&self.transcript)
    }

    fn load_state(&mut self, state: &EngineState) -> Result<()> {
        self.transcript = state.to_transcript()?;
        Ok(())
    }

    fn compile_grammar(&self, gbnf: &str) -> Result<CompiledGrammar> {
        if self.reject_grammars {
            return Err(PlannerError::Grammar {
                reason: "grammar sampling is not supported by this engine".to_string(),
            });
        }
        grammar::validate(gbnf).map_err(|e| PlannerError::Grammar {
            reason: e.to_string(),
        })?;
        Ok(CompiledGrammar::new(gbnf))
    }
}

/// Hands out fresh copies of a template engine
#[derive(Clone)]
pub struct ScriptedLoader {
    template: ScriptedEngine,
    load_delay: Option<Duration>,
    failure: Option<String>,
    loads: Arc<AtomicUsize>,
}

impl ScriptedLoader {
    pub fn new(template: ScriptedEngine) -> Self {
        Self {
            template,
            load_delay: None,
            failure: None,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulate slow weight loading
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Every load fails with `ModelLoad`
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Number of load attempts so far
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for ScriptedLoader {
    type Engine = ScriptedEngine;

    async fn load(&self, model: &ModelConfig) -> Result<ScriptedEngine> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(PlannerError::ModelLoad {
                path: model.path.clone(),
                reason: reason.clone(),
            });
        }
        Ok(self.template.clone())
    }
}
