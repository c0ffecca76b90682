//! Session/runtime manager
//!
//! Owns the single inference engine and N conversation sessions that share
//! it. Each session carries a checkpoint of the engine state taken when it
//! was last switched away from; the active session's live state is the
//! engine's own.
//!
//! Every operation touching the engine goes through one suspending gate, so
//! at most one of them runs at a time. Initialization has its own gate.

pub mod checkpoint;

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ModelConfig, PlannerConfig};
use crate::error::{PlannerError, Result};
use crate::llm::{
    CompiledGrammar, EngineLoader, EngineState, InferenceEngine, Message, SamplingConfig,
    TokenStream,
};

pub use checkpoint::CheckpointGuard;

/// Manager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
}

/// What `initialize` builds
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub count: usize,
    /// Seed system message for every session
    pub system_prompt: Option<String>,
    pub model: ModelConfig,
}

impl SessionOptions {
    pub fn from_config(config: &PlannerConfig) -> Self {
        Self {
            count: config.sessions.count,
            system_prompt: config.sessions.system_prompt.clone(),
            model: config.model.clone(),
        }
    }
}

/// One conversation sharing the engine
#[derive(Debug, Clone)]
pub struct ConversationSession {
    id: Uuid,
    seed_system_prompt: Option<String>,
    messages: Vec<Message>,
    /// Messages already fed to the engine
    processed: usize,
    /// Engine state after `processed`; `None` until the session is first left
    checkpoint: Option<EngineState>,
}

impl ConversationSession {
    fn new(system_prompt: Option<String>) -> Self {
        let messages = system_prompt
            .iter()
            .map(|prompt| Message::system(prompt.clone()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            seed_system_prompt: system_prompt,
            messages,
            processed: 0,
            checkpoint: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

/// Everything behind the engine gate
struct Runtime<E> {
    engine: E,
    sessions: Vec<ConversationSession>,
    active: usize,
    /// Captured once right after loading
    empty_state: EngineState,
}

/// Input of one ephemeral completion
pub struct OneShotRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub sampling: &'a SamplingConfig,
    pub grammar: Option<&'a CompiledGrammar>,
    /// Stop as soon as this holds for the text produced so far
    pub stop_when: Option<&'a (dyn Fn(&str) -> bool + Send + Sync)>,
}

impl<'a> OneShotRequest<'a> {
    pub fn new(system_prompt: &'a str, user_prompt: &'a str, sampling: &'a SamplingConfig) -> Self {
        Self {
            system_prompt,
            user_prompt,
            sampling,
            grammar: None,
            stop_when: None,
        }
    }

    pub fn with_grammar(mut self, grammar: Option<&'a CompiledGrammar>) -> Self {
        self.grammar = grammar;
        self
    }

    pub fn stop_when(mut self, predicate: &'a (dyn Fn(&str) -> bool + Send + Sync)) -> Self {
        self.stop_when = Some(predicate);
        self
    }
}

/// Puts the lifecycle back to `Uninitialized` unless disarmed
struct InitReset<'a> {
    lifecycle: &'a RwLock<Lifecycle>,
    armed: bool,
}

impl Drop for InitReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.lifecycle.write() = Lifecycle::Uninitialized;
        }
    }
}

pub struct SessionManager<L: EngineLoader> {
    loader: L,
    options: SessionOptions,
    lifecycle: RwLock<Lifecycle>,
    init_gate: Mutex<()>,
    runtime: Arc<Mutex<Option<Runtime<L::Engine>>>>,
}

impl<L: EngineLoader> SessionManager<L> {
    pub fn new(loader: L, options: SessionOptions) -> Self {
        Self {
            loader,
            options,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            init_gate: Mutex::new(()),
            runtime: Arc::new(Mutex::new(None)),
        }
    }

    pub fn status(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    /// Load the model and build the sessions.
    ///
    /// Calls made while another initialization is running wait for it and
    /// return immediately once the manager is ready. A failed attempt leaves
    /// the manager `Uninitialized`, so it can be retried.
    pub async fn initialize(&self) -> Result<()> {
        let _init = self.init_gate.lock().await;
        if self.status() == Lifecycle::Ready {
            return Ok(());
        }
        if self.options.count == 0 {
            return Err(PlannerError::NoSessions);
        }

        *self.lifecycle.write() = Lifecycle::Initializing;
        let mut reset = InitReset {
            lifecycle: &self.lifecycle,
            armed: true,
        };

        tracing::info!(
            "Loading model {} for {} session(s)",
            self.options.model.path.display(),
            self.options.count
        );
        let engine = self.loader.load(&self.options.model).await?;
        let empty_state = engine.save_state();
        let sessions = (0..self.options.count)
            .map(|_| ConversationSession::new(self.options.system_prompt.clone()))
            .collect();

        *self.runtime.lock().await = Some(Runtime {
            engine,
            sessions,
            active: 0,
            empty_state,
        });

        reset.armed = false;
        *self.lifecycle.write() = Lifecycle::Ready;
        tracing::info!("Session manager ready");
        Ok(())
    }

    pub async fn active_index(&self) -> Result<usize> {
        let guard = self.runtime.lock().await;
        let runtime = guard.as_ref().ok_or(PlannerError::NotReady)?;
        Ok(runtime.active)
    }

    pub async fn session_count(&self) -> Result<usize> {
        let guard = self.runtime.lock().await;
        let runtime = guard.as_ref().ok_or(PlannerError::NotReady)?;
        Ok(runtime.sessions.len())
    }

    /// Copy of one session's message history
    pub async fn history(&self, index: usize) -> Result<Vec<Message>> {
        let guard = self.runtime.lock().await;
        let runtime = guard.as_ref().ok_or(PlannerError::NotReady)?;
        let session = runtime
            .sessions
            .get(index)
            .ok_or(PlannerError::SessionIndexOutOfRange {
                index,
                count: runtime.sessions.len(),
            })?;
        Ok(session.messages.clone())
    }

    /// Park the active session's state and resume session `index`
    pub async fn switch_active_session(&self, index: usize) -> Result<()> {
        let mut guard = self.runtime.lock().await;
        let runtime = guard.as_mut().ok_or(PlannerError::NotReady)?;

        let count = runtime.sessions.len();
        if index >= count {
            return Err(PlannerError::SessionIndexOutOfRange { index, count });
        }
        if index == runtime.active {
            return Ok(());
        }

        let outgoing = runtime.engine.save_state();
        runtime.sessions[runtime.active].checkpoint = Some(outgoing);

        let incoming = runtime.sessions[index]
            .checkpoint
            .as_ref()
            .unwrap_or(&runtime.empty_state);
        runtime.engine.load_state(incoming)?;
        runtime.active = index;

        tracing::debug!("Switched to session {}", index);
        Ok(())
    }

    /// Send a user message to the active session and stream the reply.
    ///
    /// The gate is held until the stream finishes or is dropped. The reply is
    /// recorded in the history token by token, so cancelling (through
    /// `cancel` or by dropping the stream) leaves the user message plus the
    /// partial reply, matching what the engine has processed. A cancelled
    /// stream ends with `PlannerError::Cancelled`.
    pub fn stream_chat(
        &self,
        user_message: impl Into<String>,
        sampling: SamplingConfig,
        cancel: CancellationToken,
    ) -> TokenStream<'static> {
        let gate = Arc::clone(&self.runtime);
        let user_message = user_message.into();

        Box::pin(async_stream::try_stream! {
            let mut guard = gate.lock_owned().await;
            let runtime = guard.as_mut().ok_or(PlannerError::NotReady)?;
            let Runtime { engine, sessions, active, .. } = runtime;
            let index = *active;
            let session = &mut sessions[index];

            let mut turn = session.messages[session.processed..].to_vec();
            turn.push(Message::user(user_message.clone()));
            session.messages.push(Message::user(user_message));
            session.messages.push(Message::assistant(String::new()));
            session.processed = session.messages.len();

            tracing::debug!("Session {} generating ({} new message(s))", index, turn.len());
            let mut tokens = engine.generate(&turn, &sampling, None);

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = tokens.next() => Some(next),
                };
                match next {
                    None => {
                        tracing::debug!("Session {} generation cancelled", index);
                        Err(PlannerError::Cancelled)?;
                    }
                    Some(None) => break,
                    Some(Some(token)) => {
                        let token = token?;
                        if let Some(reply) = session.messages.last_mut() {
                            reply.content.push_str(&token);
                        }
                        yield token;
                    }
                }
            }
        })
    }

    /// Run a throwaway system/user exchange without touching the active session.
    ///
    /// The engine state is saved, replaced with the empty state for the
    /// exchange, and restored afterwards on every path: success, early stop,
    /// error, cancellation, or the returned future being dropped. Cancelling
    /// through `cancel` returns the text produced so far.
    pub async fn complete_once(
        &self,
        request: OneShotRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut guard = self.runtime.lock().await;
        let runtime = guard.as_mut().ok_or(PlannerError::NotReady)?;
        let mut checkpoint = CheckpointGuard::divert(&mut runtime.engine, &runtime.empty_state)?;

        let turn = [
            Message::system(request.system_prompt),
            Message::user(request.user_prompt),
        ];
        let mut text = String::new();
        {
            let mut tokens = checkpoint
                .engine()
                .generate(&turn, request.sampling, request.grammar);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("One-shot completion cancelled after {} bytes", text.len());
                        break;
                    }
                    next = tokens.next() => next,
                };
                let Some(token) = next else { break };
                text.push_str(&token?);
                if request.stop_when.is_some_and(|stop| stop(&text)) {
                    break;
                }
            }
        }

        checkpoint.restore()?;
        Ok(text)
    }

    /// Reset the engine and start the active session over.
    ///
    /// Without a new system prompt the session keeps its original seed.
    pub async fn clear_active_history(&self, system_prompt: Option<String>) -> Result<()> {
        let mut guard = self.runtime.lock().await;
        let runtime = guard.as_mut().ok_or(PlannerError::NotReady)?;

        runtime.engine.load_state(&runtime.empty_state)?;
        let active = runtime.active;
        let seed = system_prompt.or_else(|| runtime.sessions[active].seed_system_prompt.clone());
        runtime.sessions[active] = ConversationSession::new(seed);

        tracing::debug!("Cleared session {}", active);
        Ok(())
    }

    /// Ask the engine whether it accepts this grammar
    pub async fn compile_grammar(&self, gbnf: &str) -> Result<CompiledGrammar> {
        let guard = self.runtime.lock().await;
        let runtime = guard.as_ref().ok_or(PlannerError::NotReady)?;
        runtime.engine.compile_grammar(gbnf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::GenerationLog;
    use crate::llm::{ScriptedEngine, ScriptedLoader};
    use std::time::Duration;

    fn options(count: usize) -> SessionOptions {
        SessionOptions {
            count,
            system_prompt: Some("You are a calculator.".to_string()),
            model: ModelConfig::default(),
        }
    }

    async fn ready(engine: ScriptedEngine, count: usize) -> (SessionManager<ScriptedLoader>, GenerationLog) {
        let log = engine.log();
        let manager = SessionManager::new(ScriptedLoader::new(engine), options(count));
        manager.initialize().await.unwrap();
        (manager, log)
    }

    async fn chat(manager: &SessionManager<ScriptedLoader>, text: &str) -> Result<String> {
        let mut stream = manager.stream_chat(text, SamplingConfig::default(), CancellationToken::new());
        let mut reply = String::new();
        while let Some(token) = stream.next().await {
            reply.push_str(&token?);
        }
        Ok(reply)
    }

    /// Engine transcript as seen by the most recent generation
    fn last_context(log: &GenerationLog) -> Vec<Message> {
        log.lock().last().map(|r| r.context.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_zero_sessions_fails_and_stays_uninitialized() {
        let manager = SessionManager::new(ScriptedLoader::new(ScriptedEngine::offline()), options(0));
        assert!(matches!(manager.initialize().await, Err(PlannerError::NoSessions)));
        assert_eq!(manager.status(), Lifecycle::Uninitialized);
    }

    #[tokio::test]
    async fn test_load_failure_is_retryable() {
        let loader = ScriptedLoader::new(ScriptedEngine::offline()).failing("corrupt weights");
        let manager = SessionManager::new(loader, options(1));

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, PlannerError::ModelLoad { .. }));
        assert!(err.is_retryable());
        assert_eq!(manager.status(), Lifecycle::Uninitialized);

        manager.initialize().await.unwrap_err();
        assert_eq!(manager.loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_loads_once() {
        let loader = ScriptedLoader::new(ScriptedEngine::offline())
            .with_load_delay(Duration::from_millis(20));
        let manager = SessionManager::new(loader, options(2));

        let (a, b) = tokio::join!(manager.initialize(), manager.initialize());
        a.unwrap();
        b.unwrap();
        manager.initialize().await.unwrap();

        assert_eq!(manager.loader.load_count(), 1);
        assert_eq!(manager.status(), Lifecycle::Ready);
        assert_eq!(manager.session_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_operations_before_initialize() {
        let manager = SessionManager::new(ScriptedLoader::new(ScriptedEngine::offline()), options(1));
        assert!(matches!(chat(&manager, "1+1").await, Err(PlannerError::NotReady)));
        assert!(matches!(
            manager.switch_active_session(0).await,
            Err(PlannerError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_stream_chat_records_history() {
        let (manager, log) = ready(ScriptedEngine::with_replies(["4", "9"]), 1).await;

        assert_eq!(chat(&manager, "2+2").await.unwrap(), "4");
        assert_eq!(chat(&manager, "3*3").await.unwrap(), "9");

        assert_eq!(
            manager.history(0).await.unwrap(),
            vec![
                Message::system("You are a calculator."),
                Message::user("2+2"),
                Message::assistant("4"),
                Message::user("3*3"),
                Message::assistant("9"),
            ]
        );
        // The seed is fed once, with the first turn only
        let records = log.lock();
        assert_eq!(records[0].turn.len(), 2);
        assert_eq!(records[1].turn, vec![Message::user("3*3")]);
    }

    #[tokio::test]
    async fn test_switch_keeps_sessions_independent() {
        let (manager, log) = ready(ScriptedEngine::with_replies(["a", "b", "c"]), 2).await;

        chat(&manager, "first").await.unwrap();
        let session0 = manager.history(0).await.unwrap();

        manager.switch_active_session(1).await.unwrap();
        assert_eq!(manager.active_index().await.unwrap(), 1);
        chat(&manager, "second").await.unwrap();
        assert!(last_context(&log).is_empty());

        manager.switch_active_session(0).await.unwrap();
        chat(&manager, "third").await.unwrap();
        assert_eq!(last_context(&log), session0);
        assert_eq!(manager.history(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_switch_out_of_range() {
        let (manager, _) = ready(ScriptedEngine::offline(), 2).await;
        match manager.switch_active_session(5).await {
            Err(PlannerError::SessionIndexOutOfRange { index, count }) => {
                assert_eq!((index, count), (5, 2));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(manager.active_index().await.unwrap(), 0);
        assert!(manager.history(2).await.is_err());
    }

    #[tokio::test]
    async fn test_complete_once_is_isolated() {
        let (manager, log) = ready(
            ScriptedEngine::with_replies(["4", r#"{"action":"hold","target_x":1,"target_y":1}"#, "6"]),
            1,
        )
        .await;
        chat(&manager, "2+2").await.unwrap();
        let history = manager.history(0).await.unwrap();

        let sampling = SamplingConfig::default();
        let text = manager
            .complete_once(OneShotRequest::new("sys", "user", &sampling), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, r#"{"action":"hold","target_x":1,"target_y":1}"#);
        // The ephemeral exchange started from the empty state
        assert!(last_context(&log).is_empty());

        chat(&manager, "3+3").await.unwrap();
        assert_eq!(last_context(&log), history);
        assert_eq!(&manager.history(0).await.unwrap()[..history.len()], &history[..]);
    }

    #[tokio::test]
    async fn test_complete_once_stops_on_predicate() {
        let (manager, _) = ready(ScriptedEngine::with_replies([r#"{"a":1} and more text"#]), 1).await;
        let sampling = SamplingConfig::default();
        let stop = |text: &str| text.contains('}');
        let text = manager
            .complete_once(
                OneShotRequest::new("sys", "user", &sampling).stop_when(&stop),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(text.starts_with(r#"{"a":1}"#));
        assert!(!text.contains("more"));
    }

    #[tokio::test]
    async fn test_complete_once_cancel_mid_stream_is_isolated() {
        let engine = ScriptedEngine::with_replies(["4", "a long reply that keeps going", "6"])
            .with_token_delay(Duration::from_millis(5));
        let (manager, log) = ready(engine, 1).await;
        chat(&manager, "2+2").await.unwrap();
        let history = manager.history(0).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(12)).await;
            trigger.cancel();
        });

        let sampling = SamplingConfig::default();
        let partial = manager
            .complete_once(OneShotRequest::new("sys", "user", &sampling), &cancel)
            .await
            .unwrap();
        assert!(partial.len() < "a long reply that keeps going".len());

        chat(&manager, "3+3").await.unwrap();
        assert_eq!(last_context(&log), history);
    }

    #[tokio::test]
    async fn test_complete_once_dropped_future_is_isolated() {
        let engine = ScriptedEngine::with_replies(["4", "a long reply that keeps going", "6"])
            .with_token_delay(Duration::from_millis(5));
        let (manager, log) = ready(engine, 1).await;
        chat(&manager, "2+2").await.unwrap();
        let history = manager.history(0).await.unwrap();

        let sampling = SamplingConfig::default();
        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(
            Duration::from_millis(12),
            manager.complete_once(OneShotRequest::new("sys", "user", &sampling), &cancel),
        )
        .await;
        assert!(result.is_err());

        chat(&manager, "3+3").await.unwrap();
        assert_eq!(last_context(&log), history);
    }

    #[tokio::test]
    async fn test_stream_chat_cancel_keeps_partial_reply() {
        let engine = ScriptedEngine::with_replies(["a long reply that keeps going"])
            .with_token_delay(Duration::from_millis(5));
        let (manager, _) = ready(engine, 1).await;

        let cancel = CancellationToken::new();
        let mut stream = manager.stream_chat("go", SamplingConfig::default(), cancel.clone());
        let first = stream.next().await.unwrap().unwrap();
        cancel.cancel();
        assert!(matches!(stream.next().await, Some(Err(PlannerError::Cancelled))));
        assert!(stream.next().await.is_none());
        drop(stream);

        let history = manager.history(0).await.unwrap();
        assert_eq!(history[1], Message::user("go"));
        assert_eq!(history[2], Message::assistant(first));
    }

    #[tokio::test]
    async fn test_dropped_stream_keeps_partial_reply() {
        let engine = ScriptedEngine::with_replies(["a long reply that keeps going", "ok"])
            .with_token_delay(Duration::from_millis(5));
        let (manager, log) = ready(engine, 1).await;

        let mut stream = manager.stream_chat("go", SamplingConfig::default(), CancellationToken::new());
        let first = stream.next().await.unwrap().unwrap();
        drop(stream);

        let history = manager.history(0).await.unwrap();
        assert_eq!(
            history,
            vec![
                Message::system("You are a calculator."),
                Message::user("go"),
                Message::assistant(first),
            ]
        );

        // The engine saw exactly the recorded history before the next turn
        assert_eq!(chat(&manager, "again").await.unwrap(), "ok");
        assert_eq!(last_context(&log), history);
        assert_eq!(log.lock().last().unwrap().turn, vec![Message::user("again")]);
    }

    #[tokio::test]
    async fn test_clear_active_history() {
        let (manager, log) = ready(ScriptedEngine::with_replies(["4", "5"]), 2).await;
        chat(&manager, "2+2").await.unwrap();

        manager.clear_active_history(None).await.unwrap();
        assert_eq!(
            manager.history(0).await.unwrap(),
            vec![Message::system("You are a calculator.")]
        );
        chat(&manager, "2+3").await.unwrap();
        assert!(last_context(&log).is_empty());

        manager.clear_active_history(Some("Be terse.".to_string())).await.unwrap();
        assert_eq!(manager.history(0).await.unwrap(), vec![Message::system("Be terse.")]);
    }

    #[tokio::test]
    async fn test_compile_grammar_through_engine() {
        let (manager, _) = ready(ScriptedEngine::offline(), 1).await;
        assert!(manager.compile_grammar("root ::= \"x\"").await.is_ok());
        assert!(matches!(
            manager.compile_grammar("root ::= nope").await,
            Err(PlannerError::Grammar { .. })
        ));
    }
}
