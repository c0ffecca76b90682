//! Decision pipeline
//!
//! normalize -> prompts -> optional grammar -> one-shot completion ->
//! extract -> repair. Model mistakes and cancellation end in the fallback
//! decision; only configuration and backend failures reach the caller.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::extract::contains_complete_object;
use super::grammar::build_grammar;
use super::prompt::{normalize, PromptBuilder};
use super::repair::resolve;
use super::types::{DecisionRequest, DecisionSchema, DecisionTrace};
use crate::config::PlannerConfig;
use crate::error::{PlannerError, Result};
use crate::llm::{CompiledGrammar, EngineLoader, SamplingConfig};
use crate::session::{OneShotRequest, SessionManager};

pub struct NpcPlanner<L: EngineLoader> {
    sessions: Arc<SessionManager<L>>,
    prompts: PromptBuilder,
    sampling: SamplingConfig,
    use_grammar: bool,
}

impl<L: EngineLoader> NpcPlanner<L> {
    pub fn new(sessions: Arc<SessionManager<L>>, prompts: PromptBuilder, sampling: SamplingConfig) -> Self {
        Self {
            sessions,
            prompts,
            sampling,
            use_grammar: true,
        }
    }

    pub fn from_config(sessions: Arc<SessionManager<L>>, config: &PlannerConfig) -> Self {
        let prompts = PromptBuilder::from_config(&config.prompts, config.planner.schema);
        Self::new(sessions, prompts, config.sampling.clone()).with_grammar(config.planner.use_grammar)
    }

    /// Constrain generation with a GBNF grammar when the engine accepts one
    pub fn with_grammar(mut self, enabled: bool) -> Self {
        self.use_grammar = enabled;
        self
    }

    pub fn schema(&self) -> DecisionSchema {
        self.prompts.schema()
    }

    pub fn sessions(&self) -> &Arc<SessionManager<L>> {
        &self.sessions
    }

    /// Decide the NPC's next move.
    ///
    /// Initializes the session manager on first use. The active chat session
    /// is left untouched.
    pub async fn plan(
        &self,
        request: &DecisionRequest,
        cancel: &CancellationToken,
    ) -> Result<DecisionTrace> {
        self.sessions.initialize().await?;

        let request = normalize(request);
        let schema = self.schema();
        let system_prompt = self.prompts.system_prompt(&request);
        let user_prompt = self.prompts.user_prompt(&request);
        let grammar = self.compile_grammar(&request).await?;

        tracing::debug!(
            "Planning {} npc={} ping={} grid={}x{} grammar={}",
            request.behavior,
            request.npc,
            request.ping,
            request.grid_width,
            request.grid_height,
            grammar.is_some()
        );

        let stop = |text: &str| contains_complete_object(text);
        let one_shot = OneShotRequest::new(&system_prompt, &user_prompt, &self.sampling)
            .with_grammar(grammar.as_ref())
            .stop_when(&stop);
        let completion = match self.sessions.complete_once(one_shot, cancel).await {
            Ok(text) => text,
            Err(PlannerError::Cancelled) => String::new(),
            Err(e) => return Err(e),
        };

        let (decision, rejection) = resolve(&completion, &request, schema);
        match &rejection {
            Some(reason) => tracing::warn!(
                "Model output rejected ({}), holding position for {}: {:?}",
                reason,
                request.behavior,
                completion
            ),
            None => tracing::info!(
                "{} npc={} -> {} {}",
                request.behavior,
                request.npc,
                decision.action,
                decision.target
            ),
        }

        Ok(DecisionTrace {
            system_prompt,
            user_prompt,
            completion,
            decision,
            rejection,
            grammar_constrained: grammar.is_some(),
        })
    }

    /// Grammar for this request, or `None` to run on prompt constraints alone
    async fn compile_grammar(&self, request: &DecisionRequest) -> Result<Option<CompiledGrammar>> {
        if !self.use_grammar {
            return Ok(None);
        }
        let grammar = build_grammar(request, self.schema());
        match self.sessions.compile_grammar(grammar.as_gbnf()).await {
            Ok(compiled) => Ok(Some(compiled)),
            Err(PlannerError::Grammar { reason }) => {
                tracing::warn!("Grammar rejected, continuing unconstrained: {}", reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
