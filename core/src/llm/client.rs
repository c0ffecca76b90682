//! llama.cpp server backend
//!
//! Talks to `llama-server` through its OpenAI-compatible chat endpoint plus
//! the llama.cpp sampling extensions (grammar, repeat penalty, prompt cache).
//! The server is either attached to at a configured URL or spawned from the
//! discovered executable and owned by the engine.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use super::bootstrap;
use super::{
    CompiledGrammar, EngineLoader, EngineState, InferenceEngine, Message, SamplingConfig,
    TokenStream,
};
use crate::config::{BackendConfig, ModelConfig};
use crate::error::{PlannerError, Result};
use crate::npc::grammar;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Engine backed by a running `llama-server`.
///
/// The server keeps no per-client conversation, so the engine's state is the
/// transcript it has fed so far. `cache_prompt` lets the server reuse its KV
/// cache for the shared prefix.
pub struct LlamaServerEngine {
    http_client: HttpClient,
    base_url: String,
    transcript: Vec<Message>,
    // Killed when the engine is dropped
    _server: Option<Child>,
}

impl std::fmt::Debug for LlamaServerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaServerEngine")
            .field("base_url", &self.base_url)
            .field("transcript_len", &self.transcript.len())
            .field("owns_server", &self._server.is_some())
            .finish()
    }
}

impl LlamaServerEngine {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl InferenceEngine for LlamaServerEngine {
    fn generate<'a>(
        &'a mut self,
        turn: &'a [Message],
        sampling: &'a SamplingConfig,
        grammar: Option<&'a CompiledGrammar>,
    ) -> TokenStream<'a> {
        self.transcript.extend_from_slice(turn);

        let body = CompletionRequest {
            messages: self.transcript.clone(),
            stream: true,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            n_predict: sampling.max_tokens,
            repeat_penalty: sampling.repeat_penalty,
            repeat_last_n: sampling.repeat_last_tokens_count,
            stop: &sampling.stop_sequences,
            grammar: grammar.map(CompiledGrammar::source),
            cache_prompt: true,
        };

        self.transcript.push(Message::assistant(String::new()));

        let url = format!("{}/v1/chat/completions", self.base_url);
        let http_client = self.http_client.clone();
        let transcript = &mut self.transcript;

        Box::pin(async_stream::try_stream! {
            let response = http_client.post(&url).json(&body).send().await?;
            let response = check_status(response).await?;

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_res) = stream.next().await {
                let chunk = chunk_res?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim_end_matches('\r').to_string();
                    buffer = buffer[newline_pos + 1..].to_string();

                    match parse_sse_line(&line) {
                        SseLine::Token(token) => {
                            if let Some(last) = transcript.last_mut() {
                                last.content.push_str(&token);
                            }
                            yield token;
                        }
                        SseLine::Done => return,
                        SseLine::Skip => {}
                    }
                }
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
        grammar::validate(gbnf).map_err(|e| PlannerError::Grammar {
            reason: e.to_string(),
        })?;
        Ok(CompiledGrammar::new(gbnf))
    }
}

/// Loads a model by attaching to or spawning `llama-server`
#[derive(Debug, Clone)]
pub struct LlamaServerLoader {
    backend: BackendConfig,
}

impl LlamaServerLoader {
    pub fn new(backend: BackendConfig) -> Self {
        Self { backend }
    }

    fn http_client(&self) -> Result<HttpClient> {
        Ok(HttpClient::builder()
            .timeout(Duration::from_secs(self.backend.request_timeout_secs))
            .user_agent(concat!("npc-planner/", env!("CARGO_PKG_VERSION")))
            .build()?)
    }

    fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.startup_timeout_secs)
    }
}

#[async_trait]
impl EngineLoader for LlamaServerLoader {
    type Engine = LlamaServerEngine;

    async fn load(&self, model: &ModelConfig) -> Result<LlamaServerEngine> {
        let http_client = self.http_client()?;

        if let Some(base_url) = &self.backend.base_url {
            let base_url = base_url.trim_end_matches('/').to_string();
            tracing::info!("Attaching to llama-server at {}", base_url);
            wait_until_healthy(&http_client, &base_url, None, model, self.startup_timeout())
                .await?;
            return Ok(LlamaServerEngine {
                http_client,
                base_url,
                transcript: Vec::new(),
                _server: None,
            });
        }

        let libraries = bootstrap::discover(&self.backend.search_dirs)?;
        if !model.path.is_file() {
            return Err(PlannerError::ModelLoad {
                path: model.path.clone(),
                reason: "model file not found".to_string(),
            });
        }

        tracing::info!(
            "Starting {} for {} (context {}, gpu layers {})",
            libraries.server.display(),
            model.path.display(),
            model.context_size,
            model.gpu_layers
        );

        let mut child = Command::new(&libraries.server)
            .arg("-m")
            .arg(&model.path)
            .arg("-c")
            .arg(model.context_size.to_string())
            .arg("-ngl")
            .arg(model.gpu_layers.to_string())
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(self.backend.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlannerError::ModelLoad {
                path: model.path.clone(),
                reason: format!("failed to start {}: {}", libraries.server.display(), e),
            })?;

        let base_url = format!("http://127.0.0.1:{}", self.backend.port);
        wait_until_healthy(
            &http_client,
            &base_url,
            Some(&mut child),
            model,
            self.startup_timeout(),
        )
        .await?;

        tracing::info!("llama-server ready at {}", base_url);
        Ok(LlamaServerEngine {
            http_client,
            base_url,
            transcript: Vec::new(),
            _server: Some(child),
        })
    }
}

/// Poll `/health` until the model is loaded.
///
/// The server answers 503 while weights are loading. A spawned server that
/// exits early means the model could not be loaded.
async fn wait_until_healthy(
    http_client: &HttpClient,
    base_url: &str,
    mut child: Option<&mut Child>,
    model: &ModelConfig,
    timeout: Duration,
) -> Result<()> {
    let url = format!("{}/health", base_url);
    let started = Instant::now();

    loop {
        if let Some(child) = child.as_deref_mut() {
            if let Some(status) = child.try_wait()? {
                return Err(PlannerError::ModelLoad {
                    path: model.path.clone(),
                    reason: format!("llama-server exited during startup ({})", status),
                });
            }
        }

        match http_client.get(&url).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => tracing::debug!("llama-server not ready: {}", response.status()),
            Err(e) => tracing::debug!("llama-server not reachable yet: {}", e),
        }

        if started.elapsed() >= timeout {
            return Err(PlannerError::StartupTimeout { duration: timeout });
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

/// Turn a non-success completion response into a backend error
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(PlannerError::Backend {
        message: format!(
            "completion request failed with status {}: {}",
            status,
            detail.trim()
        ),
    })
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data: ") else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamResponse>(data) {
        Ok(parsed) => match parsed.choices.into_iter().next().and_then(|c| c.delta.content) {
            Some(content) if !content.is_empty() => SseLine::Token(content),
            _ => SseLine::Skip,
        },
        Err(e) => {
            tracing::warn!("Skipping unparseable stream event: {}", e);
            SseLine::Skip
        }
    }
}

// OpenAI-compatible request with llama.cpp extensions
#[derive(Serialize)]
struct CompletionRequest<'a> {
    messages: Vec<Message>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    n_predict: u32,
    repeat_penalty: f32,
    repeat_last_n: u32,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    grammar: Option<&'a str>,
    cache_prompt: bool,
}

fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}
