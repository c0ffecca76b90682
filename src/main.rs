//! `npc-planner` - local-LLM NPC decision planner
//!
//! Plans NPC moves through a llama.cpp server and offers a multi-session
//! chat over the same engine.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use npc_planner_core::config::PlannerConfig;
use npc_planner_core::llm::{EngineLoader, LlamaServerLoader, ScriptedEngine, ScriptedLoader};
use npc_planner_core::npc::{
    build_grammar, normalize, Behavior, DecisionRequest, DecisionSchema, DecisionTrace, GridPos,
    NpcPlanner,
};
use npc_planner_core::session::{OneShotRequest, SessionManager, SessionOptions};
use npc_planner_core::PlannerError;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => PlannerConfig::default_path().context("Could not determine config directory")?,
    };
    let config = load_config(&config_path)?;

    match cli.command {
        Commands::Config { init } => handle_config(&config_path, &config, init),

        Commands::Grammar {
            width,
            height,
            schema,
        } => {
            let request =
                DecisionRequest::new(GridPos::new(0, 0), GridPos::new(0, 0), Behavior::Guard)
                    .with_grid(width, height);
            print!("{}", build_grammar(&normalize(&request), schema));
            Ok(())
        }

        Commands::Plan {
            npc,
            ping,
            behavior,
            width,
            height,
            radius,
            schema,
            no_grammar,
            json,
        } => {
            let mut config = config;
            if let Some(schema) = schema {
                config.planner.schema = schema;
            }
            if no_grammar {
                config.planner.use_grammar = false;
            }
            config.validate().context("Invalid configuration")?;

            let request = DecisionRequest::new(npc, ping, behavior)
                .with_grid(width, height)
                .with_near_radius(radius);
            let trace = if cli.offline {
                plan(ScriptedLoader::new(ScriptedEngine::offline()), &config, &request).await?
            } else {
                plan(LlamaServerLoader::new(config.backend.clone()), &config, &request).await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&trace)?);
            } else {
                print_trace(&trace, config.planner.schema);
            }
            Ok(())
        }

        Commands::Chat { session } => {
            config.validate().context("Invalid configuration")?;
            if cli.offline {
                chat(ScriptedLoader::new(ScriptedEngine::offline()), &config, session).await
            } else {
                chat(LlamaServerLoader::new(config.backend.clone()), &config, session).await
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(std::env::var("RUST_LOG").ok().as_deref(), verbose))
        .with_writer(std::io::stderr)
        .init();
}

/// `RUST_LOG` wins when set and valid; otherwise `info`, or `debug` with `--verbose`
fn env_filter(directives: Option<&str>, verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

fn load_config(path: &Path) -> Result<PlannerConfig> {
    let config = if path.exists() {
        PlannerConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?
    } else {
        PlannerConfig::default()
    };
    Ok(config.with_env_overrides())
}

fn handle_config(path: &Path, config: &PlannerConfig, init: bool) -> Result<()> {
    let blue = Style::new().blue();

    if init {
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        PlannerConfig::default()
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{} Wrote default configuration to {}", blue.apply_to("✓"), path.display());
        return Ok(());
    }

    println!("{} {}", blue.apply_to("Config:"), path.display());
    if !path.exists() {
        println!("{}", Style::new().dim().apply_to("(file not found, showing defaults)"));
    }
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Cancels a token on Ctrl-C for as long as it is alive
struct CtrlCGuard(tokio::task::JoinHandle<()>);

impl Drop for CtrlCGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn cancel_on_ctrl_c(token: &CancellationToken) -> CtrlCGuard {
    let token = token.clone();
    CtrlCGuard(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    }))
}

fn session_manager<L: EngineLoader>(loader: L, config: &PlannerConfig) -> Arc<SessionManager<L>> {
    Arc::new(SessionManager::new(loader, SessionOptions::from_config(config)))
}

async fn initialize<L: EngineLoader>(sessions: &SessionManager<L>) -> Result<()> {
    let dim = Style::new().dim();
    eprintln!("{}", dim.apply_to("Loading model..."));
    sessions.initialize().await.map_err(|e| {
        if e.is_retryable() {
            anyhow::anyhow!("{} (retrying may help)", e)
        } else {
            anyhow::Error::new(e)
        }
    })?;
    Ok(())
}

async fn plan<L: EngineLoader>(
    loader: L,
    config: &PlannerConfig,
    request: &DecisionRequest,
) -> Result<DecisionTrace> {
    let sessions = session_manager(loader, config);
    initialize(&sessions).await?;

    let planner = NpcPlanner::from_config(sessions, config);
    let cancel = CancellationToken::new();
    let _ctrl_c = cancel_on_ctrl_c(&cancel);

    Ok(planner.plan(request, &cancel).await?)
}

fn print_trace(trace: &DecisionTrace, schema: DecisionSchema) {
    let blue = Style::new().blue();
    let green = Style::new().green().bold();
    let yellow = Style::new().yellow();
    let dim = Style::new().dim();

    println!("{}", blue.apply_to("System prompt:"));
    println!("{}", dim.apply_to(&trace.system_prompt));
    println!("{}", blue.apply_to("User prompt:"));
    println!("{}", dim.apply_to(&trace.user_prompt));
    println!(
        "{} {}",
        blue.apply_to("Completion:"),
        if trace.grammar_constrained {
            "(grammar constrained)"
        } else {
            "(prompt only)"
        }
    );
    println!("{}", trace.completion);
    println!();

    if let Some(reason) = &trace.rejection {
        println!("{} {}", yellow.apply_to("Fallback:"), reason);
    }
    println!(
        "{} {} -> {}",
        green.apply_to("Decision:"),
        trace.decision.action,
        trace.decision.target
    );
    println!("{}", trace.decision.to_json(schema));
}

async fn chat<L: EngineLoader>(loader: L, config: &PlannerConfig, start: usize) -> Result<()> {
    let blue = Style::new().blue();
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    let dim = Style::new().dim();

    let sessions = session_manager(loader, config);
    initialize(&sessions).await?;
    if start != 0 {
        sessions.switch_active_session(start).await?;
    }

    println!(
        "{} {} session(s), active {}. /switch N, /clear [system], /once <prompt>, /quit",
        blue.apply_to("Chat ready:"),
        sessions.session_count().await?,
        sessions.active_index().await?
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", green.apply_to(">"));
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let outcome: std::result::Result<(), PlannerError> = match command {
            "/quit" | "/exit" => break,
            "/switch" => match rest.parse::<usize>() {
                Ok(index) => sessions.switch_active_session(index).await.map(|_| {
                    println!("{} {}", dim.apply_to("Active session:"), index);
                }),
                Err(_) => {
                    println!("{}", yellow.apply_to("Usage: /switch N"));
                    Ok(())
                }
            },
            "/clear" => {
                let system = (!rest.is_empty()).then(|| rest.to_string());
                sessions.clear_active_history(system).await.map(|_| {
                    println!("{}", dim.apply_to("History cleared"));
                })
            }
            "/once" => {
                let system = config.sessions.system_prompt.as_deref().unwrap_or_default();
                let cancel = CancellationToken::new();
                let _ctrl_c = cancel_on_ctrl_c(&cancel);
                sessions
                    .complete_once(OneShotRequest::new(system, rest, &config.sampling), &cancel)
                    .await
                    .map(|text| println!("{} {}", dim.apply_to("[once]"), text))
            }
            _ => stream_reply(&sessions, line, config).await,
        };

        if let Err(e) = outcome {
            match e.kind() {
                npc_planner_core::ErrorKind::Configuration => {
                    println!("{} {}", yellow.apply_to("!"), e)
                }
                _ => return Err(e.into()),
            }
        }
    }

    Ok(())
}

async fn stream_reply<L: EngineLoader>(
    sessions: &SessionManager<L>,
    message: &str,
    config: &PlannerConfig,
) -> std::result::Result<(), PlannerError> {
    let cancel = CancellationToken::new();
    let mut stream = sessions.stream_chat(message, config.sampling.clone(), cancel.clone());
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => cancel.cancel(),
            next = stream.next() => match next {
                None => break,
                Some(Ok(token)) => {
                    print!("{}", token);
                    stdout.flush()?;
                }
                Some(Err(PlannerError::Cancelled)) => {
                    print!("{}", Style::new().dim().apply_to(" [cancelled]"));
                    break;
                }
                Some(Err(e)) => return Err(e),
            },
        }
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_prefers_rust_log() {
        let level = |l: &str| EnvFilter::new(l).to_string();
        assert_eq!(env_filter(Some("warn"), false).to_string(), level("warn"));
        assert_eq!(env_filter(Some("warn"), true).to_string(), level("warn"));
        assert_eq!(env_filter(None, false).to_string(), level("info"));
        assert_eq!(env_filter(None, true).to_string(), level("debug"));
        assert_eq!(env_filter(Some("  "), false).to_string(), level("info"));
    }
}
