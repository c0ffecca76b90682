//! CLI argument parsing using clap 4.x derive macros

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use npc_planner_core::npc::{Behavior, DecisionSchema, GridPos};

/// Local-LLM NPC decision planner
///
/// Drives a llama.cpp server to pick an NPC's next grid move from a tactical
/// prompt, validating and repairing every answer against the game rules.
#[derive(Parser, Debug)]
#[command(name = "npc-planner")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to the per-user config path)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the built-in scripted engine instead of a model
    #[arg(long, global = true)]
    pub offline: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decide one NPC move
    Plan {
        /// NPC position as X,Y
        #[arg(long, value_parser = parse_grid_pos)]
        npc: GridPos,

        /// Player ping as X,Y
        #[arg(long, value_parser = parse_grid_pos)]
        ping: GridPos,

        /// guard, cautious, aggressive or scout
        #[arg(short, long)]
        behavior: Behavior,

        #[arg(long, default_value_t = 10)]
        width: i32,

        #[arg(long, default_value_t = 10)]
        height: i32,

        /// Near radius around the ping
        #[arg(short, long, default_value_t = 1)]
        radius: i32,

        /// Decision object shape (overrides the config)
        #[arg(long)]
        schema: Option<DecisionSchema>,

        /// Skip grammar-constrained sampling
        #[arg(long)]
        no_grammar: bool,

        /// Print the full trace as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive multi-session chat
    ///
    /// Commands: /switch N, /clear [system prompt], /once <prompt>, /quit
    Chat {
        /// Session to start in
        #[arg(short, long, default_value_t = 0)]
        session: usize,
    },

    /// Print the GBNF grammar for a grid
    Grammar {
        #[arg(long, default_value_t = 10)]
        width: i32,

        #[arg(long, default_value_t = 10)]
        height: i32,

        #[arg(long, default_value = "action")]
        schema: DecisionSchema,
    },

    /// Show the resolved configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// `X,Y` grid coordinates
pub fn parse_grid_pos(s: &str) -> Result<GridPos, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got '{}'", s))?;
    let x = x.trim().parse().map_err(|e| format!("bad x in '{}': {}", s, e))?;
    let y = y.trim().parse().map_err(|e| format!("bad y in '{}': {}", s, e))?;
    Ok(GridPos::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grid_pos() {
        assert_eq!(parse_grid_pos("3,4"), Ok(GridPos::new(3, 4)));
        assert_eq!(parse_grid_pos(" 0 , 9 "), Ok(GridPos::new(0, 9)));
        assert!(parse_grid_pos("3").is_err());
        assert!(parse_grid_pos("a,1").is_err());
    }

    #[test]
    fn test_plan_arguments() {
        let cli = Cli::try_parse_from([
            "npc-planner", "--offline", "plan", "--npc", "1,2", "--ping", "3,4", "-b", "scout", "--radius", "2",
        ])
        .unwrap();
        assert!(cli.offline);
        match cli.command {
            Commands::Plan { npc, ping, behavior, radius, schema, .. } => {
                assert_eq!(npc, GridPos::new(1, 2));
                assert_eq!(ping, GridPos::new(3, 4));
                assert_eq!(behavior, Behavior::Scout);
                assert_eq!(radius, 2);
                assert!(schema.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
