//! Decision data model

use serde::{Deserialize, Serialize};

use super::repair::RejectionReason;

/// A tile on the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Manhattan distance
    pub fn distance(self, other: GridPos) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

impl std::fmt::Display for GridPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// How the NPC reacts to a player ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    Guard,
    Cautious,
    Aggressive,
    Scout,
}

impl Behavior {
    pub const ALL: [Behavior; 4] = [
        Behavior::Guard,
        Behavior::Cautious,
        Behavior::Aggressive,
        Behavior::Scout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Guard => "guard",
            Behavior::Cautious => "cautious",
            Behavior::Aggressive => "aggressive",
            Behavior::Scout => "scout",
        }
    }
}

impl std::str::FromStr for Behavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "guard" => Ok(Behavior::Guard),
            "cautious" => Ok(Behavior::Cautious),
            "aggressive" => Ok(Behavior::Aggressive),
            "scout" => Ok(Behavior::Scout),
            _ => Err(format!("Unknown behavior: {}", s)),
        }
    }
}

impl std::fmt::Display for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action literal of the action-tagged schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NpcAction {
    Hold,
    MoveToPing,
    MoveNearPing,
}

impl NpcAction {
    pub const ALL: [NpcAction; 3] = [NpcAction::Hold, NpcAction::MoveToPing, NpcAction::MoveNearPing];

    pub fn as_str(&self) -> &'static str {
        match self {
            NpcAction::Hold => "hold",
            NpcAction::MoveToPing => "move_to_ping",
            NpcAction::MoveNearPing => "move_near_ping",
        }
    }
}

impl std::fmt::Display for NpcAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the JSON object the model is asked for.
///
/// `Action` is canonical. `Coordinates` is the older two-field variant whose
/// action is implied by the behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSchema {
    #[default]
    Action,
    Coordinates,
}

impl std::str::FromStr for DecisionSchema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "action" => Ok(DecisionSchema::Action),
            "coordinates" | "coords" => Ok(DecisionSchema::Coordinates),
            _ => Err(format!("Unknown decision schema: {}", s)),
        }
    }
}

/// Largest grid side the planner accepts; wider requests are clamped
pub const MAX_GRID_SIZE: i32 = 512;

/// Inputs for one planning call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub npc: GridPos,
    pub ping: GridPos,
    pub behavior: Behavior,
    pub grid_width: i32,
    pub grid_height: i32,
    pub near_radius: i32,
}

impl DecisionRequest {
    pub fn new(npc: GridPos, ping: GridPos, behavior: Behavior) -> Self {
        Self {
            npc,
            ping,
            behavior,
            grid_width: 10,
            grid_height: 10,
            near_radius: 1,
        }
    }

    pub fn with_grid(mut self, width: i32, height: i32) -> Self {
        self.grid_width = width;
        self.grid_height = height;
        self
    }

    pub fn with_near_radius(mut self, radius: i32) -> Self {
        self.near_radius = radius;
        self
    }

    pub fn contains(&self, pos: GridPos) -> bool {
        (0..self.grid_width).contains(&pos.x) && (0..self.grid_height).contains(&pos.y)
    }

    /// Clamp a position into the grid
    pub fn clamp(&self, pos: GridPos) -> GridPos {
        GridPos::new(
            pos.x.clamp(0, (self.grid_width - 1).max(0)),
            pos.y.clamp(0, (self.grid_height - 1).max(0)),
        )
    }
}

/// The NPC's next move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: NpcAction,
    pub target: GridPos,
}

impl Decision {
    /// Render as the wire object of `schema`
    pub fn to_json(&self, schema: DecisionSchema) -> serde_json::Value {
        match schema {
            DecisionSchema::Action => serde_json::json!({
                "action": self.action.as_str(),
                "target_x": self.target.x,
                "target_y": self.target.y,
            }),
            DecisionSchema::Coordinates => serde_json::json!({
                "target_x": self.target.x,
                "target_y": self.target.y,
            }),
        }
    }
}

/// Everything one planning call saw and produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionTrace {
    pub system_prompt: String,
    pub user_prompt: String,
    /// Raw model text, untrimmed
    pub completion: String,
    pub decision: Decision,
    /// Why the model output was discarded, when the fallback was used
    pub rejection: Option<RejectionReason>,
    pub grammar_constrained: bool,
}

impl DecisionTrace {
    pub fn used_fallback(&self) -> bool {
        self.rejection.is_some()
    }
}
