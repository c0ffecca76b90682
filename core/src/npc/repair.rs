//! Decision validation and repair
//!
//! Model output is parsed strictly (exact field set, no duplicates, lossless
//! integers, known actions) and then forced to obey the behavior's game
//! rules. Anything that cannot be turned into a legal decision becomes a
//! [`RejectionReason`], which callers resolve to [`fallback_decision`].
//! Nothing in here panics or returns a hard error.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use super::extract::try_extract_first_json_object;
use super::prompt::normalize;
use super::types::{Behavior, Decision, DecisionRequest, DecisionSchema, GridPos, NpcAction};

/// Why a completion could not be used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("no complete JSON object in completion")]
    NoJsonObject,

    #[error("decision must be a single flat JSON object")]
    NotAnObject,

    #[error("malformed decision: {message}")]
    Malformed { message: String },

    #[error("no tile is farther than {near_radius} from the ping")]
    NoAdmissibleTarget { near_radius: i32 },
}

/// Structurally valid model output before game rules are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// `None` for the coordinates schema
    pub action: Option<NpcAction>,
    /// Already clamped into the grid
    pub target: GridPos,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionWire {
    action: NpcAction,
    target_x: WireInt,
    target_y: WireInt,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CoordinatesWire {
    target_x: WireInt,
    target_y: WireInt,
}

/// JSON number that converts to an integer without loss (`3` or `3.0`, not `3.5`)
#[derive(Debug, Clone, Copy)]
struct WireInt(i64);

impl<'de> Deserialize<'de> for WireInt {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let number = serde_json::Number::deserialize(deserializer)?;
        if let Some(i) = number.as_i64() {
            return Ok(WireInt(i));
        }
        if number.is_u64() {
            return Err(de::Error::custom(format!("integer {} out of range", number)));
        }
        match number.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(WireInt(f as i64))
            }
            _ => Err(de::Error::custom(format!(
                "expected an integer coordinate, got {}",
                number
            ))),
        }
    }
}

/// Parse `json` strictly for `schema` and clamp the coordinates into the grid
pub fn parse_proposal(
    json: &str,
    request: &DecisionRequest,
    schema: DecisionSchema,
) -> Result<Proposal, RejectionReason> {
    if !json.trim_start().starts_with('{') {
        return Err(RejectionReason::NotAnObject);
    }

    let malformed = |e: serde_json::Error| RejectionReason::Malformed {
        message: e.to_string(),
    };

    let (action, x, y) = match schema {
        DecisionSchema::Action => {
            let wire: ActionWire = serde_json::from_str(json).map_err(malformed)?;
            (Some(wire.action), wire.target_x.0, wire.target_y.0)
        }
        DecisionSchema::Coordinates => {
            let wire: CoordinatesWire = serde_json::from_str(json).map_err(malformed)?;
            (None, wire.target_x.0, wire.target_y.0)
        }
    };

    Ok(Proposal {
        action,
        target: clamp_wide(request, x, y),
    })
}

fn clamp_wide(request: &DecisionRequest, x: i64, y: i64) -> GridPos {
    let max_x = i64::from((request.grid_width - 1).max(0));
    let max_y = i64::from((request.grid_height - 1).max(0));
    // both values fit in i32 after clamping
    GridPos::new(x.clamp(0, max_x) as i32, y.clamp(0, max_y) as i32)
}

/// Parse, validate and repair one extracted JSON object
pub fn parse_and_repair(
    json: &str,
    request: &DecisionRequest,
    schema: DecisionSchema,
) -> Result<Decision, RejectionReason> {
    let request = normalize(request);
    let proposal = parse_proposal(json, &request, schema)?;
    repair(&proposal, &request)
}

type RepairRule = fn(&Proposal, &DecisionRequest) -> Result<Decision, RejectionReason>;

/// Force a proposal to obey the request's behavior rule
pub fn repair(proposal: &Proposal, request: &DecisionRequest) -> Result<Decision, RejectionReason> {
    let rule: RepairRule = match request.behavior {
        Behavior::Guard => repair_guard,
        Behavior::Aggressive => repair_aggressive,
        Behavior::Scout => repair_scout,
        Behavior::Cautious => repair_cautious,
    };
    rule(proposal, request)
}

fn repair_guard(_proposal: &Proposal, request: &DecisionRequest) -> Result<Decision, RejectionReason> {
    Ok(hold(request))
}

fn repair_aggressive(
    _proposal: &Proposal,
    request: &DecisionRequest,
) -> Result<Decision, RejectionReason> {
    Ok(Decision {
        action: NpcAction::MoveToPing,
        target: request.ping,
    })
}

fn repair_scout(proposal: &Proposal, request: &DecisionRequest) -> Result<Decision, RejectionReason> {
    Ok(Decision {
        action: NpcAction::MoveNearPing,
        target: keep_clear_of_ping(proposal.target, request)?,
    })
}

/// Holding is allowed; any movement is downgraded to keeping clear of the ping
fn repair_cautious(
    proposal: &Proposal,
    request: &DecisionRequest,
) -> Result<Decision, RejectionReason> {
    match proposal.action {
        Some(NpcAction::Hold) => Ok(hold(request)),
        Some(NpcAction::MoveToPing) | Some(NpcAction::MoveNearPing) | None => repair_scout(proposal, request),
    }
}

fn hold(request: &DecisionRequest) -> Decision {
    Decision {
        action: NpcAction::Hold,
        target: request.npc,
    }
}

/// Keep `target` if it is farther than the near radius from the ping,
/// otherwise pick the closest admissible tile.
///
/// Any admissible target is kept, not only one at exactly `near_radius + 1`:
/// the model's choice is only overridden when it breaks the clearance rule.
/// Tiles picked by the search do sit at `near_radius + 1` whenever the grid
/// has one.
fn keep_clear_of_ping(target: GridPos, request: &DecisionRequest) -> Result<GridPos, RejectionReason> {
    let radius = request.near_radius.max(0) as u32;
    if target.distance(request.ping) > radius {
        return Ok(target);
    }
    nearest_admissible(request).ok_or(RejectionReason::NoAdmissibleTarget {
        near_radius: request.near_radius,
    })
}

/// Tile farther than the near radius from the ping whose ping distance is
/// closest to `near_radius + 1`, tie-broken by distance to the NPC.
///
/// Scans rows top to bottom, so remaining ties resolve to the first tile in
/// row-major order.
pub fn nearest_admissible(request: &DecisionRequest) -> Option<GridPos> {
    let radius = request.near_radius.max(0) as u32;
    let desired = radius + 1;
    let mut best: Option<((u32, u32), GridPos)> = None;

    for y in 0..request.grid_height {
        for x in 0..request.grid_width {
            let tile = GridPos::new(x, y);
            let to_ping = tile.distance(request.ping);
            if to_ping <= radius {
                continue;
            }
            let key = (to_ping - desired, tile.distance(request.npc));
            if best.map_or(true, |(best_key, _)| key < best_key) {
                best = Some((key, tile));
            }
        }
    }

    best.map(|(_, tile)| tile)
}

/// Safe default: hold position
pub fn fallback_decision(request: &DecisionRequest) -> Decision {
    Decision {
        action: NpcAction::Hold,
        target: request.clamp(request.npc),
    }
}

/// Turn a raw completion into a decision. Total: never fails, never panics.
///
/// Returns the rejection reason when the fallback decision was used.
pub fn resolve(
    completion: &str,
    request: &DecisionRequest,
    schema: DecisionSchema,
) -> (Decision, Option<RejectionReason>) {
    let request = normalize(request);
    let outcome = try_extract_first_json_object(completion)
        .ok_or(RejectionReason::NoJsonObject)
        .and_then(|json| parse_and_repair(json, &request, schema));

    match outcome {
        Ok(decision) => (decision, None),
        Err(reason) => (fallback_decision(&request), Some(reason)),
    }
}
