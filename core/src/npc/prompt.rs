//! Prompt construction for decision requests
//!
//! Both prompts are pure functions of the normalized request and the
//! configured templates, so the same request always renders byte-identical
//! text.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::types::{DecisionRequest, DecisionSchema, GridPos, NpcAction, MAX_GRID_SIZE};
use crate::config::prompts::{
    ACTION_FORMAT, ACTION_SYSTEM_TEMPLATE, COORDINATES_FORMAT, COORDINATES_SYSTEM_TEMPLATE,
    USER_TEMPLATE,
};
use crate::config::PromptsConfig;

/// Clamp grid bounds to `1..=MAX_GRID_SIZE`, the radius to at least 1 and both
/// positions into the grid.
///
/// Returns a copy; idempotent.
pub fn normalize(request: &DecisionRequest) -> DecisionRequest {
    let grid_width = request.grid_width.clamp(1, MAX_GRID_SIZE);
    let grid_height = request.grid_height.clamp(1, MAX_GRID_SIZE);
    let clamp = |p: GridPos| {
        GridPos::new(p.x.clamp(0, grid_width - 1), p.y.clamp(0, grid_height - 1))
    };

    DecisionRequest {
        npc: clamp(request.npc),
        ping: clamp(request.ping),
        behavior: request.behavior,
        grid_width,
        grid_height,
        near_radius: request.near_radius.max(1),
    }
}

/// Renders system and user prompts from templates
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_template: String,
    user_template: String,
    schema: DecisionSchema,
}

impl PromptBuilder {
    /// Builder with the built-in templates for `schema`
    pub fn new(schema: DecisionSchema) -> Self {
        Self::from_config(&PromptsConfig::default(), schema)
    }

    pub fn from_config(prompts: &PromptsConfig, schema: DecisionSchema) -> Self {
        let default_system = match schema {
            DecisionSchema::Action => ACTION_SYSTEM_TEMPLATE,
            DecisionSchema::Coordinates => COORDINATES_SYSTEM_TEMPLATE,
        };
        Self {
            system_template: prompts
                .system_template
                .clone()
                .unwrap_or_else(|| default_system.to_string()),
            user_template: prompts
                .user_template
                .clone()
                .unwrap_or_else(|| USER_TEMPLATE.to_string()),
            schema,
        }
    }

    pub fn schema(&self) -> DecisionSchema {
        self.schema
    }

    /// Rule text parameterized by grid bounds and the behavior taxonomy
    pub fn system_prompt(&self, request: &DecisionRequest) -> String {
        substitute(&self.system_template, |name| self.variable(request, name))
    }

    /// NPC position, behavior, near radius and ping for this call
    pub fn user_prompt(&self, request: &DecisionRequest) -> String {
        substitute(&self.user_template, |name| self.variable(request, name))
    }

    fn variable(&self, request: &DecisionRequest, name: &str) -> Option<String> {
        let value = match name {
            "width" => request.grid_width.to_string(),
            "height" => request.grid_height.to_string(),
            "max_x" => (request.grid_width - 1).to_string(),
            "max_y" => (request.grid_height - 1).to_string(),
            "npc_x" => request.npc.x.to_string(),
            "npc_y" => request.npc.y.to_string(),
            "ping_x" => request.ping.x.to_string(),
            "ping_y" => request.ping.y.to_string(),
            "behavior" => request.behavior.as_str().to_string(),
            "near_radius" => request.near_radius.to_string(),
            "far_radius" => (request.near_radius + 1).to_string(),
            "actions" => NpcAction::ALL
                .iter()
                .map(|a| a.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            "format" => match self.schema {
                DecisionSchema::Action => ACTION_FORMAT.to_string(),
                DecisionSchema::Coordinates => COORDINATES_FORMAT.to_string(),
            },
            _ => return None,
        };
        Some(value)
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("placeholder pattern is valid"))
}

/// Single pass `{name}` substitution; unknown names are left as-is
fn substitute<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let replaced: Cow<'_, str> = placeholder_regex().replace_all(template, |caps: &Captures| {
        lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    });
    replaced.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npc::types::Behavior;

    fn request() -> DecisionRequest {
        DecisionRequest::new(GridPos::new(1, 2), GridPos::new(4, 3), Behavior::Scout)
            .with_grid(6, 5)
            .with_near_radius(2)
    }

    #[test]
    fn test_normalize_clamps_everything() {
        let raw = DecisionRequest {
            npc: GridPos::new(-3, 40),
            ping: GridPos::new(9, -1),
            behavior: Behavior::Guard,
            grid_width: 4,
            grid_height: 0,
            near_radius: -5,
        };
        let norm = normalize(&raw);
        assert_eq!(norm.grid_width, 4);
        assert_eq!(norm.grid_height, 1);
        assert_eq!(norm.near_radius, 1);
        assert_eq!(norm.npc, GridPos::new(0, 0));
        assert_eq!(norm.ping, GridPos::new(3, 0));
        // input untouched
        assert_eq!(raw.npc, GridPos::new(-3, 40));
    }

    #[test]
    fn test_normalize_caps_grid_size() {
        let raw = DecisionRequest::new(GridPos::new(0, 0), GridPos::new(i32::MAX, 7), Behavior::Scout)
            .with_grid(i32::MAX, 100_000);
        let norm = normalize(&raw);
        assert_eq!(norm.grid_width, MAX_GRID_SIZE);
        assert_eq!(norm.grid_height, MAX_GRID_SIZE);
        assert_eq!(norm.ping, GridPos::new(MAX_GRID_SIZE - 1, 7));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for width in [-2, 0, 1, 3, 7] {
            for height in [-1, 0, 1, 4] {
                for (x, y) in [(-9, -9), (0, 0), (2, 5), (50, -3)] {
                    let raw = DecisionRequest {
                        npc: GridPos::new(x, y),
                        ping: GridPos::new(y, x),
                        behavior: Behavior::Cautious,
                        grid_width: width,
                        grid_height: height,
                        near_radius: x,
                    };
                    let once = normalize(&raw);
                    assert_eq!(normalize(&once), once);
                    assert!(once.contains(once.npc));
                    assert!(once.contains(once.ping));
                }
            }
        }
    }

    #[test]
    fn test_user_prompt_contents() {
        let builder = PromptBuilder::new(DecisionSchema::Action);
        let prompt = builder.user_prompt(&request());
        assert_eq!(
            prompt,
            "NPC previous position: (1, 2)\nBehavior: scout\nNear radius: 2\nPlayer ping: (4, 3)\nDecide the NPC's next target."
        );
    }

    #[test]
    fn test_system_prompt_parameterized_by_grid() {
        let builder = PromptBuilder::new(DecisionSchema::Action);
        let prompt = builder.system_prompt(&request());
        assert!(prompt.contains("6x5 tile grid"));
        assert!(prompt.contains("x from 0 to 5, y from 0 to 4"));
        assert!(prompt.contains("hold, move_to_ping, move_near_ping"));
        assert!(prompt.contains(r#"{"action":"<hold|move_to_ping|move_near_ping>""#));
        assert!(!prompt.contains("{width}"));
    }

    #[test]
    fn test_coordinates_schema_format() {
        let builder = PromptBuilder::new(DecisionSchema::Coordinates);
        let prompt = builder.system_prompt(&request());
        assert!(prompt.contains(r#"{"target_x":<int>,"target_y":<int>}"#));
        assert!(!prompt.contains("move_to_ping"));
    }

    #[test]
    fn test_prompts_are_deterministic() {
        let builder = PromptBuilder::new(DecisionSchema::Action);
        let req = request();
        assert_eq!(builder.system_prompt(&req), builder.system_prompt(&req));
        assert_eq!(builder.user_prompt(&req), builder.user_prompt(&req));
    }

    #[test]
    fn test_custom_template_keeps_unknown_placeholders() {
        let prompts = PromptsConfig {
            system_template: Some("grid {width} by {height}, {mystery}".to_string()),
            user_template: None,
        };
        let builder = PromptBuilder::from_config(&prompts, DecisionSchema::Action);
        assert_eq!(builder.system_prompt(&request()), "grid 6 by 5, {mystery}");
    }
}
