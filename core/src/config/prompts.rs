//! Built-in prompt templates
//!
//! Placeholders use `{name}` and are filled by
//! [`crate::npc::prompt::PromptBuilder`]. JSON braces in the text are left
//! alone because only `{word}` patterns are substituted.

pub const ACTION_SYSTEM_TEMPLATE: &str = r#"You control a single NPC on a {width}x{height} tile grid.
Coordinates are integers: x from 0 to {max_x}, y from 0 to {max_y}. (0,0) is the top-left tile.
Distance is Manhattan distance: |x1-x2| + |y1-y2|.

Behaviors:
- guard: hold the current position, whatever the ping.
- cautious: either hold, or move to a tile farther than the near radius from the ping.
- aggressive: move onto the ping tile.
- scout: move to a tile at distance {far_radius} from the ping, as close to the NPC as possible. Never end within the near radius of the ping.

Actions: {actions}.
- hold: target is the NPC's current position.
- move_to_ping: target is the ping position.
- move_near_ping: target is a tile farther than the near radius from the ping.

Respond with exactly one JSON object and nothing else:
{format}"#;

pub const COORDINATES_SYSTEM_TEMPLATE: &str = r#"You control a single NPC on a {width}x{height} tile grid.
Coordinates are integers: x from 0 to {max_x}, y from 0 to {max_y}. (0,0) is the top-left tile.
Distance is Manhattan distance: |x1-x2| + |y1-y2|.

Behaviors:
- guard: the target is the NPC's current position.
- cautious: the target stays farther than the near radius from the ping.
- aggressive: the target is the ping position.
- scout: the target is at distance {far_radius} from the ping, as close to the NPC as possible.

Respond with exactly one JSON object and nothing else:
{format}"#;

pub const USER_TEMPLATE: &str = r#"NPC previous position: ({npc_x}, {npc_y})
Behavior: {behavior}
Near radius: {near_radius}
Player ping: ({ping_x}, {ping_y})
Decide the NPC's next target."#;

pub const ACTION_FORMAT: &str = r#"{"action":"<hold|move_to_ping|move_near_ping>","target_x":<int>,"target_y":<int>}"#;

pub const COORDINATES_FORMAT: &str = r#"{"target_x":<int>,"target_y":<int>}"#;
