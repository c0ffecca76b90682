//! GBNF grammar constraints for decision objects
//!
//! GBNF is llama.cpp's grammar format. Each grammar defines a `root` rule
//! that generated text must match. Bounded integers are spelled out as
//! literal alternatives instead of ranged character classes, which some
//! backends compile poorly or not at all.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use super::types::{DecisionRequest, DecisionSchema, NpcAction};

/// A grammar restricting output to one decision object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grammar {
    text: String,
}

/// Structural problem found while checking a grammar
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrammarError {
    #[error("line {line}: expected `name ::= body`")]
    MissingDefinition { line: usize },

    #[error("line {line}: invalid rule name '{name}'")]
    InvalidName { line: usize, name: String },

    #[error("rule '{0}' defined more than once")]
    DuplicateRule(String),

    #[error("rule '{rule}': unterminated {what}")]
    Unterminated { rule: String, what: &'static str },

    #[error("rule '{rule}' references undefined rule '{reference}'")]
    UndefinedRule { rule: String, reference: String },

    #[error("grammar has no root rule")]
    MissingRoot,
}

impl Grammar {
    pub fn as_gbnf(&self) -> &str {
        &self.text
    }

    pub fn into_gbnf(self) -> String {
        self.text
    }

    /// Structural compile check of this grammar
    pub fn validate(&self) -> Result<(), GrammarError> {
        validate(&self.text)
    }
}

impl std::fmt::Display for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Grammar accepting exactly the decision objects legal for this (normalized) request
pub fn build_grammar(request: &DecisionRequest, schema: DecisionSchema) -> Grammar {
    let mut text = String::new();

    let root = match schema {
        DecisionSchema::Action => {
            r#"root ::= "{" ws "\"action\"" ws ":" ws action ws "," ws "\"target_x\"" ws ":" ws x ws "," ws "\"target_y\"" ws ":" ws y ws "}""#
        }
        DecisionSchema::Coordinates => {
            r#"root ::= "{" ws "\"target_x\"" ws ":" ws x ws "," ws "\"target_y\"" ws ":" ws y ws "}""#
        }
    };
    text.push_str(root);
    text.push('\n');

    if schema == DecisionSchema::Action {
        let actions = NpcAction::ALL
            .iter()
            .map(|a| format!(r#""\"{}\"""#, a.as_str()))
            .collect::<Vec<_>>()
            .join(" | ");
        let _ = writeln!(text, "action ::= {}", actions);
    }

    let _ = writeln!(text, "x ::= {}", integer_literals(request.grid_width));
    let _ = writeln!(text, "y ::= {}", integer_literals(request.grid_height));
    text.push_str(r#"ws ::= " "?"#);
    text.push('\n');

    Grammar { text }
}

/// `"0" | "1" | ... | "<upper-1>"`
fn integer_literals(upper: i32) -> String {
    (0..upper.max(1))
        .map(|n| format!("\"{}\"", n))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Check GBNF text for the mistakes that make a backend refuse it.
///
/// Rules may continue over several lines; `#` starts a comment outside
/// literals.
pub fn validate(gbnf: &str) -> Result<(), GrammarError> {
    let mut rules: Vec<(String, String)> = Vec::new();

    for (idx, raw_line) in gbnf.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line);
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once("::=") {
            Some((name, body)) => {
                let name = name.trim();
                if !is_rule_name(name) {
                    return Err(GrammarError::InvalidName {
                        line: line_no,
                        name: name.to_string(),
                    });
                }
                rules.push((name.to_string(), body.to_string()));
            }
            None => match rules.last_mut() {
                Some((_, body)) => {
                    body.push(' ');
                    body.push_str(line);
                }
                None => return Err(GrammarError::MissingDefinition { line: line_no }),
            },
        }
    }

    let mut defined = BTreeSet::new();
    for (name, _) in &rules {
        if !defined.insert(name.as_str()) {
            return Err(GrammarError::DuplicateRule(name.clone()));
        }
    }
    if !defined.contains("root") {
        return Err(GrammarError::MissingRoot);
    }

    for (name, body) in &rules {
        for reference in references(name, body)? {
            if !defined.contains(reference.as_str()) {
                return Err(GrammarError::UndefinedRule {
                    rule: name.clone(),
                    reference,
                });
            }
        }
    }

    Ok(())
}

fn is_rule_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn strip_comment(line: &str) -> &str {
    let mut in_literal = false;
    let mut in_class = false;
    let mut escape = false;
    for (i, ch) in line.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_literal || in_class => escape = true,
            '"' if !in_class => in_literal = !in_literal,
            '[' if !in_literal => in_class = true,
            ']' if in_class => in_class = false,
            '#' if !in_literal && !in_class => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Rule names referenced by a body, skipping literals and character classes
fn references(rule: &str, body: &str) -> Result<Vec<String>, GrammarError> {
    let mut out = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => skip_until(&mut chars, '"').ok_or_else(|| GrammarError::Unterminated {
                rule: rule.to_string(),
                what: "string literal",
            })?,
            '[' => skip_until(&mut chars, ']').ok_or_else(|| GrammarError::Unterminated {
                rule: rule.to_string(),
                what: "character class",
            })?,
            c if c.is_ascii_alphabetic() => {
                let mut name = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '-' || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(name);
            }
            _ => {}
        }
    }

    Ok(out)
}

fn skip_until<I>(chars: &mut std::iter::Peekable<I>, close: char) -> Option<()>
where
    I: Iterator<Item = char>,
{
    let mut escape = false;
    for ch in chars.by_ref() {
        if escape {
            escape = false;
            continue;
        }
        if ch == '\\' {
            escape = true;
        } else if ch == close {
            return Some(());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npc::types::{Behavior, GridPos};

    fn request(width: i32, height: i32) -> DecisionRequest {
        DecisionRequest::new(GridPos::new(0, 0), GridPos::new(1, 1), Behavior::Scout)
            .with_grid(width, height)
    }

    fn rule<'a>(grammar: &'a Grammar, name: &str) -> &'a str {
        let prefix = format!("{} ::= ", name);
        grammar
            .as_gbnf()
            .lines()
            .find_map(|l| l.strip_prefix(prefix.as_str()))
            .unwrap()
    }

    #[test]
    fn test_action_grammar_enumerates_literals() {
        let grammar = build_grammar(&request(3, 2), DecisionSchema::Action);
        assert_eq!(rule(&grammar, "x"), r#""0" | "1" | "2""#);
        assert_eq!(rule(&grammar, "y"), r#""0" | "1""#);
        assert_eq!(
            rule(&grammar, "action"),
            r#""\"hold\"" | "\"move_to_ping\"" | "\"move_near_ping\"""#
        );
        assert!(rule(&grammar, "root").contains(r#""\"action\"""#));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_no_ranged_classes() {
        let grammar = build_grammar(&request(12, 11), DecisionSchema::Action);
        assert!(!grammar.as_gbnf().contains('['));
        assert!(rule(&grammar, "x").ends_with(r#""11""#));
        assert!(rule(&grammar, "y").ends_with(r#""10""#));
    }

    #[test]
    fn test_coordinates_grammar_has_no_action() {
        let grammar = build_grammar(&request(2, 2), DecisionSchema::Coordinates);
        assert!(!grammar.as_gbnf().contains("action"));
        assert!(grammar.validate().is_ok());
    }

    #[test]
    fn test_validate_accepts_multiline_and_comments() {
        let gbnf = r##"
# decision object
root ::= "{" ws
    value ws "}"   # trailing comment
value ::= [0-9] | "\"#\""
ws ::= [ \t\n]*
"##;
        assert_eq!(validate(gbnf), Ok(()));
    }

    #[test]
    fn test_validate_rejects_undefined_rule() {
        let err = validate("root ::= value\n").unwrap_err();
        assert_eq!(
            err,
            GrammarError::UndefinedRule {
                rule: "root".to_string(),
                reference: "value".to_string(),
            }
        );
    }

    #[test]
    fn test_validate_rejects_structural_errors() {
        assert_eq!(validate("value ::= \"a\"\n"), Err(GrammarError::MissingRoot));
        assert!(matches!(
            validate("root ::= \"abc\n"),
            Err(GrammarError::Unterminated { .. })
        ));
        assert!(matches!(
            validate("\"loose\"\nroot ::= \"a\""),
            Err(GrammarError::MissingDefinition { line: 1 })
        ));
        assert!(matches!(
            validate("root ::= \"a\"\nroot ::= \"b\""),
            Err(GrammarError::DuplicateRule(_))
        ));
    }
}
