//! Isolate the decision object from noisy model text
//!
//! Pure functions - no async, no IO.

/// Return the first balanced JSON object in `content`.
///
/// Scanning starts at the first `{`. Braces inside string literals (with
/// backslash escapes) do not count. Returns `None` when the text ends before
/// the object closes, including inside an unterminated string.
pub fn try_extract_first_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut in_string = false;
    let mut escape = false;
    let mut depth: usize = 0;

    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset;
                    return Some(&content[start..=end]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Stop predicate for streaming: true once one complete object has been produced
pub fn contains_complete_object(content: &str) -> bool {
    try_extract_first_json_object(content).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_with_noise() {
        let text = r#"noise{"target_x":1,"target_y":1}trailing{ignored}"#;
        assert_eq!(
            try_extract_first_json_object(text),
            Some(r#"{"target_x":1,"target_y":1}"#)
        );
    }

    #[test]
    fn test_extract_nested() {
        let text = r#"Sure! {"outer": {"inner": "value"}} done"#;
        assert_eq!(
            try_extract_first_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#)
        );
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"x {"note": "a } brace { and \"quote}\" here", "n": 2} y"#;
        assert_eq!(
            try_extract_first_json_object(text),
            Some(r#"{"note": "a } brace { and \"quote}\" here", "n": 2}"#)
        );
    }

    #[test]
    fn test_escaped_backslash_before_quote() {
        let text = r#"{"path": "C:\\", "n": {}}tail"#;
        assert_eq!(
            try_extract_first_json_object(text),
            Some(r#"{"path": "C:\\", "n": {}}"#)
        );
    }

    #[test]
    fn test_not_found() {
        assert_eq!(try_extract_first_json_object(""), None);
        assert_eq!(try_extract_first_json_object("no object here }"), None);
        assert_eq!(try_extract_first_json_object(r#"{"target_x": 1"#), None);
        assert_eq!(try_extract_first_json_object(r#"{"open": "never closed}"#), None);
    }

    #[test]
    fn test_embedded_object_round_trip() {
        let objects = [
            r#"{}"#,
            r#"{"action":"hold","target_x":0,"target_y":0}"#,
            r#"{"s": "{{{", "t": "}}}", "u": "\\\""}"#,
            r#"{"a": [1, {"b": "}"}], "c": null}"#,
        ];
        let noise = [("", ""), ("The answer is: ", " Hope that helps!"), ("}}] ", " {")];

        for object in objects {
            for (prefix, suffix) in noise {
                let text = format!("{}{}{}", prefix, object, suffix);
                assert_eq!(try_extract_first_json_object(&text), Some(object), "{}", text);
            }
        }
    }

    #[test]
    fn test_stop_predicate_tracks_stream() {
        let stream = r#"{"target_x": 3, "target_y": 4} extra"#;
        let mut acc = String::new();
        let mut stopped_at = None;
        for (i, ch) in stream.char_indices() {
            acc.push(ch);
            if contains_complete_object(&acc) {
                stopped_at = Some(i);
                break;
            }
        }
        assert_eq!(stopped_at, Some(stream.find('}').unwrap()));
    }
}
