//! Tolerant JSON recovery for model output.

use serde_json::Value;

/// Extract the outermost JSON object from free-form model text.
///
/// Handles fenced code blocks and leading/trailing prose; returns
/// `None` when no parseable object is found.
pub fn json_extract(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }

    let candidate = if let Some(rest) = text.split("```json").nth(1) {
        rest.split("```").next().unwrap_or(rest)
    } else if let Some(rest) = text.split("```").nth(1) {
        rest.split("```").next().unwrap_or(rest)
    } else {
        text
    };

    let start = candidate.find('{')?;
    let end = candidate.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&candidate[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_object() {
        let value = json_extract(r#"{"recall": true}"#).unwrap();
        assert_eq!(value["recall"], true);
    }

    #[test]
    fn extracts_from_prose() {
        let value = json_extract(r#"Sure, here it is: {"recall": false} Hope that helps."#).unwrap();
        assert_eq!(value["recall"], false);
    }

    #[test]
    fn extracts_from_code_fence() {
        let text = "```json\n{\"has_long_term_state\": true, \"candidates\": []}\n```";
        let value = json_extract(text).unwrap();
        assert_eq!(value["has_long_term_state"], true);
    }

    #[test]
    fn nested_braces_survive() {
        let value = json_extract(r#"{"a": {"b": 1}, "c": [2, 3]}"#).unwrap();
        assert_eq!(value["a"]["b"], 1);
    }

    #[test]
    fn garbage_returns_none() {
        assert!(json_extract("").is_none());
        assert!(json_extract("no json here").is_none());
        assert!(json_extract("{broken").is_none());
    }
}
