//! Body serialization for POST events.
//!
//! The collection endpoint expects a flat JSON object with one `"key": "value"`
//! pair per line, in insertion order.

use crate::types::EventParameters;

/// Renders an [`EventParameters`] set into a request body.
pub trait PayloadSerializer: Send + Sync {
    fn serialize(&self, params: &EventParameters) -> String;
}

/// Tab-indented JSON object writer, one entry per line.
///
/// An empty set renders as `{}`. Keys and values are JSON-escaped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyObjectWriter;

impl PayloadSerializer for PrettyObjectWriter {
    fn serialize(&self, params: &EventParameters) -> String {
        if params.is_empty() {
            return "{}".to_string();
        }

        let entries: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("\t{}: {}", quote(key), quote(value)))
            .collect();

        format!("{{\n{}\n}}", entries.join(",\n"))
    }
}

fn quote(s: &str) -> String {
    // Serializing a &str cannot fail
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_renders_braces() {
        assert_eq!(PrettyObjectWriter.serialize(&EventParameters::new()), "{}");
    }

    #[test]
    fn test_entries_in_insertion_order() {
        let params: EventParameters = [("a", "1"), ("b", "2")].into_iter().collect();
        let body = PrettyObjectWriter.serialize(&params);

        assert_eq!(body, "{\n\t\"a\": \"1\",\n\t\"b\": \"2\"\n}");
        assert_eq!(body.matches(',').count(), 1);
        assert!(!body.contains(",\n}"));
    }

    #[test]
    fn test_output_is_valid_json() {
        let params: EventParameters = [("quote", "say \"hi\""), ("path", "a\\b")]
            .into_iter()
            .collect();
        let body = PrettyObjectWriter.serialize(&params);

        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["quote"], "say \"hi\"");
        assert_eq!(parsed["path"], "a\\b");
    }
}
