//! LLM-based extraction of structured facts from dialog content.

use std::sync::Arc;

use serde_json::Value;

use pv_domain::chat::ChatMessage;
use pv_providers::{json_extract, ChatClient, ChatOptions};

const EXTRACTION_PROMPT: &str = r#"You are an information extraction assistant.
Extract structured information from a single chat message.

Rules:
1. Extract meaningful fact triples (subject, predicate, object).
2. Detect time expressions when present.
3. Detect location expressions when present.
4. Extract key entities and keywords.

Return strict JSON only:
{
  "facts": [
    {"subject": "...", "predicate": "...", "object": "...", "time": "...", "location": "...", "confidence": 0.9}
  ],
  "entities": ["..."],
  "time_expressions": ["..."],
  "locations": ["..."],
  "keywords": ["..."]
}"#;

#[derive(Debug, Clone, Default)]
pub struct FactTriple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub time: Option<String>,
    pub location: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub triples: Vec<FactTriple>,
    pub entities: Vec<String>,
    pub time_expressions: Vec<String>,
    pub locations: Vec<String>,
    pub keywords: Vec<String>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
            && self.entities.is_empty()
            && self.time_expressions.is_empty()
            && self.locations.is_empty()
    }
}

pub struct LlmExtractor {
    client: Arc<dyn ChatClient>,
    model: Option<String>,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn ChatClient>, model: Option<String>) -> Self {
        Self { client, model }
    }

    /// Extract structured information from one message. A failure or
    /// empty first pass gets one strict-JSON retry at temperature 0.
    pub async fn extract(&self, role: &str, content: &str) -> Extraction {
        let user_prompt = format!("Role: {role}\nContent: {content}");
        let messages = [
            ChatMessage::system(EXTRACTION_PROMPT),
            ChatMessage::user(user_prompt),
        ];

        let first = self
            .call(&messages, 0.3, false)
            .await
            .map(|text| parse_extraction(&text))
            .unwrap_or_default();
        if !first.is_empty() {
            return first;
        }

        match self.call(&messages, 0.0, true).await {
            Ok(text) => {
                let second = parse_extraction(&text);
                if second.is_empty() {
                    first
                } else {
                    second
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "strict-JSON extraction retry failed");
                first
            }
        }
    }

    async fn call(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        json_mode: bool,
    ) -> pv_domain::error::Result<String> {
        let opts = ChatOptions {
            model: self.model.clone(),
            temperature: Some(temperature),
            max_tokens: Some(1000),
            json_mode,
        };
        Ok(self.client.chat(messages, &opts).await?.content)
    }
}

fn parse_extraction(text: &str) -> Extraction {
    let Some(value) = json_extract(text) else {
        return Extraction::default();
    };

    let strings = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    let triples = value
        .get("facts")
        .and_then(Value::as_array)
        .map(|facts| {
            facts
                .iter()
                .filter_map(|fact| {
                    let subject = fact.get("subject")?.as_str()?.to_string();
                    let predicate = fact.get("predicate")?.as_str()?.to_string();
                    if subject.is_empty() || predicate.is_empty() {
                        return None;
                    }
                    Some(FactTriple {
                        subject,
                        predicate,
                        object: fact
                            .get("object")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        time: fact.get("time").and_then(Value::as_str).and_then(|t| {
                            if t.is_empty() { None } else { Some(t.to_string()) }
                        }),
                        location: fact.get("location").and_then(Value::as_str).and_then(|l| {
                            if l.is_empty() { None } else { Some(l.to_string()) }
                        }),
                        confidence: fact.get("confidence").and_then(Value::as_f64).unwrap_or(0.8),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Extraction {
        triples,
        entities: strings("entities"),
        time_expressions: strings("time_expressions"),
        locations: strings("locations"),
        keywords: strings("keywords"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_extraction() {
        let text = r#"{"facts": [{"subject": "alice", "predicate": "moved to", "object": "berlin",
            "time": "last year", "confidence": 0.9}],
            "entities": ["alice", "berlin"], "time_expressions": ["last year"],
            "locations": ["berlin"], "keywords": ["move"]}"#;
        let extraction = parse_extraction(text);
        assert_eq!(extraction.triples.len(), 1);
        assert_eq!(extraction.triples[0].object, "berlin");
        assert_eq!(extraction.triples[0].time.as_deref(), Some("last year"));
        assert_eq!(extraction.entities, vec!["alice", "berlin"]);
    }

    #[test]
    fn malformed_facts_are_skipped() {
        let text = r#"{"facts": [{"predicate": "p"}], "entities": ["x"]}"#;
        let extraction = parse_extraction(text);
        assert!(extraction.triples.is_empty());
        assert_eq!(extraction.entities, vec!["x"]);
    }

    #[test]
    fn non_json_yields_empty() {
        assert!(parse_extraction("sorry, no data").is_empty());
    }
}
