//! Query-time memory recall: three-layer graph query with dynamic
//! parameters and context formatting.

use std::sync::Arc;

use crate::graph::{GraphStore, RecallItem, RecallLayers};
use crate::hot::HotLayer;
use crate::scope::{session_node_id, user_node_id};

/// Reminiscence markers widen the recall window when present.
const REMINISCENCE_MARKERS: [&str; 10] = [
    "before",
    "just now",
    "last time",
    "remember",
    "said",
    "之前",
    "刚才",
    "上次",
    "记得",
    "说过",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecallParams {
    pub max_tokens: usize,
    pub items_per_layer: usize,
    pub recent_days: i64,
}

/// Derive recall parameters from query complexity: entity count and
/// query length pick a preset; reminiscence markers widen it.
pub(crate) fn calculate_params(query: &str, entity_count: usize) -> RecallParams {
    let query_length = query.chars().count();

    let mut params = if entity_count >= 3 || query_length > 80 {
        RecallParams {
            max_tokens: 2500,
            items_per_layer: 5,
            recent_days: 14,
        }
    } else if entity_count >= 1 || query_length > 20 {
        RecallParams {
            max_tokens: 1500,
            items_per_layer: 3,
            recent_days: 7,
        }
    } else {
        RecallParams {
            max_tokens: 800,
            items_per_layer: 2,
            recent_days: 3,
        }
    };

    if REMINISCENCE_MARKERS.iter().any(|m| query.contains(m)) {
        params.items_per_layer += 1;
        params.recent_days += 3;
    }

    params
}

pub struct RecallEngine {
    store: Arc<dyn GraphStore>,
}

impl RecallEngine {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Recall relevant memory for a query and format it as a context
    /// string. Failures degrade to an empty string.
    pub async fn recall(
        &self,
        hot: &HotLayer,
        query: &str,
        session_id: &str,
        user_id: &str,
    ) -> String {
        let entities = hot.extract_query_entities(query).await;
        let params = calculate_params(query, entities.len());

        let layers = match self
            .store
            .three_layer_recall(
                &entities,
                &user_node_id(Some(user_id)),
                &session_node_id(session_id, Some(user_id)),
                params.recent_days,
            )
            .await
        {
            Ok(layers) => layers,
            Err(e) => {
                tracing::error!(error = %e, "recall query failed");
                return String::new();
            }
        };

        format_context(&layers, params.max_tokens, params.items_per_layer)
    }
}

/// Sort by importance then recency, truncate items to 100 chars, cap
/// the total at the token budget (`len / 1.5` per item).
pub(crate) fn format_context(
    layers: &RecallLayers,
    max_tokens: usize,
    items_per_layer: usize,
) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut token_count = 0usize;

    let sections: [(&[RecallItem], &str); 3] = [
        (&layers.direct, "[Directly relevant memory]"),
        (&layers.related, "[Related knowledge]"),
        (&layers.recent, "[Recent conversation]"),
    ];

    for (items, header) in sections {
        if items.is_empty() {
            continue;
        }

        let mut sorted: Vec<&RecallItem> = items.iter().collect();
        sorted.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.time.cmp(&a.time))
        });

        let mut section_lines = vec![header.to_string()];
        for item in sorted.into_iter().take(items_per_layer) {
            if item.content.is_empty() {
                continue;
            }
            let est_tokens = item.content.chars().count() * 2 / 3;
            if token_count + est_tokens > max_tokens {
                break;
            }

            let time_str = item.time.format("%m-%d");
            let preview: String = item.content.chars().take(100).collect();
            let ellipsis = if item.content.chars().count() > 100 {
                "..."
            } else {
                ""
            };
            let via = item
                .via
                .as_deref()
                .map(|v| format!(" (via: {v})"))
                .unwrap_or_default();
            section_lines.push(format!("- [{time_str}] {preview}{ellipsis}{via}"));
            token_count += est_tokens;
        }

        if section_lines.len() > 1 {
            lines.extend(section_lines);
            lines.push(String::new());
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(content: &str, importance: f64) -> RecallItem {
        RecallItem {
            content: content.to_string(),
            time: Utc::now(),
            importance,
            via: None,
        }
    }

    #[test]
    fn params_scale_with_complexity() {
        let simple = calculate_params("hi there", 0);
        assert_eq!((simple.max_tokens, simple.items_per_layer, simple.recent_days), (800, 2, 3));

        let normal = calculate_params("what did we decide about the app", 1);
        assert_eq!((normal.max_tokens, normal.items_per_layer, normal.recent_days), (1500, 3, 7));

        let complex = calculate_params("x", 3);
        assert_eq!(
            (complex.max_tokens, complex.items_per_layer, complex.recent_days),
            (2500, 5, 14)
        );
    }

    #[test]
    fn reminiscence_markers_widen_window() {
        let params = calculate_params("do you remember my plan", 1);
        assert_eq!(params.items_per_layer, 4);
        assert_eq!(params.recent_days, 10);

        let cjk = calculate_params("我们之前聊过什么", 0);
        assert_eq!(cjk.items_per_layer, 3);
        assert_eq!(cjk.recent_days, 6);
    }

    #[test]
    fn formatting_orders_by_importance_and_caps_items() {
        let layers = RecallLayers {
            direct: vec![item("low", 0.2), item("high", 0.9), item("mid", 0.5)],
            related: vec![],
            recent: vec![],
        };
        let context = format_context(&layers, 1000, 2);
        assert!(context.contains("[Directly relevant memory]"));
        assert!(context.contains("high"));
        assert!(context.contains("mid"));
        assert!(!context.contains("low"));
    }

    #[test]
    fn formatting_truncates_long_items() {
        let long = "x".repeat(150);
        let layers = RecallLayers {
            direct: vec![item(&long, 0.9)],
            related: vec![],
            recent: vec![],
        };
        let context = format_context(&layers, 1000, 3);
        assert!(context.contains(&format!("{}...", "x".repeat(100))));
    }

    #[test]
    fn empty_layers_yield_empty_context() {
        let context = format_context(&RecallLayers::default(), 1000, 3);
        assert!(context.is_empty());
    }

    #[test]
    fn token_budget_stops_output() {
        let layers = RecallLayers {
            direct: vec![item(&"a".repeat(90), 0.9), item(&"b".repeat(90), 0.8)],
            related: vec![],
            recent: vec![],
        };
        // Budget fits one ~60-token item but not two.
        let context = format_context(&layers, 100, 5);
        assert!(context.contains('a'));
        assert!(!context.contains('b'));
    }
}
