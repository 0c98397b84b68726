//! Code-friendly tokenizer for the lexical index.
//!
//! Fixed variant: case-fold, split on anything that is not an identifier
//! character, preserve identifiers verbatim (no camelCase splitting), no
//! stemming, no stop words. The same tokenizer runs over chunk text at
//! index time and over query strings at search time, so terms round-trip
//! exactly through the FTS table.

use std::collections::BTreeSet;

use crate::models::{ChunkMetadata, FtsDoc};

/// Tokenize text into lowercased identifier-preserving tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Build the weighted token bag for one chunk: deduplicated tag tokens
/// (ranked higher at query time) plus raw content tokens.
pub fn build_fts_doc(chunk_id: &str, metadata: &ChunkMetadata, content: &str) -> FtsDoc {
    let mut tag_tokens: BTreeSet<String> = BTreeSet::new();
    for m in &metadata.semantic_matches {
        for tok in tokenize(&m.value) {
            tag_tokens.insert(tok);
        }
        for tok in tokenize(&m.label) {
            tag_tokens.insert(tok);
        }
    }
    for tag in &metadata.tags {
        for tok in tokenize(tag) {
            tag_tokens.insert(tok);
        }
    }

    FtsDoc {
        chunk_id: chunk_id.to_string(),
        tags: tag_tokens.into_iter().collect::<Vec<_>>().join(" "),
        content: tokenize(content).join(" "),
    }
}

/// Turn a user query into an FTS5 MATCH expression (AND semantics, each
/// term quoted). Returns `None` when no token survives.
pub fn match_expression(query: &str) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SemanticMatch;

    #[test]
    fn test_tokenize_preserves_identifiers() {
        let tokens = tokenize("def process_batch(items):\n    return HTTPClient.send(items)");
        assert!(tokens.contains(&"process_batch".to_string()));
        assert!(tokens.contains(&"httpclient".to_string()));
        assert!(tokens.contains(&"items".to_string()));
        // camelCase is not split
        assert!(!tokens.contains(&"http".to_string()));
    }

    #[test]
    fn test_tokenize_case_folds() {
        assert_eq!(tokenize("FooBar FOOBAR foobar"), vec!["foobar", "foobar", "foobar"]);
    }

    #[test]
    fn test_tokenize_keeps_single_char_identifiers() {
        let tokens = tokenize("x = a + bc");
        assert_eq!(tokens, vec!["x", "a", "bc"]);
    }

    #[test]
    fn test_single_char_query_round_trips() {
        assert_eq!(match_expression("x").as_deref(), Some("\"x\""));
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("+-*/ ()").is_empty());
    }

    #[test]
    fn test_build_fts_doc_dedupes_tags() {
        let meta = ChunkMetadata {
            semantic_matches: vec![
                SemanticMatch {
                    category: "type".into(),
                    value: "function".into(),
                    label: "Function Definition".into(),
                },
                SemanticMatch {
                    category: "role".into(),
                    value: "test_case".into(),
                    label: "Unit/Integration Test Case".into(),
                },
            ],
            tags: vec!["async".into()],
            ..Default::default()
        };
        let doc = build_fts_doc("c1", &meta, "def test_one(): pass");
        assert!(doc.tags.contains("function"));
        assert!(doc.tags.contains("test_case"));
        assert!(doc.tags.contains("async"));
        // "function" appears in both value and label but only once in tags
        assert_eq!(doc.tags.matches("function").count(), 1);
        assert!(doc.content.contains("test_one"));
    }

    #[test]
    fn test_match_expression() {
        assert_eq!(
            match_expression("process batch").as_deref(),
            Some("\"process\" \"batch\"")
        );
        assert_eq!(match_expression("!!"), None);
    }
}
