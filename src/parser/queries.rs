//! Semantic capture queries and role refinement.
//!
//! Each language with a query set gets structural captures (`type.*`) from
//! an embedded S-expression query, then a refinement pass derives
//! functional roles (`role.*`) from names, decorators, and call sites —
//! the Rust tree-sitter runtime does not auto-apply `#eq?`-style
//! predicates, so name checks live in code.
//!
//! Capture vocabulary (attached to chunk metadata and mirrored into the
//! lexical index): roles `entry_point`, `api_endpoint`, `test_case`,
//! `test_suite`, `data_schema`; types `class`, `function`, `method`,
//! `interface`.

use tree_sitter::{Node, Query, QueryCursor, StreamingIterator, Tree};

use super::language::Language;
use crate::models::SemanticMatch;

/// A semantic match anchored to a byte range in the file.
#[derive(Debug, Clone)]
pub struct SemanticCapture {
    pub start: usize,
    pub end: usize,
    pub category: String,
    pub value: String,
    pub label: String,
}

impl SemanticCapture {
    pub fn to_match(&self) -> SemanticMatch {
        SemanticMatch {
            category: self.category.clone(),
            value: self.value.clone(),
            label: self.label.clone(),
        }
    }
}

const PYTHON_QUERY: &str = r#"
(function_definition name: (identifier) @name) @type.function
(class_definition name: (identifier) @name) @type.class
(class_definition superclasses: (argument_list) @bases) @meta.class_bases
(decorated_definition (decorator) @decorator) @meta.decorated
(if_statement condition: (comparison_operator) @cond) @meta.main_guard
"#;

const JAVASCRIPT_QUERY: &str = r#"
(function_declaration name: (identifier) @name) @type.function
(generator_function_declaration name: (identifier) @name) @type.function
(class_declaration name: (identifier) @name) @type.class
(method_definition name: (property_identifier) @name) @type.method
(variable_declarator name: (identifier) @name value: (arrow_function)) @type.function
(call_expression function: (identifier) @callee) @meta.call
(call_expression function: (member_expression) @callee) @meta.call
"#;

const TYPESCRIPT_QUERY: &str = r#"
(function_declaration name: (identifier) @name) @type.function
(generator_function_declaration name: (identifier) @name) @type.function
(class_declaration name: (type_identifier) @name) @type.class
(method_definition name: (property_identifier) @name) @type.method
(variable_declarator name: (identifier) @name value: (arrow_function)) @type.function
(interface_declaration name: (type_identifier) @name) @type.interface
(type_alias_declaration name: (type_identifier) @name) @type.interface
(call_expression function: (identifier) @callee) @meta.call
(call_expression function: (member_expression) @callee) @meta.call
"#;

fn query_source(language: Language) -> Option<&'static str> {
    match language {
        Language::Python => Some(PYTHON_QUERY),
        Language::JavaScript => Some(JAVASCRIPT_QUERY),
        Language::TypeScript => Some(TYPESCRIPT_QUERY),
        _ => None,
    }
}

/// Human-readable label for a capture, matching the index vocabulary.
pub fn generate_label(category: &str, value: &str) -> String {
    match (category, value) {
        ("role", "entry_point") => "Application Entry Point".to_string(),
        ("role", "test_suite") => "Test Suite".to_string(),
        ("role", "test_case") => "Unit/Integration Test Case".to_string(),
        ("role", "api_endpoint") => "API Route Handler".to_string(),
        ("role", "data_schema") => "Data Model / Schema".to_string(),
        ("type", "class") => "Class Definition".to_string(),
        ("type", "function") => "Function Definition".to_string(),
        ("type", "method") => "Method Definition".to_string(),
        ("type", "interface") => "Interface Definition".to_string(),
        (_, value) => {
            let mut out = String::new();
            for (i, word) in value.split('_').enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                let mut chars = word.chars();
                if let Some(first) = chars.next() {
                    out.extend(first.to_uppercase());
                    out.push_str(chars.as_str());
                }
            }
            out
        }
    }
}

/// Run the language's query over a parsed tree and return all captures,
/// structural and refined. Returns an empty list for languages without a
/// query set; the file is still chunked.
pub fn semantic_captures(language: Language, tree: &Tree, source: &[u8]) -> Vec<SemanticCapture> {
    let Some(query_src) = query_source(language) else {
        return Vec::new();
    };

    let query = match Query::new(&language.grammar(), query_src) {
        Ok(q) => q,
        Err(e) => {
            tracing::warn!(language = language.as_str(), error = %e, "invalid semantic query");
            return Vec::new();
        }
    };

    let mut captures = Vec::new();
    let mut cursor = QueryCursor::new();
    let capture_names = query.capture_names();

    let mut matches = cursor.matches(&query, tree.root_node(), source);
    while let Some(m) = matches.next() {
        let mut root: Option<(Node, &str)> = None;
        let mut name_text: Option<String> = None;
        let mut decorator_text: Option<String> = None;
        let mut bases_text: Option<String> = None;
        let mut cond_text: Option<String> = None;
        let mut callee_text: Option<String> = None;

        for cap in m.captures {
            let cap_name = capture_names[cap.index as usize];
            let text = || node_text(cap.node, source);
            match cap_name {
                "name" => name_text = Some(text()),
                "decorator" => decorator_text = Some(text()),
                "bases" => bases_text = Some(text()),
                "cond" => cond_text = Some(text()),
                "callee" => callee_text = Some(text()),
                other if other.starts_with("type.") || other.starts_with("meta.") => {
                    root = Some((cap.node, other));
                }
                _ => {}
            }
        }

        let Some((node, root_name)) = root else {
            continue;
        };
        let (start, end) = (node.start_byte(), node.end_byte());

        if let Some(kind) = root_name.strip_prefix("type.") {
            let kind = refine_kind(language, kind, node);
            captures.push(capture(start, end, "type", kind));

            if let Some(role) =
                role_from_definition(language, kind, name_text.as_deref().unwrap_or(""))
            {
                captures.push(capture(start, end, "role", role));
            }
        } else {
            match root_name {
                "meta.decorated" => {
                    if let Some(role) = role_from_decorator(decorator_text.as_deref().unwrap_or(""))
                    {
                        captures.push(capture(start, end, "role", role));
                    }
                }
                "meta.class_bases" => {
                    let bases = bases_text.unwrap_or_default();
                    if bases.contains("BaseModel") || bases.contains("TypedDict") {
                        captures.push(capture(start, end, "role", "data_schema"));
                    }
                }
                "meta.main_guard" => {
                    if cond_text.unwrap_or_default().contains("__name__") {
                        captures.push(capture(start, end, "role", "entry_point"));
                    }
                }
                "meta.call" => {
                    if let Some(role) = role_from_call(callee_text.as_deref().unwrap_or("")) {
                        captures.push(capture(start, end, "role", role));
                    }
                }
                _ => {}
            }
        }
    }

    captures
}

fn capture(start: usize, end: usize, category: &str, value: &str) -> SemanticCapture {
    SemanticCapture {
        start,
        end,
        category: category.to_string(),
        value: value.to_string(),
        label: generate_label(category, value),
    }
}

fn node_text(node: Node, source: &[u8]) -> String {
    String::from_utf8_lossy(&source[node.byte_range()]).to_string()
}

/// A Python `function_definition` nested inside a class body is a method.
fn refine_kind<'a>(language: Language, kind: &'a str, node: Node) -> &'a str {
    if language == Language::Python && kind == "function" {
        let mut parent = node.parent();
        while let Some(p) = parent {
            match p.kind() {
                "class_definition" => return "method",
                "function_definition" => return kind,
                _ => parent = p.parent(),
            }
        }
    }
    kind
}

fn role_from_definition(language: Language, kind: &str, name: &str) -> Option<&'static str> {
    match language {
        Language::Python => match kind {
            "function" | "method" if name.starts_with("test_") => Some("test_case"),
            "function" if name == "main" => Some("entry_point"),
            "class" if name.starts_with("Test") => Some("test_suite"),
            _ => None,
        },
        Language::JavaScript | Language::TypeScript => match kind {
            "function" | "method" if name == "main" => Some("entry_point"),
            _ => None,
        },
        _ => None,
    }
}

fn role_from_decorator(decorator: &str) -> Option<&'static str> {
    if decorator.contains("dataclass") {
        return Some("data_schema");
    }
    for marker in [".route", ".get(", ".post(", ".put(", ".delete(", ".patch("] {
        if decorator.contains(marker) {
            return Some("api_endpoint");
        }
    }
    None
}

fn role_from_call(callee: &str) -> Option<&'static str> {
    match callee {
        "describe" => return Some("test_suite"),
        "it" | "test" => return Some("test_case"),
        _ => {}
    }
    let (object, method) = callee.rsplit_once('.')?;
    let object = object.rsplit('.').next().unwrap_or(object);
    let routing_object = matches!(object, "app" | "router" | "server");
    let http_verb = matches!(method, "get" | "post" | "put" | "delete" | "patch");
    (routing_object && http_verb).then_some("api_endpoint")
}
