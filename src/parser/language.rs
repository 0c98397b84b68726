use std::path::Path;

/// A language the parser can build a syntax tree for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Rust,
    Go,
    Java,
}

impl Language {
    /// Detect a parseable language from a normalized extension (with dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            ".py" => Self::Python,
            ".js" | ".jsx" => Self::JavaScript,
            ".ts" | ".tsx" => Self::TypeScript,
            ".rs" => Self::Rust,
            ".go" => Self::Go,
            ".java" => Self::Java,
            _ => return None,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))?;
        Self::from_extension(&ext)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
        }
    }

    /// The tree-sitter grammar for this language.
    pub fn grammar(self) -> tree_sitter::Language {
        match self {
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Go => tree_sitter_go::LANGUAGE.into(),
            Self::Java => tree_sitter_java::LANGUAGE.into(),
        }
    }

    /// Whether a semantic role query set exists for this language.
    /// Languages without one still get structural chunking.
    pub const fn has_semantic_queries(self) -> bool {
        matches!(self, Self::Python | Self::JavaScript | Self::TypeScript)
    }
}

/// Language tag stored on the file record, covering every extension the
/// collector admits (not just the parseable ones).
pub fn language_tag(ext: &str) -> &'static str {
    match ext {
        ".py" => "python",
        ".js" | ".jsx" => "javascript",
        ".ts" | ".tsx" => "typescript",
        ".java" => "java",
        ".go" => "go",
        ".rs" => "rust",
        ".c" | ".h" => "c",
        ".cc" | ".cpp" | ".hpp" => "cpp",
        ".cs" => "csharp",
        ".php" => "php",
        ".rb" => "ruby",
        ".kt" => "kotlin",
        ".scala" => "scala",
        ".vue" => "vue",
        ".svelte" => "svelte",
        ".css" | ".scss" => "css",
        ".html" => "html",
        ".json" => "json",
        ".yaml" | ".yml" => "yaml",
        ".toml" => "toml",
        ".xml" => "xml",
        ".sql" => "sql",
        ".md" => "markdown",
        ".rst" => "rst",
        _ => "unknown",
    }
}
