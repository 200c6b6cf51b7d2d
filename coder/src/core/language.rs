//! Source language detection from file extensions.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Languages recognized by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Html,
    Css,
    Json,
    Markdown,
    Bash,
    Rust,
    Go,
    Java,
    Cpp,
    C,
    Ruby,
    Php,
    Unknown,
}

impl Language {
    /// Detect the language of `path` from its extension (case-insensitive).
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("py") => Self::Python,
            Some("js" | "mjs" | "cjs" | "jsx") => Self::JavaScript,
            Some("ts" | "tsx") => Self::TypeScript,
            Some("html" | "htm") => Self::Html,
            Some("css") => Self::Css,
            Some("json") => Self::Json,
            Some("md") => Self::Markdown,
            Some("sh") => Self::Bash,
            Some("rs") => Self::Rust,
            Some("go") => Self::Go,
            Some("java") => Self::Java,
            Some("cpp" | "cc" | "hpp") => Self::Cpp,
            Some("c" | "h") => Self::C,
            Some("rb") => Self::Ruby,
            Some("php") => Self::Php,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Html => "html",
            Self::Css => "css",
            Self::Json => "json",
            Self::Markdown => "markdown",
            Self::Bash => "bash",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::C => "c",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
