//! Lightweight structural analysis of source files.
//!
//! [`RegexParser`] understands Python and JavaScript/TypeScript well enough to
//! list imports and function signatures and to reject text whose brackets or
//! string literals do not balance. It is not a full parser; callers treat every
//! [`AnalysisError`] as "analysis unavailable".

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::core::language::Language;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(Language),
    #[error("{language} syntax error on line {line}: {message}")]
    Parse {
        language: Language,
        line: usize,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSignature {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: String,
}

pub trait StructuralParser: Send + Sync {
    /// Import identifiers as written in the source.
    fn dependencies_of(&self, code: &str, language: Language) -> Result<Vec<String>, AnalysisError>;

    fn functions_of(
        &self,
        code: &str,
        language: Language,
    ) -> Result<Vec<FunctionSignature>, AnalysisError>;
}

/// Result of analyzing one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeAnalysis {
    pub language: Language,
    pub line_count: usize,
    pub imports: Vec<String>,
    pub functions: Vec<FunctionSignature>,
}

impl CodeAnalysis {
    /// Human-readable summary used as step output and prompt context.
    pub fn summary(&self, focus: &str) -> String {
        let mut out = format!(
            "Language: {}\nLines: {}\nFocus: {}\n",
            self.language, self.line_count, focus
        );
        if self.imports.is_empty() {
            out.push_str("Imports: none\n");
        } else {
            out.push_str(&format!(
                "Imports ({}): {}\n",
                self.imports.len(),
                self.imports.join(", ")
            ));
        }
        if self.functions.is_empty() {
            out.push_str("Functions: none\n");
        } else {
            out.push_str(&format!("Functions ({}):\n", self.functions.len()));
            for function in &self.functions {
                out.push_str(&format!(
                    "  - {}({})\n",
                    function.name,
                    function.parameters.join(", ")
                ));
            }
        }
        out
    }
}

pub fn analyze(
    parser: &dyn StructuralParser,
    code: &str,
    language: Language,
) -> Result<CodeAnalysis, AnalysisError> {
    Ok(CodeAnalysis {
        language,
        line_count: code.lines().count(),
        imports: parser.dependencies_of(code, language)?,
        functions: parser.functions_of(code, language)?,
    })
}

/// Regex-driven parser for Python and JavaScript/TypeScript.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexParser;

static PY_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*import[ \t]+([^\n#]+)").expect("valid regex"));
static PY_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+(\.*[\w.]*)[ \t]+import[ \t]+\(?([^\n#)]+)").expect("valid regex")
});
static PY_DEF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)(?:async[ \t]+)?def[ \t]+(\w+)[ \t]*\(([^)]*)\)").expect("valid regex")
});
static JS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*(?:import|export)\b[^'";]*?['"]([^'"\n]+)['"]"#).expect("valid regex")
});
static JS_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:require|import)\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("valid regex")
});
static JS_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*\(([^)]*)\)").expect("valid regex")
});
static JS_ARROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\s*)?\(([^)]*)\)[^=>{\n]*(=>)?",
    )
    .expect("valid regex")
});

impl StructuralParser for RegexParser {
    fn dependencies_of(&self, code: &str, language: Language) -> Result<Vec<String>, AnalysisError> {
        check_balanced(code, language)?;
        let mut imports = match language {
            Language::Python => python_imports(code),
            Language::JavaScript | Language::TypeScript => js_imports(code),
            other => return Err(AnalysisError::UnsupportedLanguage(other)),
        };
        imports.dedup();
        Ok(imports)
    }

    fn functions_of(
        &self,
        code: &str,
        language: Language,
    ) -> Result<Vec<FunctionSignature>, AnalysisError> {
        check_balanced(code, language)?;
        match language {
            Language::Python => Ok(python_functions(code)),
            Language::JavaScript | Language::TypeScript => Ok(js_functions(code)),
            other => Err(AnalysisError::UnsupportedLanguage(other)),
        }
    }
}

fn python_imports(code: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for caps in PY_IMPORT_RE.captures_iter(code) {
        let start = caps.get(0).map_or(0, |m| m.start());
        for part in caps[1].split(',') {
            let name = part.split_whitespace().next().unwrap_or_default();
            if !name.is_empty() {
                found.push((start, name.to_string()));
            }
        }
    }
    for caps in PY_FROM_RE.captures_iter(code) {
        let start = caps.get(0).map_or(0, |m| m.start());
        let module = &caps[1];
        if module.chars().all(|c| c == '.') {
            // `from . import a, b` imports sibling modules.
            for part in caps[2].split(',') {
                let name = part.split_whitespace().next().unwrap_or_default();
                if !name.is_empty() && name != "*" {
                    found.push((start, format!("{module}{name}")));
                }
            }
        } else {
            found.push((start, module.to_string()));
        }
    }
    found.sort_by_key(|(start, _)| *start);
    found.into_iter().map(|(_, name)| name).collect()
}

fn js_imports(code: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = JS_IMPORT_RE
        .captures_iter(code)
        .chain(JS_REQUIRE_RE.captures_iter(code))
        .filter_map(|caps| Some((caps.get(0)?.start(), caps.get(1)?.as_str().to_string())))
        .collect();
    found.sort_by_key(|(start, _)| *start);
    let mut names: Vec<String> = Vec::new();
    for (_, name) in found {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn split_parameters(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|param| {
            param
                .split([':', '='])
                .next()
                .unwrap_or_default()
                .trim()
                .trim_end_matches('?')
                .to_string()
        })
        .filter(|param| !param.is_empty())
        .collect()
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

fn python_functions(code: &str) -> Vec<FunctionSignature> {
    PY_DEF_RE
        .captures_iter(code)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let def_indent = indent_width(&caps[1]);
            // The body starts on the line after the one closing the signature.
            let after = &code[whole.end()..];
            let body_start = after.find('\n').map(|idx| idx + 1).unwrap_or(after.len());
            let mut body_lines = Vec::new();
            for line in after[body_start..].lines() {
                if line.trim().is_empty() || indent_width(line) > def_indent {
                    body_lines.push(line);
                } else {
                    break;
                }
            }
            while body_lines.last().is_some_and(|line| line.trim().is_empty()) {
                body_lines.pop();
            }
            Some(FunctionSignature {
                name: caps[2].to_string(),
                parameters: split_parameters(&caps[3]),
                body: body_lines.join("\n"),
            })
        })
        .collect()
}

fn js_functions(code: &str) -> Vec<FunctionSignature> {
    let mut found: Vec<(usize, FunctionSignature)> = Vec::new();
    for caps in JS_FUNCTION_RE.captures_iter(code).chain(JS_ARROW_RE.captures_iter(code)) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        found.push((
            whole.start(),
            FunctionSignature {
                name: caps[1].to_string(),
                parameters: split_parameters(&caps[2]),
                body: js_body(&code[whole.end()..]),
            },
        ));
    }
    found.sort_by_key(|(start, _)| *start);
    found.into_iter().map(|(_, sig)| sig).collect()
}

/// Text of the block following a signature, or the rest of the line for an
/// expression-bodied arrow function.
fn js_body(rest: &str) -> String {
    let trimmed = rest.trim_start();
    let Some(stripped) = trimmed.strip_prefix('{') else {
        return trimmed.lines().next().unwrap_or_default().trim().to_string();
    };
    let mut depth = 1usize;
    for (idx, c) in stripped.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return stripped[..idx].trim().to_string();
                }
            }
            _ => {}
        }
    }
    stripped.trim().to_string()
}

/// Reject unbalanced brackets and unterminated string literals.
fn check_balanced(code: &str, language: Language) -> Result<(), AnalysisError> {
    let python = match language {
        Language::Python => true,
        Language::JavaScript | Language::TypeScript => false,
        other => return Err(AnalysisError::UnsupportedLanguage(other)),
    };
    let parse_error = |line: usize, message: String| AnalysisError::Parse {
        language,
        line,
        message,
    };

    let chars: Vec<char> = code.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '#' if python => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if !python && chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if !python && chars.get(i + 1) == Some(&'*') => {
                let start_line = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(parse_error(start_line, "unterminated comment".to_string())),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
                continue;
            }
            '`' if python => {}
            '\'' | '"' | '`' => {
                let triple = python
                    && chars.get(i + 1) == Some(&c)
                    && chars.get(i + 2) == Some(&c);
                let multiline = triple || c == '`';
                let start_line = line;
                i += if triple { 3 } else { 1 };
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(parse_error(start_line, "unterminated string literal".to_string()));
                        }
                        Some('\\') => {
                            if chars.get(i + 1) == Some(&'\n') {
                                line += 1;
                            }
                            i += 2;
                            continue;
                        }
                        Some('\n') if !multiline => {
                            return Err(parse_error(start_line, "unterminated string literal".to_string()));
                        }
                        Some('\n') => line += 1,
                        Some(&q) if q == c => {
                            if !triple {
                                i += 1;
                                break;
                            }
                            if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                                i += 3;
                                break;
                            }
                        }
                        Some(_) => {}
                    }
                    i += 1;
                }
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(parse_error(
                            line,
                            format!("'{c}' does not match '{open}' opened on line {open_line}"),
                        ));
                    }
                    None => return Err(parse_error(line, format!("unexpected '{c}'"))),
                }
            }
            _ => {}
        }
        i += 1;
    }

    if let Some((open, open_line)) = stack.pop() {
        return Err(parse_error(open_line, format!("'{open}' is never closed")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY: &str = r#"import os, sys as system
from app.models import User
from . import views, forms
from ..util import helpers

# a comment with ( unbalanced
def greet(name: str, greeting="hi"):
    """Docstring with 'quotes' and )"""
    return f"{greeting}, {name}"


async def fetch(url):
    pass

class Thing:
    def method(self, x):
        return [x]
"#;

    #[test]
    fn python_imports_in_source_order() {
        let imports = RegexParser.dependencies_of(PY, Language::Python).expect("parse");
        assert_eq!(
            imports,
            vec!["os", "sys", "app.models", ".views", ".forms", "..util"]
        );
    }

    #[test]
    fn python_functions_with_bodies() {
        let functions = RegexParser.functions_of(PY, Language::Python).expect("parse");
        let names: Vec<&str> = functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["greet", "fetch", "method"]);
        assert_eq!(functions[0].parameters, vec!["name", "greeting"]);
        assert!(functions[0].body.contains("return f\"{greeting}, {name}\""));
        assert_eq!(functions[1].body.trim(), "pass");
    }

    #[test]
    fn js_imports_and_functions() {
        let code = r#"import React from 'react';
import { helper } from "./util";
const fs = require('fs');
export * from './models';

function add(a, b) {
  return { sum: a + b };
}

const double = (x: number) => x * 2;
"#;
        let imports = RegexParser
            .dependencies_of(code, Language::TypeScript)
            .expect("parse");
        assert_eq!(imports, vec!["react", "./util", "fs", "./models"]);

        let functions = RegexParser
            .functions_of(code, Language::TypeScript)
            .expect("parse");
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "add");
        assert_eq!(functions[0].body, "return { sum: a + b };");
        assert_eq!(functions[1].name, "double");
        assert_eq!(functions[1].parameters, vec!["x"]);
        assert_eq!(functions[1].body, "x * 2;");
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = RegexParser
            .dependencies_of("def f(:\n    pass\n", Language::Python)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Parse { line: 1, .. }));

        let err = RegexParser
            .dependencies_of("x = 'unterminated\n", Language::Python)
            .unwrap_err();
        assert!(err.to_string().contains("unterminated string"));

        let err = RegexParser
            .functions_of("function f() { return [1, 2); }", Language::JavaScript)
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn unsupported_languages_are_rejected() {
        assert_eq!(
            RegexParser.dependencies_of("fn main() {}", Language::Rust),
            Err(AnalysisError::UnsupportedLanguage(Language::Rust))
        );
    }

    #[test]
    fn summary_lists_imports_and_functions() {
        let analysis = analyze(&RegexParser, PY, Language::Python).expect("analyze");
        let summary = analysis.summary("general");
        assert!(summary.contains("Language: python"));
        assert!(summary.contains("greet(name, greeting)"));
        assert!(summary.contains("Focus: general"));
    }
}
