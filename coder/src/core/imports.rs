//! Resolve import identifiers to workspace-relative file paths.
//!
//! The structural parser reports imports as written in the source (`app.models`,
//! `./util`, `..helpers`). The dependency graph is keyed by file path, so each
//! identifier is mapped to the candidate files it may refer to.

use crate::core::language::Language;
use crate::core::path::normalize_relative;

const JS_EXTENSIONS: &[&str] = &["", ".js", ".ts", ".jsx", ".tsx", ".mjs", "/index.js", "/index.ts"];

/// Candidate paths for `import` as seen from the file at `importer`.
///
/// Candidates are returned in preference order; callers pick those that exist.
/// Package imports with no local meaning (e.g. `react`, `os`) still produce
/// candidates, which simply never match a tracked file.
pub fn candidate_paths(importer: &str, language: Language, import: &str) -> Vec<String> {
    match language {
        Language::Python => python_candidates(importer, import),
        Language::JavaScript | Language::TypeScript => js_candidates(importer, import),
        _ => Vec::new(),
    }
}

/// Resolve every import to the first candidate accepted by `exists`.
pub fn resolve_imports<F>(importer: &str, language: Language, imports: &[String], exists: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    let mut resolved: Vec<String> = imports
        .iter()
        .filter_map(|import| {
            candidate_paths(importer, language, import)
                .into_iter()
                .find(|candidate| exists(candidate))
        })
        .filter(|path| path != importer)
        .collect();
    resolved.sort();
    resolved.dedup();
    resolved
}

fn parent_dir(path: &str) -> &str {
    path.rfind('/').map(|idx| &path[..idx]).unwrap_or("")
}

fn join(dir: &str, rest: &str) -> String {
    if dir.is_empty() {
        rest.to_string()
    } else {
        format!("{dir}/{rest}")
    }
}

fn python_candidates(importer: &str, import: &str) -> Vec<String> {
    let import = import.trim();
    let dots = import.chars().take_while(|c| *c == '.').count();
    let module = &import[dots..];

    let base = if dots == 0 {
        String::new()
    } else {
        // `.x` is relative to the importer's package, each extra dot goes up one.
        let mut dir = parent_dir(importer).to_string();
        for _ in 1..dots {
            dir = parent_dir(&dir).to_string();
        }
        dir
    };

    let module_path = module.replace('.', "/");
    let stem = match (base.is_empty(), module_path.is_empty()) {
        (_, true) => base.clone(),
        (true, false) => module_path,
        (false, false) => format!("{base}/{module_path}"),
    };
    if stem.is_empty() {
        return Vec::new();
    }

    let mut candidates = vec![format!("{stem}.py"), format!("{stem}/__init__.py")];
    // Absolute imports inside a package often resolve from the importer's root dir.
    if dots == 0 {
        let sibling = join(parent_dir(importer), &format!("{stem}.py"));
        if !candidates.contains(&sibling) {
            candidates.push(sibling);
        }
    }
    candidates
        .into_iter()
        .filter_map(|candidate| normalize_relative(&candidate).ok())
        .collect()
}

fn js_candidates(importer: &str, import: &str) -> Vec<String> {
    let import = import.trim();
    if !(import.starts_with("./") || import.starts_with("../")) {
        return Vec::new();
    }
    let joined = join(parent_dir(importer), import);
    let Ok(base) = normalize_relative(&joined) else {
        return Vec::new();
    };
    JS_EXTENSIONS
        .iter()
        .map(|ext| format!("{base}{ext}"))
        .collect()
}
