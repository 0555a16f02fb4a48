//! [`LanguageSpec`]: per-language import extraction rules.

use regex::Regex;

use crate::graph::Language;

/// How an import statement's target is classified, which drives the
/// resolver's skip/resolve/diagnose decision.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ImportKind {
    Stdlib,
    ThirdParty,
    Relative,
    Absolute,
}

/// One import extracted from a source file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Import {
    pub raw: String,
    pub kind: ImportKind,
}

/// Extraction rules for one language: which files it owns, how to find
/// import statements in them, and how to classify what's imported.
///
/// Regex-based per spec ("regex or minimal parser patterns"); a language
/// needing a real parser can still conform to this shape by producing the
/// same `Vec<Import>` from a custom `extract` implementation.
pub struct LanguageSpec {
    pub language: Language,
    pub extensions: &'static [&'static str],
    pub import_patterns: Vec<Regex>,
    pub classify: fn(&str) -> ImportKind,
    pub manifest_file: Option<&'static str>,
    /// If true, import statements may appear anywhere in the file and the
    /// resolver must not apply the 64 KiB head-read bound.
    pub imports_anywhere: bool,
}

impl LanguageSpec {
    pub fn owns_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    pub fn extract(&self, contents: &str) -> Vec<Import> {
        let mut imports = Vec::new();
        for pattern in &self.import_patterns {
            for captures in pattern.captures_iter(contents) {
                let Some(name) = captures.get(1) else {
                    continue;
                };
                let raw = name.as_str().to_string();
                let kind = (self.classify)(&raw);
                imports.push(Import { raw, kind });
            }
        }
        imports
    }
}

/// Owned, explicitly-constructed table of built-in [`LanguageSpec`]s.
///
/// Not a lazy global: callers build one per analyzer run (or reuse a single
/// long-lived instance), matching the "no process-wide singleton" posture
/// used for [`crate::graph::Interner`].
pub struct LanguageRegistry {
    specs: Vec<LanguageSpec>,
}

impl LanguageRegistry {
    pub fn with_defaults() -> Self {
        Self {
            specs: vec![
                rust_spec(),
                python_spec(),
                javascript_spec(),
                typescript_spec(),
                c_spec(),
                cpp_spec(),
                go_spec(),
                java_spec(),
            ],
        }
    }

    pub fn empty() -> Self {
        Self { specs: Vec::new() }
    }

    pub fn push(&mut self, spec: LanguageSpec) {
        self.specs.push(spec);
    }

    pub fn for_extension(&self, ext: &str) -> Option<&LanguageSpec> {
        self.specs.iter().find(|spec| spec.owns_extension(ext))
    }

    pub fn for_language(&self, language: Language) -> Option<&LanguageSpec> {
        self.specs.iter().find(|spec| spec.language == language)
    }
}

fn classify_rust(raw: &str) -> ImportKind {
    let root = raw.split("::").next().unwrap_or(raw);
    match root {
        "std" | "core" | "alloc" => ImportKind::Stdlib,
        "crate" | "self" | "super" => ImportKind::Relative,
        _ => ImportKind::ThirdParty,
    }
}

fn rust_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::Rust,
        extensions: &["rs"],
        import_patterns: vec![Regex::new(r"(?m)^\s*use\s+([:\w]+)").expect("valid regex")],
        classify: classify_rust,
        manifest_file: Some("Cargo.toml"),
        imports_anywhere: false,
    }
}

fn classify_python(raw: &str) -> ImportKind {
    if raw.starts_with('.') {
        return ImportKind::Relative;
    }
    const STDLIB: &[&str] = &[
        "os", "sys", "re", "io", "json", "typing", "collections", "itertools", "functools",
        "pathlib", "asyncio", "dataclasses", "abc", "math",
    ];
    let root = raw.split('.').next().unwrap_or(raw);
    if STDLIB.contains(&root) {
        ImportKind::Stdlib
    } else {
        ImportKind::ThirdParty
    }
}

fn python_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::Python,
        extensions: &["py"],
        import_patterns: vec![
            Regex::new(r"(?m)^\s*import\s+([\w\.]+)").expect("valid regex"),
            Regex::new(r"(?m)^\s*from\s+([\w\.]+)\s+import").expect("valid regex"),
        ],
        classify: classify_python,
        manifest_file: Some("pyproject.toml"),
        imports_anywhere: false,
    }
}

fn classify_js(raw: &str) -> ImportKind {
    if raw.starts_with('.') || raw.starts_with('/') {
        ImportKind::Relative
    } else {
        ImportKind::ThirdParty
    }
}

fn js_import_patterns() -> Vec<Regex> {
    vec![
        Regex::new(r#"(?m)^\s*import\s+.*?from\s+['"]([^'"]+)['"]"#).expect("valid regex"),
        Regex::new(r#"(?m)require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid regex"),
    ]
}

fn javascript_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::JavaScript,
        extensions: &["js", "jsx", "mjs", "cjs"],
        import_patterns: js_import_patterns(),
        classify: classify_js,
        manifest_file: Some("package.json"),
        imports_anywhere: false,
    }
}

fn typescript_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::TypeScript,
        extensions: &["ts", "tsx"],
        import_patterns: js_import_patterns(),
        classify: classify_js,
        manifest_file: Some("package.json"),
        imports_anywhere: false,
    }
}

fn classify_c_family(raw: &str) -> ImportKind {
    if raw.starts_with('"') {
        ImportKind::Relative
    } else {
        ImportKind::Stdlib
    }
}

fn c_family_patterns() -> Vec<Regex> {
    vec![Regex::new(r#"(?m)^\s*#include\s+([<"][^>"]+[>"])"#).expect("valid regex")]
}

fn c_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::C,
        extensions: &["c", "h"],
        import_patterns: c_family_patterns(),
        classify: classify_c_family,
        manifest_file: None,
        imports_anywhere: false,
    }
}

fn cpp_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::Cpp,
        extensions: &["cc", "cpp", "cxx", "hpp", "hh"],
        import_patterns: c_family_patterns(),
        classify: classify_c_family,
        manifest_file: None,
        imports_anywhere: false,
    }
}

fn classify_go(raw: &str) -> ImportKind {
    if !raw.contains('.') {
        ImportKind::Stdlib
    } else {
        ImportKind::ThirdParty
    }
}

fn go_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::Go,
        extensions: &["go"],
        import_patterns: vec![
            Regex::new(r#"(?m)^\s*import\s+"([^"]+)""#).expect("valid regex"),
            Regex::new(r#"(?m)^\s*"([^"]+)""#).expect("valid regex"),
        ],
        classify: classify_go,
        manifest_file: Some("go.mod"),
        imports_anywhere: true,
    }
}

fn classify_java(raw: &str) -> ImportKind {
    if raw.starts_with("java.") || raw.starts_with("javax.") {
        ImportKind::Stdlib
    } else {
        ImportKind::ThirdParty
    }
}

fn java_spec() -> LanguageSpec {
    LanguageSpec {
        language: Language::Java,
        extensions: &["java"],
        import_patterns: vec![Regex::new(r"(?m)^\s*import\s+([\w\.]+)\s*;").expect("valid regex")],
        classify: classify_java,
        manifest_file: Some("pom.xml"),
        imports_anywhere: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_use_is_extracted_and_classified() {
        let spec = rust_spec();
        let imports = spec.extract("use std::collections::HashMap;\nuse crate::foo::Bar;\n");
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].kind, ImportKind::Stdlib);
        assert_eq!(imports[1].kind, ImportKind::Relative);
    }

    #[test]
    fn python_relative_import_is_classified() {
        let spec = python_spec();
        let imports = spec.extract("from .sibling import helper\n");
        assert_eq!(imports[0].kind, ImportKind::Relative);
    }

    #[test]
    fn registry_looks_up_by_extension_and_language() {
        let registry = LanguageRegistry::with_defaults();
        assert!(registry.for_extension("rs").is_some());
        assert!(registry.for_language(Language::Go).is_some());
        assert!(registry.for_extension("nope").is_none());
    }
}
