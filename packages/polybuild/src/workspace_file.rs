//! Workspace and target declaration files (Section 6 external interfaces).
//!
//! A workspace is described by one [`WORKSPACE_FILE_NAME`] TOML file at its
//! root, plus any number of [`TARGET_FILE_NAME`] files scattered through the
//! tree, each declaring one or more [`Target`]s. `load_graph` walks the tree
//! once, interning every declared name up front so that `deps` entries can
//! reference targets declared in any file, in any order.

use std::{collections::HashSet, path::Path};

use camino::Utf8Path;
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use globset::{Glob, GlobSetBuilder};
use serde::Deserialize;

use crate::{
    fs,
    graph::{Graph, Interner, Language, Target, TargetKind},
    ignore::IgnoreSet,
    path::{AbsDirPath, AbsFilePath},
};

pub const WORKSPACE_FILE_NAME: &str = "polybuild.toml";
pub const TARGET_FILE_NAME: &str = "BUILD.toml";

/// Workspace-wide cache settings (Section 6); all fields have defaults so an
/// empty `[cache]` table, or an absent one, is valid.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "CacheSettings::default_max_size")]
    pub max_size: u64,
    #[serde(default = "CacheSettings::default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "CacheSettings::default_max_age_days")]
    pub max_age_days: u32,
}

impl CacheSettings {
    const fn default_max_size() -> u64 {
        1024 * 1024 * 1024
    }

    const fn default_max_entries() -> usize {
        10_000
    }

    const fn default_max_age_days() -> u32 {
        30
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: Self::default_max_size(),
            max_entries: Self::default_max_entries(),
            max_age_days: Self::default_max_age_days(),
        }
    }
}

/// Parsed `polybuild.toml`.
#[derive(Clone, Debug, Deserialize)]
pub struct WorkspaceFile {
    #[serde(default)]
    pub cache: CacheSettings,
    /// Worker count override; `None` means "use the host's CPU count".
    pub parallelism: Option<usize>,
    /// Ignore-file lines merged on top of the built-in critical globs.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Directories to search for user-supplied `LanguageSpec` TOML files,
    /// relative to the workspace root.
    #[serde(default)]
    pub language_spec_dirs: Vec<String>,
}

pub async fn load_workspace_file(path: &AbsFilePath) -> Result<WorkspaceFile> {
    let text = fs::read_buffered_utf8(path)
        .await?
        .ok_or_else(|| eyre!("workspace file not found: {path:?}"))?;
    toml::from_str(&text).with_context(|| format!("parse workspace file {path:?}"))
}

impl WorkspaceFile {
    /// Build the [`IgnoreSet`] this workspace's ignore lines describe, on
    /// top of the built-in critical patterns.
    pub fn ignore_set(&self) -> Result<IgnoreSet> {
        let mut set = IgnoreSet::with_builtins()?;
        set.extend(&self.ignore.join("\n"))?;
        Ok(set)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct TargetDecl {
    name: String,
    kind: TargetKind,
    language: Language,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    env: std::collections::BTreeMap<String, String>,
    output_path: Option<String>,
    #[serde(default)]
    handler_config: std::collections::BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct TargetFile {
    #[serde(default)]
    target: Vec<TargetDecl>,
}

/// Expand a target's `sources` globs (relative to its declaring file's
/// directory) into workspace-relative file paths, skipping anything the
/// ignore set would prune.
fn expand_sources(decl_dir: &Path, patterns: &[String], ignore: &IgnoreSet) -> Result<Vec<String>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let negate = pattern.starts_with('!');
        let glob_text = if negate { &pattern[1..] } else { pattern.as_str() };
        builder.add(Glob::new(glob_text).with_context(|| format!("compile source glob {pattern:?}"))?);
    }
    let set = builder.build().context("build source globset")?;

    let mut matched = Vec::new();
    for entry in walkdir::WalkDir::new(decl_dir)
        .into_iter()
        .filter_entry(|e| {
            Utf8Path::from_path(e.path())
                .map(|p| !ignore.prunes_directory(p))
                .unwrap_or(true)
        })
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(decl_dir).unwrap_or(entry.path());
        if set.is_match(relative) {
            if let Some(utf8) = Utf8Path::from_path(entry.path()) {
                if !ignore.is_ignored(utf8) {
                    matched.push(utf8.to_string());
                }
            }
        }
    }
    matched.sort();
    Ok(matched)
}

async fn load_target_file(
    path: &AbsFilePath,
    ignore: &IgnoreSet,
    interner: &Interner,
) -> Result<Vec<(String, Target, Vec<String>)>> {
    let text = fs::read_buffered_utf8(path)
        .await?
        .ok_or_else(|| eyre!("target file not found: {path:?}"))?;
    let file: TargetFile = toml::from_str(&text).with_context(|| format!("parse target file {path:?}"))?;

    let decl_dir = path
        .as_std_path()
        .parent()
        .ok_or_else(|| eyre!("target file {path:?} has no parent directory"))?
        .to_path_buf();

    let mut out = Vec::with_capacity(file.target.len());
    for decl in file.target {
        let sources = if decl.sources.is_empty() {
            Vec::new()
        } else {
            expand_sources(&decl_dir, &decl.sources, ignore)?
        };

        let target = Target::builder()
            .id(interner.intern(&decl.name))
            .kind(decl.kind)
            .language(decl.language)
            .sources(sources)
            .flags(decl.flags)
            .env(decl.env)
            .maybe_output_path(decl.output_path)
            .handler_config(decl.handler_config)
            .build();

        out.push((decl.name, target, decl.deps));
    }
    Ok(out)
}

/// Walk `root` for every [`TARGET_FILE_NAME`] file, intern every declared
/// target name, and build a [`Graph`] with edges from each target's `deps`.
/// Fails if two files declare the same target name.
pub async fn load_graph(root: &AbsDirPath, interner: &Interner, ignore: &IgnoreSet) -> Result<Graph> {
    let mut graph = Graph::new();
    let mut seen_names = HashSet::new();
    let mut pending_edges = Vec::new();

    let entries: Vec<_> = walkdir::WalkDir::new(root.as_std_path())
        .into_iter()
        .filter_entry(|e| {
            Utf8Path::from_path(e.path())
                .map(|p| !ignore.prunes_directory(p))
                .unwrap_or(true)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() == TARGET_FILE_NAME)
        .collect();

    for entry in entries {
        let abs = AbsFilePath::try_from(entry.path().to_path_buf())
            .with_context(|| format!("{:?} is not an absolute file path", entry.path()))?;
        let decls = load_target_file(&abs, ignore, interner).await?;
        for (name, target, dep_names) in decls {
            if !seen_names.insert(name.clone()) {
                bail!("duplicate target name {name:?} (declared again in {abs:?})");
            }
            let id = target.id;
            graph.add_target(target)?;
            pending_edges.push((id, dep_names));
        }
    }

    for (id, dep_names) in pending_edges {
        for dep_name in dep_names {
            let dep_id = interner.intern(&dep_name);
            graph.add_edge(id, dep_id)?;
        }
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_file_defaults_are_populated() {
        let file: WorkspaceFile = toml::from_str("").unwrap();
        assert_eq!(file.cache.max_entries, CacheSettings::default_max_entries());
        assert!(file.parallelism.is_none());
        assert!(file.ignore.is_empty());
    }

    #[test]
    fn workspace_file_parses_full_table() {
        let text = r#"
            parallelism = 4
            ignore = ["low:*.tmp"]
            language_spec_dirs = ["langs"]

            [cache]
            max_size = 2048
            max_entries = 10
            max_age_days = 7
        "#;
        let file: WorkspaceFile = toml::from_str(text).unwrap();
        assert_eq!(file.parallelism, Some(4));
        assert_eq!(file.cache.max_size, 2048);
        assert_eq!(file.language_spec_dirs, vec!["langs".to_string()]);
    }

    #[test]
    fn target_decl_requires_kind_and_language() {
        let text = r#"
            [[target]]
            name = "a"
            kind = "library"
            language = "rust"
        "#;
        let file: TargetFile = toml::from_str(text).unwrap();
        assert_eq!(file.target.len(), 1);
        assert_eq!(file.target[0].name, "a");
    }
}
