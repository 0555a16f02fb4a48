//! Import extraction and cross-target dependency resolution (Component D).

mod language;

use std::collections::HashMap;

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use rayon::prelude::*;

pub use language::{Import, ImportKind, LanguageRegistry, LanguageSpec};

use crate::{
    graph::{Language, Target, TargetId},
    ignore::IgnoreSet,
};

/// Bound on how much of a file is read looking for import lines, unless
/// the owning [`LanguageSpec`] marks `imports_anywhere`.
const IMPORT_SCAN_BOUND: usize = 64 * 1024;

/// An import the resolver could not map to a known target.
#[derive(Clone, Debug)]
pub struct UnresolvedImport {
    pub from: TargetId,
    pub source_path: String,
    pub raw: String,
}

/// Outcome of resolving one [`Import`] from a target.
#[derive(Clone, Debug)]
pub enum ResolveOutcome {
    /// Emit an edge `from -> owner`.
    Edge(TargetId),
    /// Stdlib or otherwise intentionally unresolved (third-party).
    Skipped,
    /// Not stdlib, not third-party, and no owner found.
    Unresolved,
}

/// The two indices built by a workspace scan, plus enough bookkeeping to
/// run the resolution rule in `4.D`.
pub struct Resolver {
    source_to_target: HashMap<String, TargetId>,
    import_name_to_target: HashMap<String, Vec<TargetId>>,
    /// One representative source path per target, for the longest-common-
    /// prefix tie-break.
    target_anchor: HashMap<TargetId, String>,
}

impl Resolver {
    /// Parallel workspace scan: each target's sources are read and scanned
    /// concurrently via `rayon`'s work-stealing pool. Files under a
    /// critically-ignored path are skipped entirely.
    #[tracing::instrument(skip(targets, registry, ignore))]
    pub fn scan(
        targets: &[Target],
        registry: &LanguageRegistry,
        ignore: &IgnoreSet,
    ) -> Result<(Self, Vec<(TargetId, String, Vec<Import>)>)> {
        let scanned: Vec<Result<Vec<(TargetId, String, Vec<Import>)>>> = targets
            .par_iter()
            .map(|target| scan_target(target, registry, ignore))
            .collect();

        let mut source_to_target = HashMap::new();
        let mut target_anchor = HashMap::new();
        let mut import_name_to_target: HashMap<String, Vec<TargetId>> = HashMap::new();
        let mut files = Vec::new();

        for result in scanned {
            for (target_id, path, imports) in result? {
                source_to_target.insert(path.clone(), target_id);
                target_anchor.entry(target_id).or_insert_with(|| path.clone());

                let canonical = canonical_import_name(&path);
                import_name_to_target
                    .entry(canonical)
                    .or_default()
                    .push(target_id);

                files.push((target_id, path, imports));
            }
        }

        Ok((
            Self {
                source_to_target,
                import_name_to_target,
                target_anchor,
            },
            files,
        ))
    }

    pub fn source_owner(&self, path: &str) -> Option<TargetId> {
        self.source_to_target.get(path).copied()
    }

    /// Resolution rule (§4.D):
    /// 1. Skip stdlib.
    /// 2. Unique match in `import_name_to_target` ⇒ edge.
    /// 3. Ambiguous ⇒ longest-common-prefix tie-break against `from`'s
    ///    source tree.
    /// 4. Unresolved, non-third-party ⇒ diagnostic.
    pub fn resolve(&self, from: TargetId, source_path: &str, import: &Import) -> ResolveOutcome {
        if import.kind == ImportKind::Stdlib {
            return ResolveOutcome::Skipped;
        }

        if let Some(owners) = self.import_name_to_target.get(&import.raw) {
            return match owners.as_slice() {
                [] => ResolveOutcome::Unresolved,
                [only] => ResolveOutcome::Edge(*only),
                many => {
                    let anchor = self.target_anchor.get(&from).map(String::as_str).unwrap_or(source_path);
                    let best = many
                        .iter()
                        .max_by_key(|candidate| {
                            let candidate_anchor = self
                                .target_anchor
                                .get(candidate)
                                .map(String::as_str)
                                .unwrap_or_default();
                            common_prefix_len(anchor, candidate_anchor)
                        })
                        .copied()
                        .expect("non-empty owners slice");
                    ResolveOutcome::Edge(best)
                }
            };
        }

        if import.kind == ImportKind::ThirdParty {
            ResolveOutcome::Skipped
        } else {
            ResolveOutcome::Unresolved
        }
    }
}

fn scan_target(
    target: &Target,
    registry: &LanguageRegistry,
    ignore: &IgnoreSet,
) -> Result<Vec<(TargetId, String, Vec<Import>)>> {
    target
        .sources
        .par_iter()
        .filter_map(|source| {
            let utf8 = Utf8Path::new(source);
            if ignore.is_ignored(utf8) {
                return None;
            }
            Some(scan_source(target, source, registry).map(|imports| {
                (target.id, source.clone(), imports)
            }))
        })
        .collect()
}

fn scan_source(target: &Target, source: &str, registry: &LanguageRegistry) -> Result<Vec<Import>> {
    let spec = extension_of(source)
        .and_then(|ext| registry.for_extension(ext))
        .or_else(|| registry.for_language(target.language));

    let Some(spec) = spec else {
        return Ok(Vec::new());
    };

    let contents =
        std::fs::read_to_string(source).with_context(|| format!("read source file {source}"))?;
    let bounded = if spec.imports_anywhere {
        contents.as_str()
    } else {
        let cut = contents.char_indices().nth(IMPORT_SCAN_BOUND).map(|(i, _)| i);
        cut.map(|i| &contents[..i]).unwrap_or(contents.as_str())
    };

    Ok(spec.extract(bounded))
}

fn extension_of(path: &str) -> Option<&str> {
    Utf8Path::new(path).extension()
}

/// Canonical import name for a source path: strip the extension and turn
/// path separators into `::` (Rust-style), which also happens to match how
/// most non-Rust `LanguageSpec`s express a dotted module path closely
/// enough for unique-match resolution; ambiguity falls back to the
/// prefix tie-break regardless of language.
fn canonical_import_name(path: &str) -> String {
    let utf8 = Utf8Path::new(path);
    let without_ext = utf8.with_extension("");
    without_ext
        .as_str()
        .replace(['/', '\\'], "::")
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Interner, TargetKind};

    fn target(interner: &Interner, name: &str, sources: Vec<String>) -> Target {
        Target::builder()
            .id(interner.intern(name))
            .kind(TargetKind::Library)
            .language(Language::Rust)
            .sources(sources)
            .output_path(None)
            .build()
    }

    #[test]
    fn scans_and_indexes_rust_sources() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("lib.rs");
        std::fs::write(&file_path, "use std::fmt;\nuse crate::other;\n").unwrap();

        let interner = Interner::new();
        let t = target(
            &interner,
            "//pkg:lib",
            vec![file_path.to_str().unwrap().to_string()],
        );
        let registry = LanguageRegistry::with_defaults();
        let ignore = IgnoreSet::with_builtins().unwrap();

        let (resolver, files) = Resolver::scan(&[t], &registry, &ignore).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].2.len(), 2);
        assert_eq!(
            resolver.source_owner(file_path.to_str().unwrap()),
            Some(interner.intern("//pkg:lib"))
        );
    }

    #[test]
    fn stdlib_import_resolves_as_skipped() {
        let interner = Interner::new();
        let t = target(&interner, "//pkg:lib", vec![]);
        let registry = LanguageRegistry::with_defaults();
        let ignore = IgnoreSet::with_builtins().unwrap();
        let (resolver, _) = Resolver::scan(&[t], &registry, &ignore).unwrap();

        let outcome = resolver.resolve(
            interner.intern("//pkg:lib"),
            "pkg/lib.rs",
            &Import {
                raw: "std::fmt".to_string(),
                kind: ImportKind::Stdlib,
            },
        );
        assert!(matches!(outcome, ResolveOutcome::Skipped));
    }
}
