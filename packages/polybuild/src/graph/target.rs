//! [`Target`]: the immutable record describing a single buildable unit.

use std::collections::{BTreeMap, BTreeSet};

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use super::TargetId;

/// The kind of thing a [`Target`] produces.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Executable,
    Library,
    Test,
    Custom,
}

/// A closed set of first-class languages, plus a catch-all for anything a
/// user-supplied `LanguageSpec` describes that isn't one of these.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    C,
    Cpp,
    Go,
    Java,
    Generic,
}

/// Immutable record describing build intent for one target.
///
/// Created at workspace load from the declarative target description;
/// immutable thereafter. A workspace with a duplicate `id` fails to load
/// (checked by [`super::Graph::add_target`]).
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub language: Language,
    #[builder(default)]
    pub sources: Vec<String>,
    #[builder(default)]
    pub declared_deps: BTreeSet<TargetId>,
    #[builder(default)]
    pub flags: Vec<String>,
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    pub output_path: Option<String>,
    #[builder(default)]
    pub handler_config: BTreeMap<String, String>,
}
