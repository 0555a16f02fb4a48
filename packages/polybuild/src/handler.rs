//! Handler contract (Component I): the external interface the executor
//! calls per target. No production language backend lives here — only the
//! trait plus two reference implementations used to exercise the executor
//! without a real toolchain.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use color_eyre::Result;
use derive_more::{Debug, Display};
use polybuild_wire::ArtifactId;

use crate::{cache::ActionCacheEntry, fingerprint::Fingerprint, graph::Target};

/// Shared cancellation flag for one build. Cheaply cloneable; handlers poll
/// [`CancelToken::is_cancelled`] between discrete sub-actions (per source
/// file, per compiler invocation) rather than checking continuously.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Pure, deterministic description of what a target's build requires,
/// computed by [`Handler::plan`] with no side effects.
#[derive(Clone, Debug)]
pub struct Plan {
    pub inputs: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub required_tools: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// How a [`Handler::build`] invocation concluded.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum BuildStatus {
    Success,
    Failed,
    Cached,
    Cancelled,
}

/// Result of one `build` call.
#[derive(Clone, Debug)]
pub struct BuildOutcome {
    pub status: BuildStatus,
    pub outputs: Vec<ArtifactId>,
    pub logs: String,
    /// Newly discovered targets/edges this build produced (dynamic
    /// discovery), if any.
    pub produced_discoveries: Option<crate::graph::Discovery>,
}

/// A Handler is associated with one `(language, kind)` pair and builds that
/// kind of target. Implementations must honor `cancel_token` between
/// discrete sub-actions; the executor never blocks waiting on a handler
/// that ignores it indefinitely (it escalates to a process-group kill after
/// the configured timeout — see `executor`).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn plan(&self, target: &Target, workspace_root: &str) -> Result<Plan>;

    async fn needs_rebuild(
        &self,
        target: &Target,
        last_fingerprint: Option<&Fingerprint>,
        action_cache_entry: Option<&ActionCacheEntry>,
    ) -> Result<bool>;

    async fn build(
        &self,
        target: &Target,
        plan: &Plan,
        cancel_token: &CancelToken,
    ) -> Result<BuildOutcome>;

    async fn clean(&self, target: &Target) -> Result<()>;
}

/// A handler that does nothing and always reports success, with no
/// outputs. Used to exercise the executor's scheduling and fault-policy
/// logic without invoking a real toolchain.
#[derive(Clone, Debug, Default)]
pub struct NullHandler;

#[async_trait]
impl Handler for NullHandler {
    async fn plan(&self, target: &Target, _workspace_root: &str) -> Result<Plan> {
        Ok(Plan {
            inputs: target.sources.clone(),
            expected_outputs: Vec::new(),
            required_tools: Vec::new(),
            env: target.env.clone(),
        })
    }

    async fn needs_rebuild(
        &self,
        _target: &Target,
        last_fingerprint: Option<&Fingerprint>,
        _action_cache_entry: Option<&ActionCacheEntry>,
    ) -> Result<bool> {
        Ok(last_fingerprint.is_none())
    }

    async fn build(
        &self,
        _target: &Target,
        _plan: &Plan,
        _cancel_token: &CancelToken,
    ) -> Result<BuildOutcome> {
        Ok(BuildOutcome {
            status: BuildStatus::Success,
            outputs: Vec::new(),
            logs: String::new(),
            produced_discoveries: None,
        })
    }

    async fn clean(&self, _target: &Target) -> Result<()> {
        Ok(())
    }
}

/// Reference handler that treats `target.handler_config["command"]` as a
/// shell command to run, polling `cancel_token` before spawning and
/// reaping the child. Demonstrates the contract end-to-end; not a
/// production language backend (those remain out of scope).
#[derive(Clone, Debug, Default)]
pub struct ShellHandler;

#[async_trait]
impl Handler for ShellHandler {
    async fn plan(&self, target: &Target, _workspace_root: &str) -> Result<Plan> {
        Ok(Plan {
            inputs: target.sources.clone(),
            expected_outputs: target.output_path.clone().into_iter().collect(),
            required_tools: vec!["sh".to_string()],
            env: target.env.clone(),
        })
    }

    async fn needs_rebuild(
        &self,
        _target: &Target,
        last_fingerprint: Option<&Fingerprint>,
        _action_cache_entry: Option<&ActionCacheEntry>,
    ) -> Result<bool> {
        Ok(last_fingerprint.is_none())
    }

    async fn build(
        &self,
        target: &Target,
        _plan: &Plan,
        cancel_token: &CancelToken,
    ) -> Result<BuildOutcome> {
        let Some(command) = target.handler_config.get("command") else {
            return Ok(BuildOutcome {
                status: BuildStatus::Failed,
                outputs: Vec::new(),
                logs: "ShellHandler requires handler_config[\"command\"]".to_string(),
                produced_discoveries: None,
            });
        };

        if cancel_token.is_cancelled() {
            return Ok(BuildOutcome {
                status: BuildStatus::Cancelled,
                outputs: Vec::new(),
                logs: String::new(),
                produced_discoveries: None,
            });
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        for (key, value) in &target.env {
            cmd.env(key, value);
        }

        let output = cmd.output().await;
        match output {
            Ok(output) => {
                let logs = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let status = if output.status.success() {
                    BuildStatus::Success
                } else {
                    BuildStatus::Failed
                };
                Ok(BuildOutcome {
                    status,
                    outputs: Vec::new(),
                    logs,
                    produced_discoveries: None,
                })
            }
            Err(err) => Ok(BuildOutcome {
                status: BuildStatus::Failed,
                outputs: Vec::new(),
                logs: format!("failed to spawn shell command: {err}"),
                produced_discoveries: None,
            }),
        }
    }

    async fn clean(&self, _target: &Target) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Interner, Language, TargetKind};

    fn sample_target(interner: &Interner) -> Target {
        Target::builder()
            .id(interner.intern("//a"))
            .kind(TargetKind::Custom)
            .language(Language::Generic)
            .output_path(None)
            .build()
    }

    #[tokio::test]
    async fn null_handler_always_succeeds() {
        let interner = Interner::new();
        let target = sample_target(&interner);
        let handler = NullHandler;
        let plan = handler.plan(&target, "/workspace").await.unwrap();
        let outcome = handler
            .build(&target, &plan, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, BuildStatus::Success);
    }

    #[tokio::test]
    async fn shell_handler_runs_command() {
        let interner = Interner::new();
        let mut target = sample_target(&interner);
        target
            .handler_config
            .insert("command".to_string(), "echo hi".to_string());
        let handler = ShellHandler;
        let plan = handler.plan(&target, "/workspace").await.unwrap();
        let outcome = handler
            .build(&target, &plan, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, BuildStatus::Success);
        assert!(outcome.logs.contains("hi"));
    }

    #[tokio::test]
    async fn shell_handler_fails_without_command() {
        let interner = Interner::new();
        let target = sample_target(&interner);
        let handler = ShellHandler;
        let plan = handler.plan(&target, "/workspace").await.unwrap();
        let outcome = handler
            .build(&target, &plan, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, BuildStatus::Failed);
    }

    #[test]
    fn cancel_token_reflects_cancellation() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
