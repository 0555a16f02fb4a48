//! The local action queue a worker draws its own work from, and that peers
//! steal from via `handle_steal_request`. Both paths pop through the same
//! front-of-queue slot, so whichever side reaches it first — this worker's
//! own runner loop or an incoming steal request — gets to run the action.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use polybuild::daemon::IdleState;
use polybuild_wire::peer::{ActionRequest, ActionResult, ActionStatus};
use tokio::process::Command;
use tracing::{info, warn};

pub struct ActionQueue {
    inner: Mutex<VecDeque<ActionRequest>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, action: ActionRequest) {
        self.inner.lock().expect("action queue mutex poisoned").push_back(action);
    }

    pub fn pop(&self) -> Option<ActionRequest> {
        self.inner.lock().expect("action queue mutex poisoned").pop_front()
    }

    pub fn len(&self) -> u32 {
        self.inner.lock().expect("action queue mutex poisoned").len() as u32
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains `queue` forever, running each action as a child process.
pub struct ActionRunner;

impl ActionRunner {
    pub fn spawn(queue: Arc<ActionQueue>, idle: IdleState) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match queue.pop() {
                    Some(action) => {
                        idle.touch();
                        match run_action(&action).await {
                            Ok(result) => info!(
                                action_id = %result.action_id,
                                status = ?result.status,
                                "action finished"
                            ),
                            Err(err) => warn!(?err, action_id = %action.action_id, "action failed to start"),
                        }
                    }
                    None => tokio::time::sleep(Duration::from_millis(200)).await,
                }
            }
        })
    }
}

async fn run_action(action: &ActionRequest) -> color_eyre::Result<ActionResult> {
    let Some(program) = action.command.first() else {
        return Ok(ActionResult::builder()
            .action_id(action.action_id.clone())
            .status(ActionStatus::Error)
            .stderr("action has an empty command".to_string())
            .build());
    };

    let mut cmd = Command::new(program);
    cmd.args(&action.command[1..]);
    cmd.envs(&action.env);

    Ok(match tokio::time::timeout(action.timeout, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => ActionResult::builder()
            .action_id(action.action_id.clone())
            .status(ActionStatus::Success)
            .build(),
        Ok(Ok(output)) => ActionResult::builder()
            .action_id(action.action_id.clone())
            .status(ActionStatus::Failure)
            .stderr(String::from_utf8_lossy(&output.stderr).into_owned())
            .build(),
        Ok(Err(err)) => ActionResult::builder()
            .action_id(action.action_id.clone())
            .status(ActionStatus::Error)
            .stderr(err.to_string())
            .build(),
        Err(_) => ActionResult::builder()
            .action_id(action.action_id.clone())
            .status(ActionStatus::Timeout)
            .build(),
    })
}
