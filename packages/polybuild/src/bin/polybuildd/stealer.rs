//! Thief-side loop: periodically, when this worker's own queue is running
//! low, ask [`StealEngine`] to pick a victim among known peers and send it a
//! [`StealRequest`] over HTTP.

use std::{sync::Arc, time::Duration};

use polybuild_wire::peer::{StealRequest, StealResponse};
use tracing::{debug, warn};

use crate::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if !state.steal_engine.should_steal(state.queue.len()) {
                continue;
            }

            let candidates = state.peers.alive_with_work(state.steal_engine.steal_threshold());
            if candidates.is_empty() {
                continue;
            }

            let client = client.clone();
            let result = state
                .steal_engine
                .try_steal(&state.self_id, candidates, |victim, request: StealRequest| {
                    let client = client.clone();
                    async move {
                        let url = format!("http://{}:{}/api/v0/steal", victim.address.host, victim.address.port);
                        let response = client.post(url).json(&request).send().await?;
                        Ok(response.json::<StealResponse>().await?)
                    }
                })
                .await;

            match result {
                Ok(Some(action)) => {
                    debug!(action_id = %action.action_id, "stole action from peer");
                    state.queue.push(action);
                }
                Ok(None) => debug!("steal attempt found no work"),
                Err(err) => warn!(?err, "steal attempt failed"),
            }
        }
    })
}
