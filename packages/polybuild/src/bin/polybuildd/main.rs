//! `polybuildd`: the optional peer worker daemon. Runs a small local action
//! queue plus an `axum` ingress server peers can steal work from, following
//! the same pid-file/context-file handshake and idle-timeout shutdown as the
//! teacher's cargo daemon (`polybuild::daemon`).

mod queue;
mod router;
mod stealer;

use std::{sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use polybuild::{
    daemon::{DaemonContext, DaemonPaths, IdleState},
    fs,
    path::JoinWith as _,
    peer::{PeerRegistry, StealConfig, StealEngine},
};
use polybuild_wire::peer::WorkerId;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, registry::Registry};

pub use queue::{ActionQueue, ActionRunner};

#[derive(Debug, Parser)]
#[command(name = "polybuildd", version, about = "polybuild peer worker daemon")]
struct Cli {
    /// Identifies this worker in heartbeats and steal requests; defaults to
    /// `worker-<pid>`.
    #[arg(long, env = "POLYBUILD_WORKER_ID")]
    worker_id: Option<String>,

    /// Exit once no action has run and no peer has contacted this worker for
    /// this many seconds.
    #[arg(long, env = "POLYBUILD_IDLE_TIMEOUT_SECS", default_value_t = 900)]
    idle_timeout_secs: u64,

    /// How long a registered peer may go without a heartbeat before it's
    /// dropped from the local peer view.
    #[arg(long, default_value_t = 30)]
    peer_stale_secs: u64,
}

/// State shared across every axum handler.
pub struct AppState {
    pub self_id: WorkerId,
    pub peers: Arc<PeerRegistry>,
    pub steal_engine: Arc<StealEngine>,
    pub queue: Arc<ActionQueue>,
    pub idle: IdleState,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let fmt_layer = fmt::layer().with_filter(EnvFilter::builder().with_env_var("POLYBUILD_LOG").from_env_lossy());
    let subscriber = Registry::default().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    let worker_id = WorkerId::new(
        cli.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id())),
    );

    let paths = DaemonPaths::initialize().await.context("resolve daemon paths")?;
    if let Some(existing) = paths.daemon_running().await.context("check for running daemon")? {
        color_eyre::eyre::bail!("polybuildd already running (pid {})", existing.pid);
    }

    let idle = IdleState::new(Duration::from_secs(cli.idle_timeout_secs));
    let state = Arc::new(AppState {
        self_id: worker_id.clone(),
        peers: Arc::new(PeerRegistry::new(
            worker_id.clone(),
            Duration::from_secs(cli.peer_stale_secs),
        )),
        steal_engine: Arc::new(StealEngine::new(StealConfig::default())),
        queue: Arc::new(ActionQueue::new()),
        idle: idle.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind ingress port")?;
    let local_addr = listener.local_addr().context("read bound ingress port")?;

    let log_file_path = fs::user_global_cache_path()
        .await?
        .join(polybuild::mk_rel_file!("polybuildd.log"));

    let context = DaemonContext {
        pid: std::process::id(),
        url: local_addr.to_string(),
        log_file_path,
    };
    fs::write(
        &paths.context_path,
        serde_json::to_vec(&context).context("serialize daemon context")?,
    )
    .await
    .context("write daemon context file")?;
    fs::write(&paths.pid_file_path, context.pid.to_string())
        .await
        .context("write daemon pid file")?;

    info!(worker_id = %worker_id, addr = %local_addr, "polybuildd listening");

    let runner = ActionRunner::spawn(state.queue.clone(), idle.clone());
    let stealer = stealer::spawn(state.clone());
    let app = router::build(state.clone());

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("ingress server exited unexpectedly")
    });

    tokio::select! {
        _ = idle.monitor() => info!("idle timeout reached, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
    }

    server.abort();
    runner.abort();
    stealer.abort();
    let _ = fs::remove_file(&paths.pid_file_path).await;
    let _ = fs::remove_file(&paths.context_path).await;

    Ok(())
}
