use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agent_mux::{
    api::api_router,
    config::Config,
    control_plane::{ControlPlane, ControlPlaneOptions},
    events::{init_logging, LifecycleEvent},
    git_poller::CommandGitSource,
    pty::run_pty_host,
    render_trace::RenderTraceRecorder,
    session_pool::SpawnRequest,
};

#[derive(Debug, Parser)]
#[command(name = "agent-mux")]
#[command(about = "PTY session multiplexer and workspace event server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve sessions and the workspace stream over HTTP/WebSocket.
    Serve(Config),
    /// Internal: hosts one command in a PTY behind the framed stdin/stdout
    /// protocol. Used by `--pty-helper`, not for direct invocation.
    #[command(hide = true)]
    PtyHost {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(cfg) => run_serve(cfg).await,
        Commands::PtyHost { command, args } => {
            let code = run_pty_host(&command, &args).await?;
            std::process::exit(code);
        }
    }
}

async fn run_serve(cfg: Config) -> Result<()> {
    init_logging(&cfg.log_level)?;

    let trace = cfg.trace_state.as_ref().map(|path| {
        let recorder = Arc::new(RenderTraceRecorder::new(path.clone()));
        recorder.refresh();
        recorder.spawn_poller(Duration::from_millis(cfg.trace_poll_ms.max(10)));
        recorder
    });

    let plane = ControlPlane::new(ControlPlaneOptions::from_config(&cfg), trace);

    if cfg.git_poll_ms > 0 {
        plane.spawn_git_poller(CommandGitSource, Duration::from_millis(cfg.git_poll_ms));
    }

    if let Some((command, args)) = cfg.command.split_first() {
        let mut request = SpawnRequest::new(command, args.to_vec());
        request.helper = cfg.pty_helper.clone();
        let mux = plane
            .spawn_session(request)
            .with_context(|| format!("failed to start initial session `{command}`"))?;
        tracing::info!(
            target = "agent_mux::main",
            session = %mux.session_id(),
            pid = ?mux.process_id(),
            "initial session started"
        );
    }

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API on {addr}"))?;
    tracing::info!(target = "agent_mux::main", addr = %addr, "listening");
    plane.emitter().emit(&LifecycleEvent::Listening { addr: &addr });

    let router = api_router(plane.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!(target = "agent_mux::main", "shutting down");
    plane.emitter().emit(&LifecycleEvent::ShuttingDown);
    plane.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::warn!(target = "agent_mux::main", error = %error, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {
                tracing::info!(target = "agent_mux::main", "received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
