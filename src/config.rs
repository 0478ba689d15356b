use std::path::PathBuf;

use clap::Parser;

use crate::{
    multiplexer::{BacklogPolicy, DEFAULT_BACKLOG_MAX_BYTES},
    observed_log::DEFAULT_REPLAY_CAPACITY,
    subscriptions::DEFAULT_SUBSCRIBER_QUEUE,
    types::StreamScope,
};

#[derive(Debug, Parser, Clone)]
#[command(name = "agent-mux")]
#[command(about = "Multiplexes PTY-backed agent sessions and workspace events to stream clients")]
pub struct Config {
    #[arg(long, default_value_t = 3890)]
    pub port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    #[arg(long, default_value = "local")]
    pub tenant_id: String,

    #[arg(long, default_value = "local")]
    pub user_id: String,

    #[arg(long, default_value = "local")]
    pub workspace_id: String,

    /// Observed events retained for subscriber catch-up.
    #[arg(long, default_value_t = DEFAULT_REPLAY_CAPACITY)]
    pub replay_capacity: usize,

    /// Per-session output retained for late attachers.
    #[arg(long, default_value_t = DEFAULT_BACKLOG_MAX_BYTES)]
    pub backlog_max_bytes: usize,

    #[arg(long, default_value_t = DEFAULT_SUBSCRIBER_QUEUE)]
    pub subscriber_queue: usize,

    #[arg(long, default_value_t = 4)]
    pub batch_concurrency: usize,

    /// Render-trace state file (`{"outputPath", "conversationId"?}`).
    #[arg(long)]
    pub trace_state: Option<PathBuf>,

    #[arg(long, default_value_t = 250)]
    pub trace_poll_ms: u64,

    /// Git status poll interval; 0 disables polling.
    #[arg(long, default_value_t = 5000)]
    pub git_poll_ms: u64,

    /// Run sessions behind this PTY host helper instead of an in-process PTY.
    #[arg(long)]
    pub pty_helper: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,

    /// Optional command to start as the first session.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Config {
    pub fn scope(&self) -> StreamScope {
        StreamScope::workspace(&self.tenant_id, &self.user_id, &self.workspace_id)
    }

    pub fn backlog_policy(&self) -> BacklogPolicy {
        BacklogPolicy::bounded_bytes(self.backlog_max_bytes)
    }
}
