pub mod api;
pub mod backend;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod events;
pub mod git_poller;
pub mod limiter;
pub mod multiplexer;
pub mod observed_log;
pub mod projector;
pub mod protocol;
pub mod pty;
pub mod records;
pub mod render_trace;
pub mod session_pool;
pub mod stream_client;
pub mod subscriptions;
pub mod sync;
pub mod terminal_buffer;
pub mod types;
pub mod workspace;
pub mod ws_client;
