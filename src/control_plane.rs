//! Wires sessions, subscriptions and the workspace store into one server.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use serde_json::{json, Value};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    config::Config,
    error::StreamError,
    events::{EventEmitter, LifecycleEvent},
    git_poller::{GitStatePoller, GitStateSource},
    multiplexer::{BacklogPolicy, SessionMultiplexer},
    observed_log::DEFAULT_REPLAY_CAPACITY,
    protocol::{session_exit_event, session_started_event, StreamCommand, StreamDelivery},
    render_trace::RenderTraceRecorder,
    session_pool::{PoolEvent, SessionPool, SpawnRequest},
    subscriptions::{DeliveryQueue, OwnerId, SubscriptionManager, DEFAULT_SUBSCRIBER_QUEUE},
    types::{StreamScope, WorkspaceKey},
    workspace::WorkspaceStore,
};

#[derive(Debug, Clone)]
pub struct ControlPlaneOptions {
    pub scope: StreamScope,
    pub replay_capacity: usize,
    pub backlog: BacklogPolicy,
    pub subscriber_queue: usize,
    pub batch_concurrency: usize,
    pub json_output: bool,
}

impl ControlPlaneOptions {
    pub fn new(scope: StreamScope) -> Self {
        Self {
            scope,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            backlog: BacklogPolicy::default(),
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            batch_concurrency: 4,
            json_output: false,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            scope: cfg.scope(),
            replay_capacity: cfg.replay_capacity,
            backlog: cfg.backlog_policy(),
            subscriber_queue: cfg.subscriber_queue.max(1),
            batch_concurrency: cfg.batch_concurrency,
            json_output: cfg.json_output,
        }
    }
}

pub struct ControlPlane {
    scope: StreamScope,
    sessions: SessionPool,
    subscriptions: Arc<SubscriptionManager>,
    workspace: Arc<WorkspaceStore>,
    emitter: EventEmitter,
    trace: Option<Arc<RenderTraceRecorder>>,
    subscriber_queue: usize,
    batch_concurrency: usize,
}

impl ControlPlane {
    /// Build the control plane and start forwarding session lifecycle into the
    /// workspace event stream. Must be called from within a tokio runtime.
    pub fn new(options: ControlPlaneOptions, trace: Option<Arc<RenderTraceRecorder>>) -> Arc<Self> {
        let sessions = SessionPool::new(options.backlog);
        let subscriptions = Arc::new(SubscriptionManager::new(
            options.replay_capacity,
            sessions.clone(),
        ));
        let key = options.scope.workspace_key();
        let workspace = Arc::new(WorkspaceStore::new(key.clone(), subscriptions.clone()));
        let emitter = EventEmitter::new(options.json_output);

        spawn_lifecycle_forwarder(
            sessions.subscribe_events(),
            subscriptions.clone(),
            key,
            emitter.clone(),
        );

        Arc::new(Self {
            scope: options.scope,
            sessions,
            subscriptions,
            workspace,
            emitter,
            trace,
            subscriber_queue: options.subscriber_queue,
            batch_concurrency: options.batch_concurrency,
        })
    }

    pub fn scope(&self) -> &StreamScope {
        &self.scope
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn workspace(&self) -> &Arc<WorkspaceStore> {
        &self.workspace
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn batch_concurrency(&self) -> usize {
        self.batch_concurrency
    }

    /// Delivery queue for one connection's subscriptions.
    pub fn delivery_channel(&self) -> (DeliveryQueue, mpsc::Receiver<StreamDelivery>) {
        DeliveryQueue::bounded(self.subscriber_queue)
    }

    pub fn spawn_session(&self, request: SpawnRequest) -> Result<Arc<SessionMultiplexer>> {
        let mux = self.sessions.spawn(request)?;
        self.attach_trace(&mux);
        Ok(mux)
    }

    /// Register a caller-driven session, e.g. one fed by another process.
    pub fn adopt_session(&self, mux: Arc<SessionMultiplexer>, command: &str) -> Result<()> {
        self.sessions.adopt(mux.clone(), command)?;
        self.attach_trace(&mux);
        Ok(())
    }

    fn attach_trace(&self, mux: &Arc<SessionMultiplexer>) {
        if let Some(trace) = &self.trace {
            let since = mux.latest_cursor();
            mux.attach(Box::new(trace.sink(mux.session_id())), since);
        }
    }

    fn check_scope(&self, tenant_id: &str, workspace_id: &str) -> Result<(), StreamError> {
        if tenant_id == self.scope.tenant_id && workspace_id == self.scope.workspace_id {
            return Ok(());
        }
        Err(StreamError::UnknownWorkspace(format!("{tenant_id}/{workspace_id}")))
    }

    /// Execute one stream command on behalf of a connection.
    pub async fn handle_command(
        &self,
        command: StreamCommand,
        queue: &DeliveryQueue,
        owner: Option<&str>,
    ) -> Result<Value, StreamError> {
        match command {
            StreamCommand::Subscribe {
                tenant_id,
                user_id,
                workspace_id,
                conversation_id,
                after_cursor,
            } => {
                self.check_scope(&tenant_id, &workspace_id)?;
                let scope = StreamScope {
                    tenant_id,
                    user_id,
                    workspace_id,
                    conversation_id,
                };
                let ack = self.subscriptions.subscribe(
                    &scope,
                    after_cursor,
                    queue,
                    owner.map(OwnerId::from),
                )?;
                Ok(serde_json::to_value(ack)?)
            }
            StreamCommand::Unsubscribe { subscription_id } => {
                let removed = self.subscriptions.unsubscribe(&subscription_id);
                Ok(json!({ "removed": removed }))
            }
            StreamCommand::Snapshot {
                tenant_id,
                workspace_id,
                ..
            } => {
                self.check_scope(&tenant_id, &workspace_id)?;
                Ok(serde_json::to_value(self.workspace.snapshot())?)
            }
            StreamCommand::Mutate { mutations } => {
                let batch = mutations.into_iter().map(Some).collect();
                let report = self
                    .workspace
                    .apply_mutations(batch, self.batch_concurrency)
                    .await;
                let cursor = self.subscriptions.current_cursor(self.workspace.key());
                Ok(json!({
                    "completed": report.completed,
                    "failed": report.failed,
                    "skipped": report.skipped,
                    "cursor": cursor,
                }))
            }
        }
    }

    /// Poll git state for workspace repositories and publish changes as
    /// `repository-git-status` events.
    pub fn spawn_git_poller<S: GitStateSource>(
        self: &Arc<Self>,
        source: S,
        interval: Duration,
    ) -> JoinHandle<()> {
        let plane = self.clone();
        let poller = GitStatePoller::new(source, self.batch_concurrency);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let repositories = plane.workspace.repositories();
                for (repository_id, summary) in poller.poll_once(&repositories).await {
                    plane.subscriptions.publish(
                        plane.workspace.key(),
                        json!({
                            "type": "repository-git-status",
                            "repositoryId": repository_id,
                            "git": summary,
                        }),
                    );
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.sessions.shutdown_all();
    }
}

fn spawn_lifecycle_forwarder(
    mut events: broadcast::Receiver<PoolEvent>,
    subscriptions: Arc<SubscriptionManager>,
    key: WorkspaceKey,
    emitter: EventEmitter,
) {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "agent_mux::control",
                        skipped,
                        "session lifecycle listener lagged"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match &event {
                PoolEvent::Started {
                    session_id,
                    command,
                    pid,
                } => {
                    subscriptions.publish(&key, session_started_event(session_id, command, *pid));
                }
                PoolEvent::Exited { session_id, exit } => {
                    subscriptions.publish(&key, session_exit_event(session_id, exit));
                }
                PoolEvent::Removed { .. } => {}
            }
            emitter.emit(&LifecycleEvent::from(&event));
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::time::{timeout, Duration};

    use super::{ControlPlane, ControlPlaneOptions};
    use crate::{
        error::StreamError,
        multiplexer::{BacklogPolicy, SessionMultiplexer},
        protocol::StreamCommand,
        terminal_buffer::PlainTextBuffer,
        types::{SessionExit, StreamScope},
        workspace::WorkspaceMutation,
    };

    fn plane() -> Arc<ControlPlane> {
        ControlPlane::new(ControlPlaneOptions::new(StreamScope::workspace("t1", "u1", "w1")), None)
    }

    #[tokio::test]
    async fn subscribe_outside_hosted_workspace_is_rejected() {
        let plane = plane();
        let (tx, _rx) = plane.delivery_channel();
        let scope = StreamScope::workspace("t1", "u1", "elsewhere");
        let err = plane
            .handle_command(StreamCommand::subscribe(&scope, None), &tx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::UnknownWorkspace(_)));
    }

    #[tokio::test]
    async fn mutate_then_snapshot_reports_cursor() {
        let plane = plane();
        let (tx, _rx) = plane.delivery_channel();
        let mutations: Vec<WorkspaceMutation> = serde_json::from_value(json!([
            {"op": "upsert-repository", "repository": {"repositoryId": "r1", "name": "core"}},
            {"op": "delete-task", "taskId": "missing"},
        ]))
        .unwrap();
        let result = plane
            .handle_command(StreamCommand::Mutate { mutations }, &tx, None)
            .await
            .unwrap();
        assert_eq!(result["completed"], 1);
        assert_eq!(result["failed"], 1);
        assert_eq!(result["cursor"], 1);

        let snapshot = plane
            .handle_command(StreamCommand::snapshot(plane.scope()), &tx, None)
            .await
            .unwrap();
        assert_eq!(snapshot["cursor"], 1);
        assert_eq!(snapshot["repositories"][0]["repositoryId"], "r1");
    }

    #[tokio::test]
    async fn session_lifecycle_reaches_workspace_subscribers() {
        let plane = plane();
        let (tx, mut rx) = plane.delivery_channel();
        plane
            .handle_command(StreamCommand::subscribe(plane.scope(), None), &tx, Some("conn"))
            .await
            .unwrap();

        let mux = Arc::new(SessionMultiplexer::new(
            "s1",
            None,
            BacklogPolicy::UNBOUNDED,
            Box::new(PlainTextBuffer::new(80, 24)),
        ));
        plane.adopt_session(mux.clone(), "agent").unwrap();
        let started = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(started.event["type"], "session-started");
        assert_eq!(started.event["sessionId"], "s1");

        mux.emit_exit(SessionExit { code: Some(0), signal: None });
        let exited = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(exited.event["type"], "session-exit");
        assert_eq!(exited.cursor, started.cursor + 1);
    }
}
