//! Keeps a local [`ObservedEventProjector`] in step with a server's workspace.
//!
//! Bootstrap reads the observed-stream baseline, loads a snapshot, then
//! subscribes after the baseline so nothing published in between is missed.
//! Events already folded into the snapshot replay harmlessly because
//! projection is idempotent.

use serde_json::Value;

use crate::{
    error::StreamError,
    projector::{diff_snapshots, ObservedEventProjector},
    protocol::StreamDelivery,
    stream_client::{StreamClient, StreamTransport},
    types::{Cursor, StreamScope, SubscriptionId},
    workspace::WorkspaceMutation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Projected; `changed` is false when the event was a no-op for the
    /// projector (unknown kind, unknown id, lifecycle events).
    Applied { changed: bool },
    /// At or before the last cursor already seen.
    Stale,
    /// Belongs to a subscription this sync no longer holds.
    Foreign,
    /// Projected, but cursors were skipped; call [`WorkspaceSync::resync`].
    Gap { expected: Cursor, received: Cursor },
}

pub struct WorkspaceSync<T> {
    client: StreamClient<T>,
    scope: StreamScope,
    projector: ObservedEventProjector,
    subscription_id: Option<SubscriptionId>,
    last_cursor: Option<Cursor>,
}

impl<T: StreamTransport> WorkspaceSync<T> {
    pub fn new(client: StreamClient<T>, scope: StreamScope, projector: ObservedEventProjector) -> Self {
        let mut scope = scope;
        scope.conversation_id = None;
        Self {
            client,
            scope,
            projector,
            subscription_id: None,
            last_cursor: None,
        }
    }

    pub fn projector(&self) -> &ObservedEventProjector {
        &self.projector
    }

    pub fn projector_mut(&mut self) -> &mut ObservedEventProjector {
        &mut self.projector
    }

    pub fn client(&self) -> &StreamClient<T> {
        &self.client
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn last_cursor(&self) -> Option<Cursor> {
        self.last_cursor
    }

    /// Load state from scratch and open the live subscription. Returns the
    /// cursor the subscription starts after.
    pub async fn bootstrap(&mut self) -> Result<Cursor, StreamError> {
        self.release().await;
        let baseline = self.client.read_observed_stream_cursor_baseline(&self.scope).await?;
        let (snapshot_cursor, snapshot) = self.client.load_snapshot(&self.scope).await?.into_snapshot();
        self.projector.load_snapshot(snapshot);

        // Without a usable baseline the snapshot's own cursor is the next best
        // starting point.
        let after = baseline.unwrap_or(snapshot_cursor);
        let ack = self.client.subscribe(&self.scope, Some(after)).await?;
        self.subscription_id = Some(ack.subscription_id);
        self.last_cursor = Some(after);
        tracing::info!(
            target = "agent_mux::sync",
            workspace = %self.scope.workspace_id,
            baseline = ?baseline,
            snapshot_cursor,
            repositories = self.projector.repositories().len(),
            tasks = self.projector.tasks().len(),
            "workspace sync bootstrapped"
        );
        Ok(after)
    }

    /// Resume over a new connection from the last cursor seen. Falls back to a
    /// full bootstrap when there is nothing to resume from, when the server
    /// cannot replay that far in one go, or when the server's cursors went
    /// backwards (a restarted server starts its log again from zero).
    pub async fn reconnect(&mut self, client: StreamClient<T>) -> Result<Cursor, StreamError> {
        self.client = client;
        self.subscription_id = None;
        let Some(after) = self.last_cursor else {
            return self.bootstrap().await;
        };
        match self.client.subscribe(&self.scope, Some(after)).await {
            Ok(ack) if ack.cursor.is_some_and(|current| current < after) => {
                tracing::info!(
                    target = "agent_mux::sync",
                    after,
                    current = ?ack.cursor,
                    "server cursor regressed, bootstrapping"
                );
                self.subscription_id = Some(ack.subscription_id);
                self.bootstrap().await
            }
            Ok(ack) => {
                self.subscription_id = Some(ack.subscription_id);
                tracing::debug!(target = "agent_mux::sync", after, "workspace sync resumed");
                Ok(after)
            }
            Err(error) if needs_bootstrap(&error) => {
                tracing::info!(
                    target = "agent_mux::sync",
                    after,
                    error = %error,
                    "cannot resume from last cursor, bootstrapping"
                );
                self.bootstrap().await
            }
            Err(error) => Err(error),
        }
    }

    /// Fold one delivery into the projector.
    pub fn handle_delivery(&mut self, delivery: &StreamDelivery) -> DeliveryOutcome {
        if self.subscription_id.as_deref() != Some(delivery.subscription_id.as_str()) {
            return DeliveryOutcome::Foreign;
        }
        if self.last_cursor.is_some_and(|last| delivery.cursor <= last) {
            return DeliveryOutcome::Stale;
        }

        let expected = self.last_cursor.map_or(delivery.cursor, |last| last + 1);
        let changed = self.projector.apply_event(&delivery.event);
        self.last_cursor = Some(delivery.cursor);
        if delivery.cursor > expected {
            tracing::warn!(
                target = "agent_mux::sync",
                expected,
                received = delivery.cursor,
                "observed stream skipped cursors"
            );
            return DeliveryOutcome::Gap {
                expected,
                received: delivery.cursor,
            };
        }
        DeliveryOutcome::Applied { changed }
    }

    /// Reconcile with a fresh snapshot through the diff path, keeping the
    /// current subscription. The snapshot's cursor becomes the last cursor seen,
    /// even when it is lower. Returns whether anything changed.
    pub async fn resync(&mut self) -> Result<bool, StreamError> {
        let (cursor, fresh) = self.client.load_snapshot(&self.scope).await?.into_snapshot();
        let diff = diff_snapshots(&self.projector.snapshot(), &fresh);
        self.projector.apply_snapshot_diff(&fresh, &diff);
        self.last_cursor = Some(cursor);
        Ok(diff.changed)
    }

    pub async fn push_mutations(&self, mutations: Vec<WorkspaceMutation>) -> Result<Value, StreamError> {
        self.client.mutate(mutations).await
    }

    /// Drop the live subscription, if any.
    pub async fn release(&mut self) {
        if let Some(subscription_id) = self.subscription_id.take() {
            self.client.unsubscribe(&subscription_id).await;
        }
    }
}

/// Errors arrive typed in process and as coded server errors over the wire.
fn needs_bootstrap(error: &StreamError) -> bool {
    match error {
        StreamError::ReplayOverflow { .. } | StreamError::CursorAhead { .. } => true,
        StreamError::Server { code, .. } => code == "replay_overflow" || code == "cursor_ahead",
        _ => false,
    }
}
