//! End-to-end tests for the cursor protocol: baseline reads, replay-then-live
//! ordering, conversation streams, and client-side workspace sync, both in
//! process and over a real WebSocket.

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::timeout};

use agent_mux::{
    api::api_router_with_auth,
    control_plane::{ControlPlane, ControlPlaneOptions},
    error::StreamError,
    multiplexer::{BacklogPolicy, SessionMultiplexer},
    projector::ObservedEventProjector,
    protocol::{decode_session_chunk, StreamDelivery},
    records::{RepositoryRecord, TaskRecord},
    stream_client::{InProcessTransport, StreamClient},
    sync::{DeliveryOutcome, WorkspaceSync},
    terminal_buffer::PlainTextBuffer,
    types::{SessionExit, StreamScope},
    workspace::WorkspaceMutation,
    ws_client::WsTransport,
};

fn scope() -> StreamScope {
    StreamScope::workspace("t1", "u1", "w1")
}

fn plane() -> Arc<ControlPlane> {
    ControlPlane::new(ControlPlaneOptions::new(scope()), None)
}

fn upsert_repo(id: &str) -> WorkspaceMutation {
    WorkspaceMutation::UpsertRepository {
        repository: RepositoryRecord::new(id, id),
    }
}

fn create_task(id: &str, repo: &str) -> WorkspaceMutation {
    WorkspaceMutation::CreateTask {
        task: TaskRecord::new(id, format!("task {id}")).in_repository(repo),
    }
}

async fn next(rx: &mut mpsc::Receiver<StreamDelivery>) -> StreamDelivery {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery should arrive in time")
        .expect("delivery channel should stay open")
}

#[tokio::test]
async fn baseline_reads_cursor_without_leaving_a_subscription() {
    let plane = plane();
    for id in ["r1", "r2", "r3"] {
        plane.workspace().apply(upsert_repo(id)).unwrap();
    }

    let (transport, _deliveries) = InProcessTransport::connect(plane.clone());
    let client = StreamClient::new(transport);
    let baseline = client.read_observed_stream_cursor_baseline(&scope()).await.unwrap();
    assert_eq!(baseline, Some(3));
    assert_eq!(plane.subscriptions().subscription_count(), 0);
}

#[tokio::test]
async fn replay_then_live_arrives_in_cursor_order() {
    let plane = plane();
    for id in ["r1", "r2", "r3"] {
        plane.workspace().apply(upsert_repo(id)).unwrap();
    }

    let (transport, mut deliveries) = InProcessTransport::connect(plane.clone());
    let client = StreamClient::new(transport);
    let ack = client.subscribe(&scope(), Some(1)).await.unwrap();
    assert_eq!(ack.cursor, Some(3));

    plane.workspace().apply(create_task("t1", "r1")).unwrap();

    let cursors: Vec<u64> = vec![
        next(&mut deliveries).await.cursor,
        next(&mut deliveries).await.cursor,
        next(&mut deliveries).await.cursor,
    ];
    assert_eq!(cursors, vec![2, 3, 4]);

    drop(client);
    assert_eq!(plane.subscriptions().subscription_count(), 0);
}

#[tokio::test]
async fn conversation_scope_streams_session_output_and_exit() {
    let plane = plane();
    let mux = Arc::new(SessionMultiplexer::new(
        "conv-1",
        None,
        BacklogPolicy::UNBOUNDED,
        Box::new(PlainTextBuffer::new(80, 24)),
    ));
    plane.adopt_session(mux.clone(), "agent").unwrap();
    mux.write(b"one");

    let (transport, mut deliveries) = InProcessTransport::connect(plane.clone());
    let client = StreamClient::new(transport);

    let missing = client
        .subscribe(&scope().with_conversation("nope"), None)
        .await
        .unwrap_err();
    assert!(matches!(missing, StreamError::UnknownConversation(_)));

    let ack = client
        .subscribe(&scope().with_conversation("conv-1"), Some(0))
        .await
        .unwrap();
    assert_eq!(ack.cursor, Some(0));

    mux.write(b"two");
    mux.emit_exit(SessionExit {
        code: Some(0),
        signal: None,
    });

    let first = next(&mut deliveries).await;
    assert_eq!(first.cursor, 1);
    assert_eq!(decode_session_chunk(&first.event).unwrap(), b"one");
    let second = next(&mut deliveries).await;
    assert_eq!(second.cursor, 2);
    assert_eq!(decode_session_chunk(&second.event).unwrap(), b"two");
    let exit = next(&mut deliveries).await;
    assert_eq!(exit.event["type"], "session-exit");
    assert_eq!(exit.event["code"], 0);
}

#[tokio::test]
async fn workspace_sync_converges_with_the_store() {
    let plane = plane();
    plane.workspace().apply(upsert_repo("r1")).unwrap();
    plane.workspace().apply(create_task("t1", "r1")).unwrap();

    let (transport, mut deliveries) = InProcessTransport::connect(plane.clone());
    let mut sync = WorkspaceSync::new(
        StreamClient::new(transport),
        scope(),
        ObservedEventProjector::default(),
    );
    let after = sync.bootstrap().await.unwrap();
    assert_eq!(after, 2);
    assert_eq!(sync.projector().tasks().len(), 1);

    plane.workspace().apply(create_task("t2", "r1")).unwrap();
    plane
        .workspace()
        .apply(WorkspaceMutation::ReorderTasks {
            task_ids: vec!["t2".into(), "t1".into()],
        })
        .unwrap();
    plane
        .workspace()
        .apply(WorkspaceMutation::ArchiveRepository {
            repository_id: "r1".into(),
            ts: Some("2026-03-01T00:00:00Z".into()),
        })
        .unwrap();

    for expected in 3..=5 {
        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.cursor, expected);
        assert!(matches!(
            sync.handle_delivery(&delivery),
            DeliveryOutcome::Applied { changed: true }
        ));
        // A duplicate is ignored.
        assert_eq!(sync.handle_delivery(&delivery), DeliveryOutcome::Stale);
    }

    let (_, server_state) = plane.workspace().snapshot().into_snapshot();
    assert_eq!(sync.projector().snapshot(), server_state);
    let order: Vec<&str> = sync
        .projector()
        .visible_tasks()
        .iter()
        .map(|task| task.task_id.as_str())
        .collect();
    assert_eq!(order, vec!["t2", "t1"]);
}

#[tokio::test]
async fn workspace_sync_resumes_after_reconnect() {
    let plane = plane();
    plane.workspace().apply(upsert_repo("r1")).unwrap();

    let (transport, deliveries) = InProcessTransport::connect(plane.clone());
    let mut sync = WorkspaceSync::new(
        StreamClient::new(transport),
        scope(),
        ObservedEventProjector::default(),
    );
    sync.bootstrap().await.unwrap();
    drop(deliveries);

    // Published while the client is away.
    plane.workspace().apply(create_task("t1", "r1")).unwrap();
    plane.workspace().apply(create_task("t2", "r1")).unwrap();

    let (transport, mut deliveries) = InProcessTransport::connect(plane.clone());
    let resumed = sync.reconnect(StreamClient::new(transport)).await.unwrap();
    assert_eq!(resumed, 1);
    for _ in 0..2 {
        let delivery = next(&mut deliveries).await;
        sync.handle_delivery(&delivery);
    }
    assert_eq!(sync.last_cursor(), Some(3));
    assert!(sync.projector().task("t2").is_some());
}

#[tokio::test]
async fn lagging_subscriber_is_cut_off_and_recovers_on_reconnect() {
    let mut options = ControlPlaneOptions::new(scope());
    options.subscriber_queue = 2;
    let plane = ControlPlane::new(options, None);
    plane.workspace().apply(upsert_repo("r1")).unwrap();

    let (transport, mut deliveries) = InProcessTransport::connect(plane.clone());
    let mut sync = WorkspaceSync::new(
        StreamClient::new(transport),
        scope(),
        ObservedEventProjector::default(),
    );
    assert_eq!(sync.bootstrap().await.unwrap(), 1);

    // Three events into a queue of two: the third closes the connection.
    for id in ["r2", "r3", "r4"] {
        plane.workspace().apply(upsert_repo(id)).unwrap();
    }
    assert_eq!(plane.subscriptions().subscription_count(), 0);

    let mut drained = Vec::new();
    while let Some(delivery) = timeout(Duration::from_secs(2), deliveries.recv())
        .await
        .expect("queue should end instead of stalling")
    {
        drained.push(delivery.cursor);
        sync.handle_delivery(&delivery);
    }
    assert_eq!(drained, vec![2, 3]);
    assert_eq!(sync.last_cursor(), Some(3));

    plane.workspace().apply(upsert_repo("r5")).unwrap();

    let (transport, mut deliveries) = InProcessTransport::connect(plane.clone());
    assert_eq!(sync.reconnect(StreamClient::new(transport)).await.unwrap(), 3);
    for expected in [4, 5] {
        let delivery = next(&mut deliveries).await;
        assert_eq!(delivery.cursor, expected);
        sync.handle_delivery(&delivery);
    }

    let (_, server_state) = plane.workspace().snapshot().into_snapshot();
    assert_eq!(sync.projector().snapshot(), server_state);
    assert_eq!(sync.projector().repositories().len(), 5);
}

#[tokio::test]
async fn reconnect_to_a_restarted_server_bootstraps_again() {
    let before = plane();
    before.workspace().apply(upsert_repo("r1")).unwrap();
    before.workspace().apply(create_task("t1", "r1")).unwrap();
    before.workspace().apply(create_task("t2", "r1")).unwrap();

    let (transport, _deliveries) = InProcessTransport::connect(before.clone());
    let mut sync = WorkspaceSync::new(
        StreamClient::new(transport),
        scope(),
        ObservedEventProjector::default(),
    );
    assert_eq!(sync.bootstrap().await.unwrap(), 3);

    // Same workspace, fresh process: cursors start again from zero.
    let after = plane();
    after.workspace().apply(upsert_repo("fresh")).unwrap();

    let (transport, mut deliveries) = InProcessTransport::connect(after.clone());
    assert_eq!(sync.reconnect(StreamClient::new(transport)).await.unwrap(), 1);
    assert_eq!(sync.last_cursor(), Some(1));
    assert!(sync.projector().repository("fresh").is_some());
    assert!(sync.projector().task("t1").is_none());

    after.workspace().apply(create_task("t9", "fresh")).unwrap();
    let delivery = next(&mut deliveries).await;
    assert_eq!(delivery.cursor, 2);
    assert_eq!(
        sync.handle_delivery(&delivery),
        DeliveryOutcome::Applied { changed: true }
    );
    assert!(sync.projector().task("t9").is_some());
}

#[tokio::test]
async fn websocket_transport_round_trip() {
    let plane = plane();
    plane.workspace().apply(upsert_repo("r1")).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = api_router_with_auth(plane.clone(), Some("secret".into()));
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let url = format!("ws://{addr}/ws");
    let (transport, mut deliveries) = WsTransport::connect(&url, Some("secret"), 64).await.unwrap();
    let client = StreamClient::new(transport);

    assert_eq!(
        client.read_observed_stream_cursor_baseline(&scope()).await.unwrap(),
        Some(1)
    );

    let snapshot = client.load_snapshot(&scope()).await.unwrap();
    assert_eq!(snapshot.cursor, 1);
    assert_eq!(snapshot.repositories[0].repository_id, "r1");

    let ack = client.subscribe(&scope(), Some(0)).await.unwrap();
    let replayed = next(&mut deliveries).await;
    assert_eq!(replayed.subscription_id, ack.subscription_id);
    assert_eq!(replayed.cursor, 1);

    let result = client
        .mutate(vec![create_task("t1", "r1")])
        .await
        .unwrap();
    assert_eq!(result["completed"], 1);
    let live = next(&mut deliveries).await;
    assert_eq!(live.cursor, 2);
    assert_eq!(live.event["type"], "task-created");

    let rejected = client
        .subscribe(&StreamScope::workspace("t1", "u1", "other"), None)
        .await
        .unwrap_err();
    match rejected {
        StreamError::Server { code, .. } => assert_eq!(code, "unknown_workspace"),
        other => panic!("unexpected error: {other:?}"),
    }

    let ahead = client.subscribe(&scope(), Some(99)).await.unwrap_err();
    match ahead {
        StreamError::Server { code, .. } => assert_eq!(code, "cursor_ahead"),
        other => panic!("unexpected error: {other:?}"),
    }
}
