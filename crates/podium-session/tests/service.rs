//! Session service tests against an in-memory transport.
//!
//! The mock records every outbound message and lets the test inject
//! connectivity and message events, so the commit pipeline and replica
//! behavior can be exercised without sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use podium_core::{RoomCode, SessionEvent, SessionMessage, SessionState};
use podium_session::{
    LinkId, Role, SessionConfig, SessionHandle, SessionService, Transport, TransportEvent,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// One message the service pushed into the transport. `target` is `None`
/// for broadcasts.
#[derive(Debug)]
struct Sent {
    target: Option<LinkId>,
    message: SessionMessage,
}

struct MockTransport {
    event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    sent_tx: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, _role: Role, _room: RoomCode) -> podium_session::transport::Result<()> {
        Ok(())
    }

    async fn send_to(
        &mut self,
        link: LinkId,
        message: &SessionMessage,
    ) -> podium_session::transport::Result<()> {
        let _ = self.sent_tx.send(Sent {
            target: Some(link),
            message: message.clone(),
        });
        Ok(())
    }

    async fn broadcast(&mut self, message: &SessionMessage) -> podium_session::transport::Result<()> {
        let _ = self.sent_tx.send(Sent {
            target: None,
            message: message.clone(),
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }

    fn needs_probe(&self) -> bool {
        false
    }

    async fn probe(&mut self) -> bool {
        true
    }

    async fn reconnect(&mut self) -> podium_session::transport::Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}

    fn link_count(&self) -> usize {
        1
    }
}

fn mock() -> (
    Box<dyn Transport>,
    mpsc::UnboundedSender<TransportEvent>,
    mpsc::UnboundedReceiver<Sent>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        Box::new(MockTransport { event_rx, sent_tx }),
        event_tx,
        sent_rx,
    )
}

fn config(dir: &TempDir) -> SessionConfig {
    SessionConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

async fn recv_sent(rx: &mut mpsc::UnboundedReceiver<Sent>) -> Sent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timed out waiting for an outbound message")
        .expect("Transport channel closed")
}

/// Await the first committed state matching the predicate.
async fn wait_for_state(
    handle: &SessionHandle,
    pred: impl Fn(&SessionState) -> bool,
) -> SessionState {
    let mut rx = handle.watch_state();
    timeout(Duration::from_secs(2), async {
        loop {
            {
                let state = rx.borrow_and_update().clone();
                if pred(&state) {
                    return state;
                }
            }
            rx.changed().await.expect("Service stopped");
        }
    })
    .await
    .expect("State never matched")
}

#[tokio::test]
async fn test_host_broadcasts_full_snapshot_on_mutation() {
    let dir = TempDir::new().unwrap();
    let (transport, _events, mut sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();

    handle.set_prompt("Explain X", 3);

    let out = recv_sent(&mut sent).await;
    assert_eq!(out.target, None);
    match out.message {
        SessionMessage::SyncState { state } => {
            assert_eq!(state.prompt, "Explain X");
            assert_eq!(state.max_score, 3);
            assert!(state.accepting);
            assert_eq!(state.room_code, handle.room_code());
        }
        other => panic!("Expected a snapshot, got {:?}", other),
    }
    handle.shutdown();
}

#[tokio::test]
async fn test_host_pushes_snapshot_when_a_link_opens() {
    let dir = TempDir::new().unwrap();
    let (transport, events, mut sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();

    events.send(TransportEvent::LinkOpened { link: LinkId(7) }).unwrap();

    let out = recv_sent(&mut sent).await;
    assert_eq!(out.target, Some(LinkId(7)));
    assert!(matches!(out.message, SessionMessage::SyncState { .. }));
    handle.shutdown();
}

#[tokio::test]
async fn test_submission_recorded_even_when_not_accepting() {
    let dir = TempDir::new().unwrap();
    let (transport, events, mut sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();

    handle.set_prompt("Explain X", 3);
    handle.toggle_accepting(false);
    wait_for_state(&handle, |s| !s.accepting && s.prompt == "Explain X").await;

    // The accepting flag gates follower UIs, not host-side recording
    events
        .send(TransportEvent::Message {
            link: LinkId(1),
            message: SessionMessage::SubmitAnswer {
                name: "Alex".to_string(),
                text: "my answer".to_string(),
            },
        })
        .unwrap();

    let state = wait_for_state(&handle, |s| s.responses.len() == 1).await;
    let response = state.responses.values().next().unwrap();
    assert_eq!(response.name, "Alex");
    assert_eq!(response.text, "my answer");
    assert_eq!(response.score, None);
    assert!(!state.accepting);

    // And the new document went out as a full snapshot
    loop {
        let out = recv_sent(&mut sent).await;
        if let SessionMessage::SyncState { state } = out.message {
            if state.responses.len() == 1 {
                break;
            }
        }
    }
    handle.shutdown();
}

#[tokio::test]
async fn test_identical_mutation_skips_the_commit_pipeline() {
    let dir = TempDir::new().unwrap();
    let (transport, _events, mut sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();

    handle.set_prompt("Explain X", 3);
    let first = recv_sent(&mut sent).await;
    assert!(matches!(first.message, SessionMessage::SyncState { .. }));

    // Same arguments produce an identical document: nothing is sent
    handle.set_prompt("Explain X", 3);
    let quiet = timeout(Duration::from_millis(400), sent.recv()).await;
    assert!(quiet.is_err(), "Identical mutation must not broadcast");
    handle.shutdown();
}

#[tokio::test]
async fn test_reset_round_sends_the_draft_clear_twice() {
    let dir = TempDir::new().unwrap();
    let (transport, _events, mut sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();

    handle.set_prompt("Explain X", 3);
    recv_sent(&mut sent).await;

    handle.reset_round();

    // Snapshot of the cleared round plus an immediate resetForm
    let mut reset_count = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while reset_count < 2 {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let out = timeout(remaining, sent.recv())
            .await
            .expect("Timed out waiting for the redundant resetForm")
            .expect("Transport channel closed");
        if matches!(out.message, SessionMessage::ResetForm) {
            reset_count += 1;
        }
    }
    handle.shutdown();
}

#[tokio::test]
async fn test_follower_join_and_replica_overwrite() {
    let dir = TempDir::new().unwrap();
    let (transport, events, mut sent) = mock();
    let room: RoomCode = "AB12".parse().unwrap();

    let mut first = SessionState::default();
    first.room_code = Some(room);
    first.set_prompt("Explain X", 3);

    // The host reacts to the opened link with a snapshot
    events
        .send(TransportEvent::LinkOpened {
            link: LinkId::SHARED,
        })
        .unwrap();
    events
        .send(TransportEvent::Message {
            link: LinkId::SHARED,
            message: SessionMessage::SyncState {
                state: first.clone(),
            },
        })
        .unwrap();

    let handle = SessionService::join_with(&config(&dir), transport, room, "Alex")
        .await
        .unwrap();
    assert_eq!(handle.state(), first);

    // The join request went out when the link opened
    let out = recv_sent(&mut sent).await;
    match out.message {
        SessionMessage::JoinRequest { name } => assert_eq!(name, "Alex"),
        other => panic!("Expected a join request, got {:?}", other),
    }

    // A later snapshot overwrites the replica wholesale
    let mut second = first.clone();
    second.record_response("Alex", "my answer", 1000);
    second.set_accepting(false);
    events
        .send(TransportEvent::Message {
            link: LinkId::SHARED,
            message: SessionMessage::SyncState {
                state: second.clone(),
            },
        })
        .unwrap();

    let state = wait_for_state(&handle, |s| !s.accepting).await;
    assert_eq!(state, second);
    handle.shutdown();
}

#[tokio::test]
async fn test_follower_submission_goes_upstream() {
    let dir = TempDir::new().unwrap();
    let (transport, events, mut sent) = mock();
    let room: RoomCode = "AB12".parse().unwrap();

    events
        .send(TransportEvent::LinkOpened {
            link: LinkId::SHARED,
        })
        .unwrap();
    events
        .send(TransportEvent::Message {
            link: LinkId::SHARED,
            message: SessionMessage::SyncState {
                state: SessionState::default(),
            },
        })
        .unwrap();

    let handle = SessionService::join_with(&config(&dir), transport, room, "Alex")
        .await
        .unwrap();
    recv_sent(&mut sent).await; // the join request

    handle.submit_answer("my answer");
    let out = recv_sent(&mut sent).await;
    match out.message {
        SessionMessage::SubmitAnswer { name, text } => {
            assert_eq!(name, "Alex");
            assert_eq!(text, "my answer");
        }
        other => panic!("Expected a submission, got {:?}", other),
    }
    handle.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_follower_join_times_out_without_a_snapshot() {
    let dir = TempDir::new().unwrap();
    let (transport, _events, _sent) = mock();
    let room: RoomCode = "AB12".parse().unwrap();

    // No link, no snapshot: the join must fail rather than hang
    let result = SessionService::join_with(&config(&dir), transport, room, "Alex").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_duplicate_reset_form_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (transport, events, mut sent) = mock();
    let room: RoomCode = "AB12".parse().unwrap();

    events
        .send(TransportEvent::LinkOpened {
            link: LinkId::SHARED,
        })
        .unwrap();
    events
        .send(TransportEvent::Message {
            link: LinkId::SHARED,
            message: SessionMessage::SyncState {
                state: SessionState::default(),
            },
        })
        .unwrap();

    let handle = SessionService::join_with(&config(&dir), transport, room, "Alex")
        .await
        .unwrap();
    recv_sent(&mut sent).await; // the join request

    // A UI holding a draft clears it on every resetForm; duplicates land
    // on an already-cleared draft
    let draft = Arc::new(Mutex::new(Some("half-typed".to_string())));
    let draft_in_handler = Arc::clone(&draft);
    let resets = Arc::new(Mutex::new(0usize));
    let resets_in_handler = Arc::clone(&resets);
    let _sub = handle.events().subscribe(move |event| {
        if matches!(event, SessionEvent::ResetForm) {
            *draft_in_handler.lock().unwrap() = None;
            *resets_in_handler.lock().unwrap() += 1;
        }
    });

    let before = handle.state();
    for _ in 0..2 {
        events
            .send(TransportEvent::Message {
                link: LinkId::SHARED,
                message: SessionMessage::ResetForm,
            })
            .unwrap();
    }

    timeout(Duration::from_secs(2), async {
        loop {
            if *resets.lock().unwrap() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Both resetForm deliveries should reach the subscriber");

    assert!(draft.lock().unwrap().is_none());
    assert_eq!(handle.state(), before, "resetForm must not touch the replica");
    handle.shutdown();
}

#[tokio::test]
async fn test_host_resumes_room_code_from_the_mirror() {
    let dir = TempDir::new().unwrap();

    let (transport, _events, _sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();
    handle.set_prompt("Explain X", 3);
    wait_for_state(&handle, |s| s.prompt == "Explain X").await;
    let room = handle.room_code().unwrap();
    handle.shutdown();

    // Give the service loop a moment to tear down
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (transport, _events, _sent) = mock();
    let resumed = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();
    assert_eq!(resumed.room_code(), Some(room));
    assert_eq!(resumed.state().prompt, "Explain X");
    resumed.shutdown();
}

#[tokio::test]
async fn test_start_new_class_rotates_the_room_and_clears_everything() {
    let dir = TempDir::new().unwrap();
    let (transport, events, _sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();

    handle.set_prompt("Explain X", 3);
    events
        .send(TransportEvent::Message {
            link: LinkId(1),
            message: SessionMessage::SubmitAnswer {
                name: "Alex".to_string(),
                text: "my answer".to_string(),
            },
        })
        .unwrap();
    let before = wait_for_state(&handle, |s| s.responses.len() == 1).await;
    let old_room = before.room_code.unwrap();

    handle.start_new_class();

    let after = wait_for_state(&handle, |s| s.responses.is_empty() && s.prompt.is_empty()).await;
    let new_room = after.room_code.unwrap();
    assert_ne!(new_room, old_room);
    handle.shutdown();
}

#[tokio::test]
async fn test_local_channel_mirrors_host_snapshots() {
    let dir = TempDir::new().unwrap();
    let (transport, _events, _sent) = mock();
    let handle = SessionService::host_with(&config(&dir), transport)
        .await
        .unwrap();
    let mut local = handle.local_channel().subscribe();

    handle.set_prompt("Explain X", 3);

    let snapshot = timeout(Duration::from_secs(2), async {
        loop {
            let state = local.recv().await.expect("Local channel closed");
            if state.prompt == "Explain X" {
                return state;
            }
        }
    })
    .await
    .expect("No local snapshot arrived");
    assert_eq!(snapshot.max_score, 3);
    handle.shutdown();
}
