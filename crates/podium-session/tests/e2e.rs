//! End-to-end tests over real sockets.
//!
//! Each test spins the relay/rendezvous server in-process on an ephemeral
//! port and runs a host and a follower service against it, once per
//! transport strategy.

use std::time::Duration;

use podium_core::{RoomCode, SessionState};
use podium_relay::RelayServer;
use podium_session::{SessionConfig, SessionHandle, SessionService, TransportKind};
use tempfile::TempDir;
use tokio::time::timeout;

/// Spin up the shared server and return its WebSocket URL.
async fn start_server() -> String {
    let listener = RelayServer::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(RelayServer::new().serve(listener, std::future::pending()));
    format!("ws://{}", addr)
}

fn config(transport: TransportKind, server_url: &str, dir: &TempDir) -> SessionConfig {
    SessionConfig {
        transport,
        server_url: server_url.to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        data_dir: dir.path().to_path_buf(),
    }
}

async fn wait_for_state(
    handle: &SessionHandle,
    pred: impl Fn(&SessionState) -> bool,
) -> SessionState {
    wait_for_state_within(handle, Duration::from_secs(5), pred).await
}

async fn wait_for_state_within(
    handle: &SessionHandle,
    limit: Duration,
    pred: impl Fn(&SessionState) -> bool,
) -> SessionState {
    let mut rx = handle.watch_state();
    timeout(limit, async {
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

/// The full classroom scenario: prompt, join, submit, grade, converge.
async fn run_classroom_scenario(transport: TransportKind) {
    let server_url = start_server().await;
    let host_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();

    let host = SessionService::host(&config(transport, &server_url, &host_dir))
        .await
        .expect("Hosting failed");
    let room = host.room_code().expect("Host has a room code");
    host.set_prompt("Explain X", 3);

    let follower = SessionService::join(
        &config(transport, &server_url, &follower_dir),
        room,
        "Alex",
    )
    .await
    .expect("Join failed");

    // The join snapshot already carries the prompt
    let replica = wait_for_state(&follower, |s| s.prompt == "Explain X").await;
    assert_eq!(replica.max_score, 3);
    assert_eq!(replica.room_code, Some(room));

    follower.submit_answer("my answer");

    let host_state = wait_for_state(&host, |s| s.responses.len() == 1).await;
    let response = host_state.responses.values().next().unwrap().clone();
    assert_eq!(response.name, "Alex");
    assert_eq!(response.text, "my answer");
    assert_eq!(response.score, None);

    host.set_score(response.id.clone(), 2);

    // Replica convergence after the next snapshot
    let replica = wait_for_state(&follower, |s| {
        s.responses
            .get(&response.id)
            .is_some_and(|r| r.score == Some(2))
    })
    .await;
    assert_eq!(replica.responses.len(), 1);

    // Closing the accepting window does not stop host-side recording
    host.toggle_accepting(false);
    wait_for_state(&follower, |s| !s.accepting).await;
    follower.submit_answer("late answer");
    wait_for_state(&host, |s| s.responses.len() == 2).await;

    follower.shutdown();
    host.shutdown();
}

#[tokio::test]
async fn test_relay_classroom_scenario() {
    run_classroom_scenario(TransportKind::Relay).await;
}

#[tokio::test]
async fn test_mesh_classroom_scenario() {
    run_classroom_scenario(TransportKind::Mesh).await;
}

#[tokio::test]
async fn test_mesh_join_unknown_room_fails_fast() {
    let server_url = start_server().await;
    let dir = TempDir::new().unwrap();

    let room: RoomCode = "ZZ99".parse().unwrap();
    let result = SessionService::join(
        &config(TransportKind::Mesh, &server_url, &dir),
        room,
        "Alex",
    )
    .await;
    assert!(result.is_err(), "Joining a room nobody hosts must fail");
}

#[tokio::test]
async fn test_mesh_host_survives_multiple_followers() {
    let server_url = start_server().await;
    let host_dir = TempDir::new().unwrap();

    let host = SessionService::host(&config(TransportKind::Mesh, &server_url, &host_dir))
        .await
        .expect("Hosting failed");
    let room = host.room_code().unwrap();
    host.set_prompt("Explain X", 5);

    let mut followers = Vec::new();
    for name in ["Alex", "Bo", "Chris"] {
        let dir = TempDir::new().unwrap();
        let follower = SessionService::join(
            &config(TransportKind::Mesh, &server_url, &dir),
            room,
            name,
        )
        .await
        .expect("Join failed");
        follower.submit_answer(&format!("answer from {}", name));
        followers.push((follower, dir));
    }

    let host_state = wait_for_state(&host, |s| s.responses.len() == 3).await;
    let names: Vec<_> = host_state.responses.values().map(|r| r.name.clone()).collect();
    assert!(names.contains(&"Bo".to_string()));

    // Every replica converges on the same document
    for (follower, _dir) in &followers {
        let replica = wait_for_state(follower, |s| s.responses.len() == 3).await;
        assert_eq!(replica, host_state);
    }

    for (follower, _dir) in followers {
        follower.shutdown();
    }
    host.shutdown();
}

#[tokio::test]
async fn test_relay_follower_sees_round_reset() {
    let server_url = start_server().await;
    let host_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();

    let host = SessionService::host(&config(TransportKind::Relay, &server_url, &host_dir))
        .await
        .expect("Hosting failed");
    let room = host.room_code().unwrap();
    host.set_prompt("Explain X", 3);

    let follower = SessionService::join(
        &config(TransportKind::Relay, &server_url, &follower_dir),
        room,
        "Alex",
    )
    .await
    .expect("Join failed");

    follower.submit_answer("my answer");
    wait_for_state(&host, |s| s.responses.len() == 1).await;

    host.reset_round();

    let replica = wait_for_state(&follower, |s| s.responses.is_empty() && s.accepting).await;
    assert_eq!(replica.prompt, "Explain X", "Reset keeps the prompt");

    follower.shutdown();
    host.shutdown();
}

#[tokio::test]
async fn test_relay_snapshots_resume_after_server_restart() {
    let listener = RelayServer::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let server_url = format!("ws://{}", addr);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let first_server = tokio::spawn(RelayServer::new().serve(listener, async {
        let _ = stop_rx.await;
    }));

    let host_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();

    let host = SessionService::host(&config(TransportKind::Relay, &server_url, &host_dir))
        .await
        .expect("Hosting failed");
    let room = host.room_code().unwrap();
    host.set_prompt("Explain X", 3);

    let follower = SessionService::join(
        &config(TransportKind::Relay, &server_url, &follower_dir),
        room,
        "Alex",
    )
    .await
    .expect("Join failed");
    wait_for_state(&follower, |s| s.prompt == "Explain X").await;

    // Take the server down, then bring a fresh one up on the same port
    stop_tx.send(()).expect("Server should still be running");
    first_server.await.expect("Server task should not panic");

    let listener = rebind(&addr.to_string()).await;
    tokio::spawn(RelayServer::new().serve(listener, std::future::pending()));

    // Both sides ride out the outage and snapshots flow again
    host.set_prompt("Explain Y", 4);
    let replica = wait_for_state_within(&follower, Duration::from_secs(20), |s| {
        s.prompt == "Explain Y"
    })
    .await;
    assert_eq!(replica.max_score, 4);

    follower.shutdown();
    host.shutdown();
}

/// Bind a specific address, retrying briefly while the old socket lingers.
async fn rebind(addr: &str) -> tokio::net::TcpListener {
    for _ in 0..50 {
        if let Ok(listener) = RelayServer::bind(addr).await {
            return listener;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Address {} never became free", addr);
}
