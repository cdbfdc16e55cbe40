//! Full-mesh integration tests.
//!
//! Runs the real rendezvous server in-process and drives complete mesh
//! controllers against it: join sequencing, role assignment, negotiation
//! to Stable over loopback ICE, and chat over the data channel.

use std::net::SocketAddr;
use std::time::Duration;

use mesh_engine::{MeshConfig, MeshController, MeshEvent, NegotiationState};
use mesh_server::{create_router, ws::AppState};

async fn spawn_server() -> SocketAddr {
    let app = create_router(AppState::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn controller(addr: SocketAddr, participant_id: &str) -> MeshController {
    let mut config = MeshConfig::new(format!("ws://{addr}"));
    config.participant_id = Some(participant_id.to_string());
    // Loopback-only: no STUN needed, host candidates suffice.
    config.ice_servers.clear();
    MeshController::new(config).unwrap()
}

/// Wait until the controller holds exactly `n` sessions, all Stable.
async fn wait_for_stable_mesh(controller: &MeshController, n: usize) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let states = controller.session_states().await;
            if states.len() == n
                && states
                    .iter()
                    .all(|(_, state)| *state == NegotiationState::Stable)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!("mesh did not stabilize to {n} sessions");
    });
}

#[tokio::test]
async fn two_peer_mesh_reaches_stable() {
    let addr = spawn_server().await;

    let a = controller(addr, "A");
    let b = controller(addr, "B");

    let mut a_events = a.subscribe();

    a.join_room("room", Some("Alice".into())).await.unwrap();

    // A is alone after joining.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if a.self_id().await.as_deref() == Some("A") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
    assert!(a.participants().await.is_empty());

    b.join_room("room", Some("Bea".into())).await.unwrap();

    // Property: each side ends with exactly one Stable session.
    wait_for_stable_mesh(&a, 1).await;
    wait_for_stable_mesh(&b, 1).await;

    // A (first in the room) learned of B through the server.
    let participants = a.participants().await;
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].id, "B");

    // A observed B's arrival as an event.
    let saw_b = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MeshEvent::ParticipantJoined(p)) = a_events.recv().await {
                if p.id == "B" {
                    return true;
                }
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(saw_b, "A never saw ParticipantJoined(B)");

    a.leave_room().await.unwrap();
    b.leave_room().await.unwrap();
}

#[tokio::test]
async fn three_peer_late_join_builds_full_mesh() {
    let addr = spawn_server().await;

    let a = controller(addr, "A");
    let b = controller(addr, "B");
    let c = controller(addr, "C");

    a.join_room("trio", None).await.unwrap();
    wait_for_stable_mesh(&a, 0).await;

    b.join_room("trio", None).await.unwrap();
    wait_for_stable_mesh(&a, 1).await;
    wait_for_stable_mesh(&b, 1).await;

    c.join_room("trio", None).await.unwrap();

    // Full mesh: every controller holds N-1 Stable sessions.
    wait_for_stable_mesh(&a, 2).await;
    wait_for_stable_mesh(&b, 2).await;
    wait_for_stable_mesh(&c, 2).await;

    a.leave_room().await.unwrap();
    b.leave_room().await.unwrap();
    c.leave_room().await.unwrap();
}

#[tokio::test]
async fn chat_crosses_the_data_channel() {
    let addr = spawn_server().await;

    let a = controller(addr, "A");
    let b = controller(addr, "B");
    let mut b_events = b.subscribe();

    a.join_room("chat", None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while a.self_id().await.is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    b.join_room("chat", None).await.unwrap();
    wait_for_stable_mesh(&a, 1).await;
    wait_for_stable_mesh(&b, 1).await;

    // Retry until the data channel is open end-to-end.
    let received = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            a.send_chat_message("hello mesh").await.unwrap();

            let deadline = tokio::time::sleep(Duration::from_millis(300));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    event = b_events.recv() => {
                        if let Ok(MeshEvent::Chat { participant_id, text, .. }) = event {
                            if participant_id == "A" && text == "hello mesh" {
                                return true;
                            }
                        }
                    }
                    () = &mut deadline => break,
                }
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(received, "chat message never arrived at B");

    a.leave_room().await.unwrap();
    b.leave_room().await.unwrap();
}

#[tokio::test]
async fn leaving_tears_down_remote_sessions() {
    let addr = spawn_server().await;

    let a = controller(addr, "A");
    let b = controller(addr, "B");

    a.join_room("bye", None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while a.self_id().await.is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    b.join_room("bye", None).await.unwrap();
    wait_for_stable_mesh(&a, 1).await;
    wait_for_stable_mesh(&b, 1).await;

    b.leave_room().await.unwrap();

    // A drops the session and the participant entry.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if a.session_states().await.is_empty() && a.participants().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("A never observed B's departure");

    a.leave_room().await.unwrap();
}
