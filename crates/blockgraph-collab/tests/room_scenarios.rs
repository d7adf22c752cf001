//! Integration tests for blockgraph-collab
//!
//! These tests drive the hub end to end through in-memory connections:
//! - Join/leave presence and snapshots
//! - Mutation relay and document state
//! - Dropped and relayed message classes
//! - Slow-consumer isolation
//! - Ordering across concurrent writers
//! - Room registry concurrency and eviction

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use blockgraph_collab::{
    decode, memory_pair, Block, Decoded, Document, Edge, Element, Hub, HubConfig, MemoryPeer,
    Position, SessionId,
};
use serde_json::{json, Value};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

async fn next_raw(peer: &mut MemoryPeer) -> String {
    timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for message")
        .expect("connection closed")
}

async fn next_json(peer: &mut MemoryPeer) -> Value {
    serde_json::from_str(&next_raw(peer).await).unwrap()
}

async fn assert_quiet(peer: &mut MemoryPeer) {
    let got = timeout(QUIET, peer.recv()).await;
    assert!(got.is_err(), "expected no message, got {:?}", got);
}

fn roster_ids(msg: &Value) -> Vec<u64> {
    assert_eq!(msg["type"], "user_joined_list", "not a roster: {msg}");
    msg["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["id"].as_u64().unwrap())
        .collect()
}

/// Join and consume the roster + snapshot every joiner receives.
async fn join(hub: &Hub, key: &str, name: &str) -> (SessionId, MemoryPeer) {
    let (conn, mut peer) = memory_pair(1024);
    let user = hub
        .connect_or_create(key, Document::new(), conn, name)
        .await
        .unwrap();
    let roster = next_json(&mut peer).await;
    assert!(roster_ids(&roster).contains(&user.id.0));
    let created = next_json(&mut peer).await;
    assert_eq!(created["type"], "user_created");
    (user.id, peer)
}

async fn document(hub: &Hub, key: &str) -> (Document, u64) {
    hub.room(key).await.unwrap().document().await.unwrap()
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test]
async fn test_example_session() {
    let hub = Hub::default();

    let (conn_a, mut a) = memory_pair(64);
    let user_a = hub
        .connect_or_create("proj-1", Document::new(), conn_a, "ada")
        .await
        .unwrap();
    assert_eq!(user_a.id, SessionId(1));
    assert_eq!(roster_ids(&next_json(&mut a).await), vec![1]);
    assert_eq!(next_json(&mut a).await["type"], "user_created");

    let (conn_b, mut b) = memory_pair(64);
    let user_b = hub
        .connect_or_create("proj-1", Document::new(), conn_b, "grace")
        .await
        .unwrap();
    assert_eq!(user_b.id, SessionId(2));

    assert_eq!(roster_ids(&next_json(&mut a).await), vec![1, 2]);
    assert_eq!(roster_ids(&next_json(&mut b).await), vec![1, 2]);
    let created = next_json(&mut b).await;
    assert_eq!(created["type"], "user_created");
    assert_eq!(created["user"]["id"], 2);
    assert_eq!(created["user"]["name"], "grace");
    assert_eq!(created["document"]["elements"], json!([]));
    assert_quiet(&mut a).await;

    let create = json!({
        "type": "block_create",
        "block_id": "b1",
        "block": { "id": "b1", "position": { "x": 0, "y": 0 } }
    })
    .to_string();
    a.send(create.clone()).await.unwrap();

    assert_eq!(next_raw(&mut b).await, create);
    assert_quiet(&mut a).await;

    let (doc, version) = document(&hub, "proj-1").await;
    assert_eq!(version, 1);
    assert_eq!(doc.element_count(), 1);
    assert_eq!(doc.get_block("b1").unwrap().position, Some(Position::new(0.0, 0.0)));

    a.disconnect();
    assert_eq!(roster_ids(&next_json(&mut b).await), vec![2]);

    let (doc, _) = document(&hub, "proj-1").await;
    assert!(doc.get("b1").is_some());
}

#[tokio::test]
async fn test_roster_tracks_current_members() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    assert_eq!(roster_ids(&next_json(&mut a).await), vec![1, 2]);
    let (_, mut c) = join(&hub, "proj-1", "linus").await;
    assert_eq!(roster_ids(&next_json(&mut a).await), vec![1, 2, 3]);
    assert_eq!(roster_ids(&next_json(&mut b).await), vec![1, 2, 3]);

    b.disconnect();
    assert_eq!(roster_ids(&next_json(&mut a).await), vec![1, 3]);
    assert_eq!(roster_ids(&next_json(&mut c).await), vec![1, 3]);

    let (id, mut d) = join(&hub, "proj-1", "barbara").await;
    assert_eq!(id, SessionId(4));
    let roster = next_json(&mut a).await;
    assert_eq!(roster_ids(&roster), vec![1, 3, 4]);

    let names: Vec<&str> = roster["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["ada", "linus", "barbara"]);
    assert_quiet(&mut d).await;
}

#[tokio::test]
async fn test_new_joiner_gets_snapshot_at_registration() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    let create = json!({
        "type": "block_create",
        "block_id": "b1",
        "block": { "id": "b1", "label": "Input", "position": { "x": 4, "y": 2 } }
    });
    a.send(create.to_string()).await.unwrap();
    next_raw(&mut b).await;

    let (conn_c, mut c) = memory_pair(64);
    hub.connect_or_create("proj-1", Document::new(), conn_c, "linus")
        .await
        .unwrap();
    next_json(&mut c).await;
    let created = next_json(&mut c).await;
    assert_eq!(created["version"], 1);
    assert_eq!(created["document"]["elements"][0]["id"], "b1");
    assert_eq!(created["document"]["elements"][0]["label"], "Input");

    // Later edits reach the joiner as relayed messages, not as a new snapshot.
    a.send(
        json!({ "type": "block_label_change", "block_id": "b1", "label": "Renamed" }).to_string(),
    )
    .await
    .unwrap();
    let relayed = next_json(&mut c).await;
    assert_eq!(relayed["type"], "block_label_change");

    let (doc, version) = document(&hub, "proj-1").await;
    assert_eq!(version, 2);
    assert_eq!(doc.get_block("b1").unwrap().label.as_deref(), Some("Renamed"));
}

#[tokio::test]
async fn test_snapshot_matches_seed_exactly() {
    let seed = json!({
        "elements": [
            { "id": "b1", "type": "input", "data": { "shape": [28, 28] }, "position": { "x": 1.5, "y": 2.5 } },
            { "id": "b2", "label": "Dense", "params": { "units": 64 } },
            { "id": "e1", "source": "b1", "target": "b2", "style": { "stroke": "#999" } }
        ],
        "viewport": { "x": 0.5, "y": 0.5, "zoom": 1.25 }
    });
    let document: Document = serde_json::from_value(seed.clone()).unwrap();

    let hub = Hub::default();
    let (conn, mut peer) = memory_pair(64);
    hub.connect_or_create("proj-1", document, conn, "ada")
        .await
        .unwrap();
    next_json(&mut peer).await;
    let created = next_json(&mut peer).await;

    assert_eq!(created["type"], "user_created");
    assert_eq!(created["document"], seed);
}

// ============================================================================
// Relay
// ============================================================================

#[tokio::test]
async fn test_sender_never_receives_own_messages() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    let messages = [
        json!({ "type": "chat", "text": "hello" }),
        json!({
            "type": "cursor_move",
            "user": { "id": 1, "name": "ada", "color": "#000000" },
            "position": { "x": 3.5, "y": 9.0 }
        }),
        json!({ "type": "block_create", "block_id": "b1", "block": { "id": "b1" } }),
        json!({ "type": "lasso_select", "ids": ["b1"] }),
    ];
    for msg in &messages {
        let raw = msg.to_string();
        a.send(raw.clone()).await.unwrap();
        assert_eq!(next_raw(&mut b).await, raw);
    }
    assert_quiet(&mut a).await;
}

#[tokio::test]
async fn test_non_mutating_messages_leave_document_alone() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    a.send(json!({ "type": "chat", "text": "hi" }).to_string())
        .await
        .unwrap();
    next_raw(&mut b).await;

    let (doc, version) = document(&hub, "proj-1").await;
    assert_eq!(doc, Document::new());
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_block_field_mutations() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    for msg in [
        json!({ "type": "block_create", "block_id": "b1", "block": { "id": "b1", "category": "layers" } }),
        json!({ "type": "block_move", "block_id": "b1", "position": { "x": 10, "y": 20 } }),
        json!({ "type": "block_config_change", "block_id": "b1", "param_name": "units", "param_value": 64 }),
        json!({ "type": "block_label_change", "block_id": "b1", "label": "Dense" }),
    ] {
        a.send(msg.to_string()).await.unwrap();
        next_raw(&mut b).await;
    }

    let (doc, version) = document(&hub, "proj-1").await;
    assert_eq!(version, 4);
    let block = doc.get_block("b1").unwrap();
    assert_eq!(block.position, Some(Position::new(10.0, 20.0)));
    assert_eq!(block.param("units"), Some(&json!(64)));
    assert_eq!(block.label.as_deref(), Some("Dense"));
    assert_eq!(block.extra.get("category"), Some(&json!("layers")));
}

#[tokio::test]
async fn test_remove_of_missing_block_is_noop() {
    let hub = Hub::default();
    let seed = Document::with_elements(vec![Block::new("b1", Position::default()).into()]);
    let (conn_a, mut a) = memory_pair(64);
    hub.connect_or_create("proj-1", seed.clone(), conn_a, "ada")
        .await
        .unwrap();
    next_json(&mut a).await;
    next_json(&mut a).await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    let remove = json!({ "type": "block_remove", "block_id": "ghost" }).to_string();
    a.send(remove.clone()).await.unwrap();
    assert_eq!(next_raw(&mut b).await, remove);

    let (doc, _) = document(&hub, "proj-1").await;
    assert_eq!(doc, seed);
}

#[tokio::test]
async fn test_edge_messages_replace_whole_element_list() {
    // Edge messages replace every element while block messages patch one
    // field; pin that asymmetry.
    let hub = Hub::default();
    let seed = Document::with_elements(vec![
        Block::new("b1", Position::default()).into(),
        Block::new("b2", Position::new(50.0, 0.0)).into(),
    ]);
    let (conn_a, mut a) = memory_pair(64);
    hub.connect_or_create("proj-1", seed, conn_a, "ada")
        .await
        .unwrap();
    next_json(&mut a).await;
    next_json(&mut a).await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    let elements = json!([
        { "id": "b1", "position": { "x": 0, "y": 0 } },
        { "id": "e1", "source": "b1", "target": "b2", "animated": true }
    ]);
    a.send(json!({ "type": "edge_create", "elements": elements }).to_string())
        .await
        .unwrap();
    next_raw(&mut b).await;

    let (doc, _) = document(&hub, "proj-1").await;
    assert_eq!(doc.element_count(), 2);
    assert!(doc.get("b2").is_none());
    assert!(matches!(doc.get("e1"), Some(Element::Edge(_))));

    a.send(json!({ "type": "edge_update", "elements": [] }).to_string())
        .await
        .unwrap();
    next_raw(&mut b).await;
    let (doc, version) = document(&hub, "proj-1").await;
    assert_eq!(doc.element_count(), 0);
    assert_eq!(version, 2);
}

// ============================================================================
// Dropped messages
// ============================================================================

#[tokio::test]
async fn test_malformed_payload_is_dropped_and_connection_kept() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    a.send(json!({ "type": "block_move", "block_id": "b1" }).to_string())
        .await
        .unwrap();
    a.send("{ not json").await.unwrap();
    a.send(json!({ "text": "no discriminator" }).to_string())
        .await
        .unwrap();

    let chat = json!({ "type": "chat", "text": "still here" }).to_string();
    a.send(chat.clone()).await.unwrap();
    assert_eq!(next_raw(&mut b).await, chat);

    let (doc, version) = document(&hub, "proj-1").await;
    assert_eq!(doc, Document::new());
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_non_mutating_payloads_are_relayed_unchecked() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    let cursor = json!({ "type": "cursor_move", "position": "top-left" }).to_string();
    a.send(cursor.clone()).await.unwrap();
    assert_eq!(next_raw(&mut b).await, cursor);

    let (doc, version) = document(&hub, "proj-1").await;
    assert_eq!(doc, Document::new());
    assert_eq!(version, 0);
}

#[tokio::test]
async fn test_server_only_messages_from_clients_are_dropped() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    a.send(json!({ "type": "user_joined_list", "users": [] }).to_string())
        .await
        .unwrap();
    a.send(
        json!({
            "type": "user_created",
            "user": { "id": 1, "name": "ada", "color": "#ffffff" },
            "document": { "elements": [{ "id": "evil" }] },
            "version": 99
        })
        .to_string(),
    )
    .await
    .unwrap();

    let chat = json!({ "type": "chat", "text": "after" }).to_string();
    a.send(chat.clone()).await.unwrap();
    assert_eq!(next_raw(&mut b).await, chat);

    // Server-only kinds are refused before their payload is looked at.
    a.send(json!({ "type": "user_created" }).to_string())
        .await
        .unwrap();
    let chat = json!({ "type": "chat", "text": "still after" }).to_string();
    a.send(chat.clone()).await.unwrap();
    assert_eq!(next_raw(&mut b).await, chat);

    let (doc, _) = document(&hub, "proj-1").await;
    assert!(doc.get("evil").is_none());
    assert_eq!(hub.room("proj-1").await.unwrap().stats().await.unwrap().members, 2);
}

// ============================================================================
// Slow consumers
// ============================================================================

#[tokio::test]
async fn test_slow_consumer_is_disconnected_without_stalling_others() {
    let hub = Hub::new(HubConfig::default().with_mailbox_capacity(8));
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-1", "grace").await;
    next_json(&mut a).await;

    // The stalled peer never reads and its transport buffers a single frame.
    let (conn_s, _stalled) = memory_pair(1);
    let slow = hub
        .connect_or_create("proj-1", Document::new(), conn_s, "stalled")
        .await
        .unwrap();
    assert_eq!(roster_ids(&next_json(&mut a).await), vec![1, 2, slow.id.0]);
    assert_eq!(roster_ids(&next_json(&mut b).await), vec![1, 2, slow.id.0]);

    let mut chats = 0;
    let mut last_roster = None;
    for i in 0..40 {
        let chat = json!({ "type": "chat", "text": format!("m{i}") }).to_string();
        a.send(chat.clone()).await.unwrap();
        loop {
            let msg = next_json(&mut b).await;
            match msg["type"].as_str() {
                Some("chat") => {
                    assert_eq!(msg["text"], format!("m{i}"));
                    chats += 1;
                    break;
                }
                Some("user_joined_list") => last_roster = Some(roster_ids(&msg)),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    assert_eq!(chats, 40);
    assert_eq!(last_roster, Some(vec![1, 2]));
    assert_eq!(roster_ids(&next_json(&mut a).await), vec![1, 2]);

    let stats = hub.room("proj-1").await.unwrap().stats().await.unwrap();
    assert_eq!(stats.members, 2);
}

// ============================================================================
// Ordering
// ============================================================================

fn writer_messages(writer: usize) -> Vec<String> {
    (0..30)
        .map(|i| {
            let id = format!("b{}", (i + writer) % 4);
            let msg = match i % 6 {
                0 => json!({
                    "type": "block_create",
                    "block_id": id,
                    "block": { "id": id, "label": format!("w{writer}-{i}") }
                }),
                1 => json!({
                    "type": "block_move",
                    "block_id": id,
                    "position": { "x": writer, "y": i }
                }),
                2 => json!({
                    "type": "block_config_change",
                    "block_id": id,
                    "param_name": "owner",
                    "param_value": writer
                }),
                3 => json!({ "type": "block_label_change", "block_id": id, "label": format!("l{writer}-{i}") }),
                4 => json!({ "type": "block_remove", "block_id": id }),
                _ => json!({
                    "type": "edge_update",
                    "elements": [{ "id": id, "label": format!("reset{writer}") }]
                }),
            };
            msg.to_string()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_match_sequential_replay() {
    let hub = Hub::default();
    let seed = Document::with_elements(vec![
        Block::new("b0", Position::default()).into(),
        Edge::new("e0", "b0", "b1").into(),
    ]);

    let (conn_o, mut observer) = memory_pair(1024);
    hub.connect_or_create("proj-1", seed.clone(), conn_o, "observer")
        .await
        .unwrap();

    let mut writers = Vec::new();
    for w in 0..3 {
        let (conn, peer) = memory_pair(1024);
        hub.connect_or_create("proj-1", Document::new(), conn, format!("writer{w}"))
            .await
            .unwrap();
        writers.push((w, peer));
    }

    let mut tasks = Vec::new();
    for (w, peer) in writers {
        tasks.push(tokio::spawn(async move {
            for raw in writer_messages(w) {
                peer.send(raw).await.unwrap();
            }
            peer
        }));
    }
    let mut peers = Vec::new();
    for task in tasks {
        peers.push(task.await.unwrap());
    }

    // Replay what the observer saw, in the order it saw it.
    let mut replay = seed;
    let mut applied = 0;
    while applied < 90 {
        let raw = next_raw(&mut observer).await;
        if let Decoded::Known(msg) = decode(&raw).unwrap() {
            if let Some(edit) = msg.into_edit() {
                replay.apply(edit);
                applied += 1;
            }
        }
    }

    let (live, version) = document(&hub, "proj-1").await;
    assert_eq!(version, 90);
    assert_eq!(live, replay);
    drop(peers);
}

// ============================================================================
// Hub
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_connections_share_one_room() {
    let hub = Arc::new(Hub::default());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let hub = Arc::clone(&hub);
        tasks.push(tokio::spawn(async move {
            let (conn, peer) = memory_pair(64);
            let seed = Document::with_elements(vec![
                Block::new(format!("seed{i}"), Position::default()).into()
            ]);
            let user = hub
                .connect_or_create("fresh", seed, conn, format!("user{i}"))
                .await
                .unwrap();
            (user, peer)
        }));
    }

    let mut ids = HashSet::new();
    let mut peers = Vec::new();
    for task in tasks {
        let (user, peer) = task.await.unwrap();
        ids.insert(user.id.0);
        peers.push(peer);
    }

    assert_eq!(hub.room_count().await, 1);
    assert_eq!(ids, (1..=8).collect::<HashSet<u64>>());

    // Exactly one of the offered snapshots seeded the room.
    let (doc, _) = document(&hub, "fresh").await;
    assert_eq!(doc.element_count(), 1);
}

#[tokio::test]
async fn test_empty_rooms_are_retained_until_evicted() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    a.send(json!({ "type": "block_create", "block_id": "b1", "block": { "id": "b1" } }).to_string())
        .await
        .unwrap();
    let (_, _b) = join(&hub, "proj-2", "grace").await;

    let room = hub.room("proj-1").await.unwrap();
    a.disconnect();
    let stats = timeout(WAIT, async {
        loop {
            let stats = room.stats().await.unwrap();
            if stats.members == 0 {
                return stats;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // Kept by default: the edit survives the disconnect.
    assert_eq!(stats.element_count, 1);
    assert_eq!(hub.room_count().await, 2);

    let evicted = hub.evict_idle(Duration::ZERO).await;
    assert_eq!(evicted, vec!["proj-1".to_string()]);
    assert_eq!(hub.room_keys().await, vec!["proj-2".to_string()]);

    // Rejoining after eviction starts a fresh room from the new snapshot.
    let (conn, mut c) = memory_pair(64);
    let user = hub
        .connect_or_create("proj-1", Document::new(), conn, "linus")
        .await
        .unwrap();
    assert_eq!(user.id, SessionId(1));
    next_json(&mut c).await;
    let created = next_json(&mut c).await;
    assert_eq!(created["document"]["elements"], json!([]));
}

#[tokio::test]
async fn test_shutdown_disconnects_everyone() {
    let hub = Hub::default();
    let (_, mut a) = join(&hub, "proj-1", "ada").await;
    let (_, mut b) = join(&hub, "proj-2", "grace").await;

    hub.shutdown().await;

    assert!(timeout(WAIT, a.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, b.recv()).await.unwrap().is_none());
    assert_eq!(hub.room_count().await, 0);
}
