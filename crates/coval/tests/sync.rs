//! Syncing between nodes over in-memory peers.

use std::time::Duration;

use coval::perms::Role;
use coval::sync::{PeerRole, SyncMessage};
use coval::{CoValueHeader, CoValueType, LoadOutcome, NodeError, Ruleset};
use coval_testkit::{
    connected_nodes, drain_messages, init_tracing, next_message, raw_peer, server_with_clients,
    session_content, TestAgent, TestNode,
};
use serde_json::json;

#[tokio::test]
async fn client_writes_reach_the_server() -> anyhow::Result<()> {
    init_tracing();
    let (client, server) = connected_nodes();

    let group = client.create_group()?;
    let map = client.create_map(group)?;
    map.set("hello", json!("world"))?;
    client.wait_for_sync(map.id(), &server.peer_id()).await?;
    client.wait_for_sync(group, &server.peer_id()).await?;

    assert_eq!(server.known_state(map.id()), client.known_state(map.id()));
    assert_eq!(server.known_state(group), client.known_state(group));
    Ok(())
}

#[tokio::test]
async fn members_load_and_read_through_the_server() -> anyhow::Result<()> {
    init_tracing();
    let (server, clients) = server_with_clients(&["alice", "bob"]);
    let (alice, bob) = (&clients[0], &clients[1]);

    let group = alice.create_group()?;
    alice.add_member(group, bob.agent_id(), Role::Reader)?;
    let map = alice.create_map(group)?;
    map.set("title", json!("shared"))?;
    alice.wait_for_sync(map.id(), &server.peer_id()).await?;
    alice.wait_for_sync(group, &server.peer_id()).await?;

    assert_eq!(bob.load(map.id()).await?, LoadOutcome::Available);
    let bobs_view = bob.co_map(map.id())?;
    assert_eq!(bobs_view.get("title")?, Some(json!("shared")));

    // Readers may not write.
    assert!(matches!(
        bobs_view.set("title", json!("mine")),
        Err(NodeError::NotAuthorized(_))
    ));
    Ok(())
}

#[tokio::test]
async fn outsiders_load_private_values_as_unauthorized() -> anyhow::Result<()> {
    init_tracing();
    let (server, clients) = server_with_clients(&["alice", "mallory"]);
    let (alice, mallory) = (&clients[0], &clients[1]);

    let group = alice.create_group()?;
    let map = alice.create_map(group)?;
    map.set("secret", json!(42))?;
    alice.wait_for_sync(map.id(), &server.peer_id()).await?;

    assert_eq!(mallory.load(map.id()).await?, LoadOutcome::Unauthorized);
    Ok(())
}

#[tokio::test]
async fn unknown_values_load_as_unavailable() -> anyhow::Result<()> {
    init_tracing();
    let (client, _server) = connected_nodes();

    let missing = CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll).id();
    assert_eq!(client.load(missing).await?, LoadOutcome::Unavailable);
    Ok(())
}

#[tokio::test]
async fn live_updates_reach_other_clients() -> anyhow::Result<()> {
    init_tracing();
    let (server, clients) = server_with_clients(&["alice", "bob"]);
    let (alice, bob) = (&clients[0], &clients[1]);

    let group = alice.create_group()?;
    alice.add_member(group, bob.agent_id(), Role::Writer)?;
    let map = alice.create_map(group)?;
    map.set("n", json!(1))?;
    alice.wait_for_sync(map.id(), &server.peer_id()).await?;
    alice.wait_for_sync(group, &server.peer_id()).await?;
    bob.load(map.id()).await?;

    let mut subscription = bob.subscribe(map.id());
    subscription.recv().await.expect("current state");

    map.set("n", json!(2))?;
    let expected = alice.known_state(map.id()).expect("held");
    loop {
        let known = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await?
            .expect("subscription open");
        if expected.is_subset_of(&known) {
            break;
        }
    }
    assert_eq!(bob.co_map(map.id())?.get("n")?, Some(json!(2)));

    // And back the other way, in a later millisecond so bob's write
    // replays last.
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.co_map(map.id())?.set("n", json!(3))?;
    bob.wait_for_sync(map.id(), &server.peer_id()).await?;
    server.wait_for_sync(map.id(), &alice.peer_id()).await?;
    assert_eq!(map.get("n")?, Some(json!(3)));
    Ok(())
}

#[tokio::test]
async fn independently_created_branches_converge() -> anyhow::Result<()> {
    init_tracing();
    let (server, clients) = server_with_clients(&["alice", "bob"]);
    let (alice, bob) = (&clients[0], &clients[1]);

    let group = alice.create_group()?;
    alice.add_member(group, bob.agent_id(), Role::Writer)?;
    let map = alice.create_map(group)?;
    map.set("k", json!("v"))?;
    alice.wait_for_sync(map.id(), &server.peer_id()).await?;
    alice.wait_for_sync(group, &server.peer_id()).await?;

    let from_alice = alice.create_branch(map.id(), "draft", None).await?;
    let from_bob = bob.create_branch(map.id(), "draft", None).await?;
    assert_eq!(from_alice, from_bob);
    Ok(())
}

#[tokio::test]
async fn dependencies_are_sent_first() -> anyhow::Result<()> {
    init_tracing();
    let node = TestNode::new("node");
    let mut upstream = raw_peer(&node, "server", PeerRole::Server);

    let group = node.create_group()?;
    let map = node.create_map(group)?;
    map.set("a", json!(1))?;
    node.flush();

    let order: Vec<_> = drain_messages(&mut upstream)
        .into_iter()
        .filter_map(|msg| match msg {
            SyncMessage::Content(content) => Some(content.id),
            _ => None,
        })
        .collect();
    let group_at = order.iter().position(|id| *id == group).expect("group sent");
    let map_at = order.iter().position(|id| *id == map.id()).expect("map sent");
    assert!(group_at < map_at);
    Ok(())
}

#[tokio::test]
async fn writes_from_outsiders_are_not_passed_on() -> anyhow::Result<()> {
    init_tracing();
    let node = TestNode::new("node");
    let mut upstream = raw_peer(&node, "server", PeerRole::Server);
    let mut client = raw_peer(&node, "client", PeerRole::Client);
    let mallory = TestAgent::new();
    let carol = TestAgent::new();

    let group = node.create_group()?;
    node.add_member(group, carol.id(), Role::Writer)?;
    let map = node.create_map(group)?;
    map.set("a", json!(1))?;
    node.flush();
    drain_messages(&mut upstream);

    let position = node.group_state(group)?.position().clone();
    let takeover = json!({"op": "set", "key": "a", "value": "taken over"});
    let (outsider, from_mallory) =
        session_content(map.id(), &mallory.secret, &[(1, Some(&position), takeover)])?;
    let note = json!({"op": "set", "key": "b", "value": "from carol"});
    let (member, from_carol) =
        session_content(map.id(), &carol.secret, &[(1, Some(&position), note)])?;
    for msg in [from_mallory, from_carol] {
        client.outgoing.send(SyncMessage::Content(msg))?;
        assert!(matches!(next_message(&mut client).await, Some(SyncMessage::Known(_))));
    }

    let forwarded: Vec<_> = drain_messages(&mut upstream)
        .into_iter()
        .filter_map(|msg| match msg {
            SyncMessage::Content(content) if content.id == map.id() => Some(content),
            _ => None,
        })
        .collect();
    assert!(forwarded.iter().any(|content| content.new.contains_key(&member)));
    assert!(forwarded.iter().all(|content| !content.new.contains_key(&outsider)));

    // The outsider's session is held but never counts.
    assert!(node.known_state(map.id()).map_or(false, |k| k.count(&outsider) == 1));
    assert_eq!(map.get("a")?, Some(json!(1)));
    assert_eq!(map.get("b")?, Some(json!("from carol")));
    let valid = node.get_valid_transactions(map.id(), &Default::default())?;
    assert!(valid.iter().all(|tx| tx.tx_id.session != outsider));
    Ok(())
}

#[tokio::test]
async fn content_without_header_is_corrected() -> anyhow::Result<()> {
    init_tracing();
    let node = TestNode::new("node");
    let mut client = raw_peer(&node, "client", PeerRole::Client);

    let id = CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll).id();
    client.outgoing.send(SyncMessage::Content(coval::core::NewContentMessage {
        id,
        header: None,
        new: Default::default(),
        expect_content_until: None,
    }))?;

    match next_message(&mut client).await {
        Some(SyncMessage::Known(reply)) => {
            assert!(reply.is_correction);
            assert!(!reply.known.header);
            assert_eq!(reply.known.id, id);
        }
        other => panic!("expected a correction, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn loads_for_unknown_values_get_an_empty_answer() -> anyhow::Result<()> {
    init_tracing();
    let node = TestNode::new("node");
    let mut client = raw_peer(&node, "client", PeerRole::Client);

    let id = CoValueHeader::new_unique(CoValueType::CoMap, Ruleset::UnsafeAllowAll).id();
    client
        .outgoing
        .send(SyncMessage::Load(coval::KnownState::empty(id)))?;

    match next_message(&mut client).await {
        Some(SyncMessage::Known(reply)) => {
            assert!(!reply.is_correction);
            assert!(!reply.known.header);
        }
        other => panic!("expected known, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn reconnecting_peer_gets_everything_again() -> anyhow::Result<()> {
    init_tracing();
    let node = TestNode::new("node");
    let group = node.create_group()?;
    node.flush();

    let mut first = raw_peer(&node, "server", PeerRole::Server);
    let announced = drain_messages(&mut first);
    assert!(announced
        .iter()
        .any(|msg| matches!(msg, SyncMessage::Load(known) if known.id == group)));

    let mut second = raw_peer(&node, "server", PeerRole::Server);
    let announced = drain_messages(&mut second);
    assert!(announced
        .iter()
        .any(|msg| matches!(msg, SyncMessage::Load(known) if known.id == group)));

    // The replaced connection is closed.
    assert!(first.outgoing.is_closed() || next_message(&mut first).await.is_none());
    Ok(())
}

#[tokio::test]
async fn wait_for_sync_needs_a_connected_peer() -> anyhow::Result<()> {
    init_tracing();
    let node = TestNode::new("node");
    let group = node.create_group()?;

    let err = node
        .wait_for_sync(group, &"nobody".into())
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Sync(_)));
    Ok(())
}
