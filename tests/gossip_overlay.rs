#[path = "common/mod.rs"]
mod common;

use common::{eventually, expect_event, gossip_config, node_contact, Cluster, TRACKER_ADDR};
use iroh_streamnet::protocol::{
    ControlMessage, SubscribeRequest, SubscribeResponse, TrackerRegister,
};
use iroh_streamnet::{
    MessageChain, NodeConfig, NodeError, NodeEvent, StreamPartId, SubscriptionState,
    TransportEvent,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn first_node_on_partition_is_subscribed_immediately() {
    let cluster = Cluster::new().await;
    let node = cluster.spawn_node(1).await;
    let stream = StreamPartId::new("s", 0);

    node.subscribe(stream.clone()).await.unwrap();
    assert_eq!(node.subscription_state(&stream).await, SubscriptionState::Subscribed);
    assert_eq!(node.streams().await, vec![stream.clone()]);
    assert_eq!(cluster.tracker.subscribers(&stream).await, vec![node.id()]);

    // Subscribing again is a no-op.
    node.subscribe(stream.clone()).await.unwrap();
    assert!(node.neighbors(&stream).await.is_empty());
}

#[tokio::test]
async fn tracker_introduces_neighbors_after_acknowledgement() {
    let cluster = Cluster::new().await;
    let a = cluster.spawn_node(1).await;
    let b = cluster.spawn_node(2).await;
    let stream = StreamPartId::new("s", 0);
    let mut a_events = a.events();
    let mut b_events = b.events();

    a.subscribe(stream.clone()).await.unwrap();
    b.subscribe(stream.clone()).await.unwrap();

    b.wait_for_neighbors(&stream, 1, WAIT).await.unwrap();
    a.wait_for_neighbors(&stream, 1, WAIT).await.unwrap();
    assert_eq!(a.neighbors(&stream).await, vec![b.id()]);
    assert_eq!(b.neighbors(&stream).await, vec![a.id()]);
    assert_eq!(b.subscription_state(&stream).await, SubscriptionState::Subscribed);

    let b_id = b.id();
    expect_event(&mut a_events, WAIT, |e| {
        matches!(e, NodeEvent::NodeConnected { peer } if *peer == b_id)
    })
    .await;
    let a_id = a.id();
    let s = stream.clone();
    expect_event(&mut b_events, WAIT, move |e| {
        matches!(e, NodeEvent::NodeSubscribed { peer, stream } if *peer == a_id && *stream == s)
    })
    .await;
}

#[tokio::test]
async fn messages_reach_every_subscriber_once() {
    let cluster = Cluster::new().await;
    let a = cluster.spawn_node(1).await;
    let b = cluster.spawn_node(2).await;
    let c = cluster.spawn_node(3).await;
    let stream = StreamPartId::new("s", 0);

    for node in [&a, &b, &c] {
        node.subscribe(stream.clone()).await.unwrap();
    }
    for node in [&a, &b, &c] {
        node.wait_for_neighbors(&stream, 2, WAIT).await.unwrap();
    }

    let mut b_messages = b.message_listener();
    let mut c_messages = c.message_listener();
    let mut chain = MessageChain::new(stream.clone(), &a.id());
    let message = chain.next(1, b"hello".to_vec());
    assert!(a.publish(message.clone()).await.unwrap());

    for rx in [&mut b_messages, &mut c_messages] {
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.id, message.id);
        assert_eq!(got.content, b"hello");
    }
    sleep(Duration::from_millis(100)).await;
    assert!(b_messages.try_recv().is_err());
    assert!(c_messages.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribing_one_partition_leaves_the_other_flowing() {
    let cluster = Cluster::new().await;
    let a = cluster.spawn_node(1).await;
    let b = cluster.spawn_node(2).await;
    let s1 = StreamPartId::new("s", 1);
    let s2 = StreamPartId::new("s", 2);

    for stream in [&s2, &s1] {
        a.subscribe(stream.clone()).await.unwrap();
        b.subscribe(stream.clone()).await.unwrap();
    }
    for stream in [&s1, &s2] {
        a.wait_for_neighbors(stream, 1, WAIT).await.unwrap();
        b.wait_for_neighbors(stream, 1, WAIT).await.unwrap();
    }

    let mut a_events = a.events();
    let mut b_messages = b.message_listener();
    b.unsubscribe(&s2).await.unwrap();
    let b_id = b.id();
    let gone = s2.clone();
    expect_event(&mut a_events, WAIT, move |e| {
        matches!(e, NodeEvent::NodeUnsubscribed { peer, stream } if *peer == b_id && *stream == gone)
    })
    .await;

    let mut chain_two = MessageChain::new(s2.clone(), &a.id());
    let mut chain_one = MessageChain::new(s1.clone(), &a.id());
    a.publish(chain_two.next(10, b"two".to_vec())).await.unwrap();
    a.publish(chain_one.next(11, b"one".to_vec())).await.unwrap();

    // Frames on one connection stay ordered, so s#2 traffic would show up first.
    let got = timeout(WAIT, b_messages.recv()).await.unwrap().unwrap();
    assert_eq!(got.stream(), &s1);
    assert_eq!(got.content, b"one");
    sleep(Duration::from_millis(50)).await;
    assert!(b_messages.try_recv().is_err());

    assert!(cluster.network.is_linked(&a.id(), &b.id()).await);
    assert_eq!(a.neighbors(&s1).await, vec![b.id()]);
    assert!(a.neighbors(&s2).await.is_empty());
    assert_eq!(b.subscription_state(&s2).await, SubscriptionState::Unsubscribed);
    assert_eq!(cluster.tracker.subscribers(&s2).await, vec![a.id()]);
}

#[tokio::test]
async fn mutual_unsubscribe_disconnects_both_sides() {
    let cluster = Cluster::new().await;
    let a = cluster.spawn_node(1).await;
    let b = cluster.spawn_node(2).await;
    let stream = StreamPartId::new("s", 1);

    a.subscribe(stream.clone()).await.unwrap();
    b.subscribe(stream.clone()).await.unwrap();
    b.wait_for_neighbors(&stream, 1, WAIT).await.unwrap();
    a.wait_for_neighbors(&stream, 1, WAIT).await.unwrap();

    let mut a_events = a.events();
    let mut b_events = b.events();
    a.unsubscribe(&stream).await.unwrap();
    b.unsubscribe(&stream).await.unwrap();

    let b_id = b.id();
    expect_event(&mut a_events, WAIT, move |e| {
        matches!(e, NodeEvent::NodeDisconnected { peer } if *peer == b_id)
    })
    .await;
    let a_id = a.id();
    expect_event(&mut b_events, WAIT, move |e| {
        matches!(e, NodeEvent::NodeDisconnected { peer } if *peer == a_id)
    })
    .await;
    assert!(!cluster.network.is_linked(&a.id(), &b.id()).await);
    assert!(a.streams().await.is_empty());
}

#[tokio::test]
async fn duplicate_gossip_is_delivered_and_forwarded_once() {
    let cluster = Cluster::new().await;
    let node = cluster.spawn_node_with(1, NodeConfig::default()).await;
    let stream = StreamPartId::new("s", 0);
    node.subscribe(stream.clone()).await.unwrap();

    let mut p1 = cluster.wire_peer(11).await;
    let mut p2 = cluster.wire_peer(12).await;
    let request = ControlMessage::SubscribeRequest(SubscribeRequest {
        stream: stream.clone(),
    });
    for client in [&mut p1, &mut p2] {
        let peer = client.connect("node-1").await;
        client.send(&peer, &request).await;
        match client.next_message(WAIT).await {
            Some(ControlMessage::SubscribeResponse(SubscribeResponse { accepted, .. })) => {
                assert!(accepted)
            }
            other => panic!("expected a subscribe response, got {other:?}"),
        }
    }
    node.wait_for_neighbors(&stream, 2, WAIT).await.unwrap();

    let mut events = node.events();
    let mut delivered = node.message_listener();
    let mut chain = MessageChain::new(stream.clone(), &p1.id());
    let message = chain.next(5, b"payload".to_vec());
    let data = ControlMessage::Data(message.clone());
    p1.send(&node.id(), &data).await;
    p2.send(&node.id(), &data).await;

    let p2_id = p2.id();
    expect_event(&mut events, WAIT, move |e| {
        matches!(e, NodeEvent::DuplicateMessageReceived { from, .. } if *from == Some(p2_id))
    })
    .await;

    let got = delivered.try_recv().expect("one delivery");
    assert_eq!(got.id, message.id);
    assert!(delivered.try_recv().is_err());

    // Forwarded to the other neighbor only, never back to the source.
    let to_p2: Vec<_> = p2
        .drain_messages()
        .into_iter()
        .filter(|m| matches!(m, ControlMessage::Data(_)))
        .collect();
    assert_eq!(to_p2, vec![data.clone()]);
    let to_p1: Vec<_> = p1
        .drain_messages()
        .into_iter()
        .filter(|m| matches!(m, ControlMessage::Data(_)))
        .collect();
    assert!(to_p1.is_empty());
}

#[tokio::test]
async fn publish_reports_novelty_and_rejects_invalid_messages() {
    let cluster = Cluster::new().await;
    let node = cluster.spawn_node_with(1, NodeConfig::default()).await;
    let stream = StreamPartId::new("s", 0);
    let mut chain = MessageChain::new(stream.clone(), &node.id());
    let message = chain.next(1, b"x".to_vec());

    // Not subscribed: still filtered, just not delivered locally.
    let mut delivered = node.message_listener();
    assert!(node.publish(message.clone()).await.unwrap());
    assert!(!node.publish(message).await.unwrap());
    assert!(delivered.try_recv().is_err());

    let mut bad = MessageChain::new(StreamPartId::new("", 0), &node.id());
    assert!(matches!(
        node.publish(bad.next(1, vec![])).await,
        Err(NodeError::InvalidMessage(_))
    ));
    let too_big = chain.next(2, vec![0; node.config().max_message_size + 1]);
    assert!(matches!(
        node.publish(too_big).await,
        Err(NodeError::InvalidMessage(_))
    ));
}

#[tokio::test]
async fn wait_for_neighbors_times_out_with_current_count() {
    let cluster = Cluster::new().await;
    let node = cluster.spawn_node(1).await;
    let stream = StreamPartId::new("lonely", 0);
    node.subscribe(stream.clone()).await.unwrap();

    let err = node
        .wait_for_neighbors(&stream, 1, Duration::from_millis(100))
        .await
        .unwrap_err();
    match err {
        NodeError::NeighborTimeout { stream: s, wanted, have } => {
            assert_eq!(s, stream);
            assert_eq!(wanted, 1);
            assert_eq!(have, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn subscribe_requests_are_rejected_off_partition_or_when_full() {
    let cluster = Cluster::new().await;
    let config = NodeConfig {
        max_neighbors: 1,
        ..NodeConfig::default()
    };
    let node = cluster.spawn_node_with(1, config).await;
    let stream = StreamPartId::new("s", 0);
    node.subscribe(stream.clone()).await.unwrap();

    let mut first = cluster.wire_peer(11).await;
    let mut second = cluster.wire_peer(12).await;
    let peer = first.connect("node-1").await;
    second.connect("node-1").await;

    let other = ControlMessage::SubscribeRequest(SubscribeRequest {
        stream: StreamPartId::new("elsewhere", 0),
    });
    first.send(&peer, &other).await;
    assert!(matches!(
        first.next_message(WAIT).await,
        Some(ControlMessage::SubscribeResponse(SubscribeResponse { accepted: false, .. }))
    ));

    let request = ControlMessage::SubscribeRequest(SubscribeRequest {
        stream: stream.clone(),
    });
    first.send(&peer, &request).await;
    assert!(matches!(
        first.next_message(WAIT).await,
        Some(ControlMessage::SubscribeResponse(SubscribeResponse { accepted: true, .. }))
    ));
    second.send(&peer, &request).await;
    assert!(matches!(
        second.next_message(WAIT).await,
        Some(ControlMessage::SubscribeResponse(SubscribeResponse { accepted: false, .. }))
    ));
    assert_eq!(node.neighbors(&stream).await, vec![first.id()]);
}

#[tokio::test]
async fn repeated_protocol_violations_close_the_connection() {
    let cluster = Cluster::new().await;
    let node = cluster.spawn_node_with(1, NodeConfig::default()).await;
    let stream = StreamPartId::new("s", 0);
    node.subscribe(stream.clone()).await.unwrap();
    let limit = node.config().max_protocol_violations;

    let mut client = cluster.wire_peer(11).await;
    let peer = client.connect("node-1").await;
    for _ in 1..limit {
        client.send_raw(&peer, b"not a frame").await;
    }
    // Below the threshold the connection survives and keeps working.
    client
        .send(
            &peer,
            &ControlMessage::SubscribeRequest(SubscribeRequest {
                stream: stream.clone(),
            }),
        )
        .await;
    assert!(matches!(
        client.next_message(WAIT).await,
        Some(ControlMessage::SubscribeResponse(_))
    ));

    let mut events = node.events();
    client
        .send_raw(&peer, br#"{"version":99,"body":{"type":"Data"}}"#)
        .await;
    let client_id = client.id();
    expect_event(&mut events, WAIT, move |e| {
        matches!(e, NodeEvent::NodeDisconnected { peer } if *peer == client_id)
    })
    .await;
    assert!(client
        .drain()
        .contains(&TransportEvent::Disconnected(node.id())));
    assert!(node.neighbors(&stream).await.is_empty());
}

#[tokio::test]
async fn dropped_neighbor_is_removed_without_touching_the_subscription() {
    let cluster = Cluster::new().await;
    let a = cluster.spawn_node(1).await;
    let b = cluster.spawn_node(2).await;
    let stream = StreamPartId::new("s", 0);
    a.subscribe(stream.clone()).await.unwrap();
    b.subscribe(stream.clone()).await.unwrap();
    a.wait_for_neighbors(&stream, 1, WAIT).await.unwrap();

    let mut events = a.events();
    cluster.network.shutdown("node-2").await;
    let b_id = b.id();
    expect_event(&mut events, WAIT, move |e| {
        matches!(e, NodeEvent::NodeDisconnected { peer } if *peer == b_id)
    })
    .await;

    assert!(a.neighbors(&stream).await.is_empty());
    assert_eq!(a.subscription_state(&stream).await, SubscriptionState::Subscribed);
    assert!(a.connections().await.is_empty());
}

#[tokio::test]
async fn optimistic_mode_counts_neighbors_before_the_ack() {
    let cluster = Cluster::new().await;
    let a = cluster.spawn_node(1).await;
    let optimistic = NodeConfig {
        require_subscribe_ack: false,
        ..gossip_config()
    };
    let b = cluster.spawn_node_with(2, optimistic).await;
    let stream = StreamPartId::new("s", 0);

    a.subscribe(stream.clone()).await.unwrap();
    b.subscribe(stream.clone()).await.unwrap();
    assert_eq!(b.neighbors(&stream).await, vec![a.id()]);
    assert_eq!(b.subscription_state(&stream).await, SubscriptionState::Subscribed);
    a.wait_for_neighbors(&stream, 1, WAIT).await.unwrap();
}

#[tokio::test]
async fn node_reconnects_to_tracker_and_registers_again() {
    let cluster = Cluster::new().await;
    let config = NodeConfig {
        refresh_interval: Duration::from_millis(300),
        ..gossip_config()
    };
    let node = cluster.spawn_node_with(1, config).await;
    let stream = StreamPartId::new("s", 0);
    node.subscribe(stream.clone()).await.unwrap();
    assert_eq!(cluster.tracker.subscribers(&stream).await, vec![node.id()]);

    let tracker_id = cluster.tracker.contact().id;
    assert!(cluster.network.sever(&node.id(), &tracker_id).await);
    assert!(
        eventually(WAIT, || async {
            cluster.tracker.subscribers(&stream).await.is_empty()
        })
        .await,
        "tracker forgets a disconnected node"
    );
    assert!(
        eventually(WAIT, || async {
            cluster.tracker.subscribers(&stream).await == vec![node.id()]
        })
        .await,
        "node registers again after reconnecting"
    );
    assert!(cluster.network.is_linked(&node.id(), &tracker_id).await);
    assert!(node.telemetry().await.tracker_connected);
}

#[tokio::test]
async fn subscribe_without_tracker_reports_it() {
    let cluster = Cluster::new().await;
    let config = NodeConfig {
        tracker: Some("nowhere".into()),
        ..NodeConfig::default()
    };
    let node = cluster.spawn_node_with(1, config).await;
    let stream = StreamPartId::new("s", 0);

    assert!(matches!(
        node.subscribe(stream.clone()).await,
        Err(NodeError::TrackerUnavailable)
    ));
    assert_eq!(node.subscription_state(&stream).await, SubscriptionState::Subscribing);
}

#[tokio::test]
async fn shutdown_disconnects_neighbors() {
    let cluster = Cluster::new().await;
    let a = cluster.spawn_node(1).await;
    let b = cluster.spawn_node(2).await;
    let stream = StreamPartId::new("s", 0);
    a.subscribe(stream.clone()).await.unwrap();
    b.subscribe(stream.clone()).await.unwrap();
    b.wait_for_neighbors(&stream, 1, WAIT).await.unwrap();

    let mut events = b.events();
    a.shutdown().await;
    let a_id = a.id();
    expect_event(&mut events, WAIT, move |e| {
        matches!(e, NodeEvent::NodeDisconnected { peer } if *peer == a_id)
    })
    .await;
    assert!(b.neighbors(&stream).await.is_empty());
}

#[tokio::test]
async fn unsolicited_acknowledgements_are_withdrawn() {
    let cluster = Cluster::new().await;
    let config = NodeConfig {
        max_neighbors: 1,
        ..NodeConfig::default()
    };
    let node = cluster.spawn_node_with(1, config).await;
    let stream = StreamPartId::new("s", 0);
    node.subscribe(stream.clone()).await.unwrap();

    let mut first = cluster.wire_peer(11).await;
    let mut second = cluster.wire_peer(12).await;
    let peer = first.connect("node-1").await;
    second.connect("node-1").await;
    first
        .send(
            &peer,
            &ControlMessage::SubscribeRequest(SubscribeRequest {
                stream: stream.clone(),
            }),
        )
        .await;
    assert!(matches!(
        first.next_message(WAIT).await,
        Some(ControlMessage::SubscribeResponse(SubscribeResponse { accepted: true, .. }))
    ));

    // Nobody asked the second peer, and the node is full anyway.
    second
        .send(
            &peer,
            &ControlMessage::SubscribeResponse(SubscribeResponse {
                stream: stream.clone(),
                accepted: true,
            }),
        )
        .await;
    match second.next_message(WAIT).await {
        Some(ControlMessage::UnsubscribeRequest(req)) => assert_eq!(req.stream, stream),
        other => panic!("expected an unsubscribe, got {other:?}"),
    }
    assert_eq!(node.neighbors(&stream).await, vec![first.id()]);
}

#[tokio::test]
async fn unanswered_subscribe_requests_expire() {
    let cluster = Cluster::new().await;
    let stream = StreamPartId::new("s", 0);
    let mut silent = cluster.wire_peer(11).await;
    let tracker = silent.connect(TRACKER_ADDR).await;
    silent
        .send(
            &tracker,
            &ControlMessage::TrackerRegister(TrackerRegister {
                contact: node_contact(11),
                stream: stream.clone(),
            }),
        )
        .await;
    let silent_id = silent.id();
    assert!(
        eventually(WAIT, || async {
            cluster.tracker.subscribers(&stream).await == vec![silent_id]
        })
        .await
    );

    let config = NodeConfig {
        subscribe_timeout: Duration::from_millis(100),
        refresh_interval: Duration::from_millis(50),
        ..gossip_config()
    };
    let node = cluster.spawn_node_with(1, config).await;
    node.subscribe(stream.clone()).await.unwrap();
    assert!(matches!(
        silent.next_message(WAIT).await,
        Some(ControlMessage::SubscribeRequest(_))
    ));

    let node_id = node.id();
    let dropped = timeout(WAIT, async {
        while let Some(event) = silent.events.recv().await {
            if event == TransportEvent::Disconnected(node_id) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(dropped, Ok(true));
    assert!(node.neighbors(&stream).await.is_empty());
    assert_eq!(node.subscription_state(&stream).await, SubscriptionState::Subscribing);
}

#[tokio::test]
async fn data_from_outside_the_partition_is_ignored() {
    let cluster = Cluster::new().await;
    let node = cluster.spawn_node_with(1, NodeConfig::default()).await;
    let stream = StreamPartId::new("s", 0);
    node.subscribe(stream.clone()).await.unwrap();
    let mut delivered = node.message_listener();

    let mut stranger = cluster.wire_peer(11).await;
    let peer = stranger.connect("node-1").await;
    let mut chain = MessageChain::new(stream.clone(), &stranger.id());
    let data = ControlMessage::Data(chain.next(1, b"early".to_vec()));
    stranger.send(&peer, &data).await;

    stranger
        .send(
            &peer,
            &ControlMessage::SubscribeRequest(SubscribeRequest {
                stream: stream.clone(),
            }),
        )
        .await;
    assert!(matches!(
        stranger.next_message(WAIT).await,
        Some(ControlMessage::SubscribeResponse(SubscribeResponse { accepted: true, .. }))
    ));
    assert!(delivered.try_recv().is_err());

    // The earlier copy was not remembered, so it counts once it is legitimate.
    stranger.send(&peer, &data).await;
    let got = timeout(WAIT, delivered.recv()).await.unwrap().unwrap();
    assert_eq!(got.content, b"early");
}

#[tokio::test]
async fn dropping_the_last_handle_stops_the_node() {
    let cluster = Cluster::new().await;
    let node = cluster.spawn_node_with(1, NodeConfig::default()).await;
    node.subscribe(StreamPartId::new("s", 0)).await.unwrap();
    let mut events = node.events();
    drop(node);

    let closed = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Err(broadcast::error::RecvError::Closed) => return,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "node state outlived its last handle");
}
