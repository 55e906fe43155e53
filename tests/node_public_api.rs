//! Integration tests for the Node public API.
//!
//! Every test runs real nodes over QUIC on localhost, so the caller identity
//! seen by the protocol logic is the one proven in the TLS handshake.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use profilemesh::{
    ConnectionState, Contact, Keypair, Node, NodeConfig, OwnerCommand, PeerRequest,
    ProfileError, ProfileEvent, ProfileUpdate, RpcRequest, RpcResponse, admin_client,
};
use tokio::time::timeout;

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(31000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_addr() -> String {
    format!("127.0.0.1:{}", next_port())
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

fn test_config() -> NodeConfig {
    NodeConfig::default().with_rpc_timeout(SHORT_RPC_TIMEOUT)
}

async fn bind_node() -> Node {
    Node::bind(&test_addr(), test_config()).await.expect("bind failed")
}

async fn connected_pair() -> (Node, Node) {
    let a = bind_node().await;
    let b = bind_node().await;
    a.send_connection_request(b.contact().clone())
        .await
        .expect("request failed");
    let outcome = b
        .accept_connection_request(a.identity())
        .await
        .expect("accept failed");
    assert!(outcome.confirmed, "requester should confirm over QUIC");
    (a, b)
}

fn protocol_error(err: &anyhow::Error) -> Option<&ProfileError> {
    err.downcast_ref::<ProfileError>()
}

#[tokio::test]
async fn node_bind_and_identity() {
    let node = bind_node().await;

    assert_eq!(node.keypair().identity(), node.identity());
    assert_eq!(node.owner(), node.identity());
    assert_eq!(node.contact().identity, node.identity());

    let local_addr = node.local_addr().expect("local_addr failed");
    assert!(local_addr.port() > 0, "port should be positive");
    assert_eq!(node.contact().primary_addr(), Some(local_addr.to_string().as_str()));

    node.shutdown().await;
}

#[tokio::test]
async fn handshake_over_quic_connects_both_sides() {
    let result = timeout(TEST_TIMEOUT, async {
        let a = bind_node().await;
        let b = bind_node().await;

        a.send_connection_request(b.contact().clone())
            .await
            .expect("request failed");
        assert_eq!(
            a.connection_state(b.identity()).await.unwrap(),
            ConnectionState::OutgoingPending
        );
        assert_eq!(b.pending_requests().await.unwrap(), vec![a.identity()]);

        let outcome = b.accept_connection_request(a.identity()).await.expect("accept");
        assert!(outcome.confirmed);

        assert!(a.check_connection(b.identity()).await.unwrap());
        assert!(b.check_connection(a.identity()).await.unwrap());
        assert_eq!(a.connection_count().await.unwrap(), 1);
        assert_eq!(b.connection_count().await.unwrap(), 1);
        assert_eq!(a.connections().await.unwrap(), vec![b.identity()]);

        let err = a
            .send_connection_request(b.contact().clone())
            .await
            .expect_err("second request should fail");
        assert_eq!(err, ProfileError::AlreadyConnected(b.identity()));

        a.shutdown().await;
        b.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "handshake timed out");
}

#[tokio::test]
async fn unreachable_target_rolls_back_request() {
    let result = timeout(TEST_TIMEOUT, async {
        let a = bind_node().await;
        let ghost = Contact::single(Keypair::generate().identity(), test_addr());

        let err = a
            .send_connection_request(ghost.clone())
            .await
            .expect_err("delivery should fail");
        assert!(matches!(err, ProfileError::DeliveryFailed { peer, .. } if peer == ghost.identity));

        assert_eq!(
            a.connection_state(ghost.identity).await.unwrap(),
            ConnectionState::None
        );
        a.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "rollback test timed out");
}

#[tokio::test]
async fn endorsements_aggregate_across_nodes() {
    let result = timeout(TEST_TIMEOUT, async {
        let target = bind_node().await;
        target
            .update_skills(vec!["Rust".into(), "Go".into()])
            .await
            .expect("skills");

        let mut endorsers = Vec::new();
        for rating in [10u8, 7, 4] {
            let endorser = bind_node().await;
            endorser
                .send_connection_request(target.contact().clone())
                .await
                .expect("request");
            target
                .accept_connection_request(endorser.identity())
                .await
                .expect("accept");
            endorser
                .endorse_skill(target.identity(), "Rust", rating, "worked together")
                .await
                .expect("endorse");
            assert!(endorser.has_given_endorsement(target.identity(), "Rust").await.unwrap());
            endorsers.push(endorser);
        }

        let summary = target.endorsement_summary().await.unwrap();
        assert_eq!(summary.skills, vec!["Rust".to_string()]);
        assert_eq!(summary.counts, vec![3]);
        assert_eq!(summary.average_ratings, vec![700]);
        assert_eq!(summary.total_skills, 1);
        assert_eq!(target.endorsement_count().await.unwrap(), 3);

        let remote = endorsers[0].fetch_summary(target.contact()).await.expect("fetch");
        assert_eq!(remote, summary);

        let records = endorsers[0]
            .fetch_skill_endorsements(target.contact(), "Rust")
            .await
            .expect("fetch records");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].endorser, endorsers[0].identity());

        let err = endorsers[0]
            .endorse_skill(target.identity(), "Rust", 9, "")
            .await
            .expect_err("second endorsement should fail");
        assert!(matches!(err, ProfileError::AlreadyEndorsed { .. }));

        for endorser in &endorsers {
            endorser.shutdown().await;
        }
        target.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "endorsement test timed out");
}

#[tokio::test]
async fn endorsement_requires_connection() {
    let a = bind_node().await;
    let b = bind_node().await;

    let err = a
        .endorse_skill(b.identity(), "Rust", 8, "")
        .await
        .expect_err("unconnected endorsement should fail");
    assert_eq!(err, ProfileError::NotConnected(b.identity()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn events_follow_committed_transitions() {
    let result = timeout(TEST_TIMEOUT, async {
        let a = bind_node().await;
        let b = bind_node().await;
        let mut a_events = a.events().await.expect("events");
        let mut b_events = b.events().await.expect("events");
        assert!(a.events().await.is_err(), "receiver can only be taken once");

        b.add_skill("Rust").await.expect("skill");
        assert_eq!(
            b_events.recv().await,
            Some(ProfileEvent::ProfileUpdated { owner: b.identity() })
        );

        a.send_connection_request(b.contact().clone()).await.expect("request");
        assert_eq!(
            a_events.recv().await,
            Some(ProfileEvent::ConnectionRequested {
                from: a.identity(),
                to: b.identity()
            })
        );

        b.accept_connection_request(a.identity()).await.expect("accept");
        assert_eq!(
            b_events.recv().await,
            Some(ProfileEvent::ConnectionAccepted {
                requester: a.identity(),
                accepter: b.identity()
            })
        );

        a.endorse_skill(b.identity(), "Rust", 9, "").await.expect("endorse");
        assert_eq!(
            b_events.recv().await,
            Some(ProfileEvent::SkillEndorsed {
                endorser: a.identity(),
                endorsed: b.identity(),
                skill: "Rust".into(),
                rating: 9,
            })
        );

        a.shutdown().await;
        b.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "event test timed out");
}

#[tokio::test]
async fn private_profile_hidden_from_other_nodes() {
    let (a, b) = connected_pair().await;

    b.update_profile(ProfileUpdate {
        name: "Ada".into(),
        bio: "engines".into(),
        ..ProfileUpdate::default()
    })
    .await
    .expect("update");

    let profile = a.fetch_profile(b.contact()).await.expect("public profile");
    assert_eq!(profile.name, "Ada");

    b.set_visibility(false).await.expect("visibility");
    let err = a.fetch_profile(b.contact()).await.expect_err("hidden profile");
    assert_eq!(protocol_error(&err), Some(&ProfileError::NotPublic));

    assert_eq!(b.profile().await.expect("own view").name, "Ada");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn remote_owner_commands_are_authorized_by_tls_identity() {
    let result = timeout(TEST_TIMEOUT, async {
        let owner = Keypair::generate();
        let node = Node::bind(&test_addr(), test_config().with_owner(owner.identity()))
            .await
            .expect("bind");
        assert_eq!(node.owner(), owner.identity());

        // The node's own key is no longer the owner.
        let err = node.add_skill("Rust").await.expect_err("node key is not owner");
        assert!(matches!(err, ProfileError::Unauthorized { .. }));

        let admin = admin_client(&owner, SHORT_RPC_TIMEOUT).expect("client");
        let response = admin
            .owner_command(node.contact(), OwnerCommand::UpdateSkills(vec!["Rust".into()]))
            .await
            .expect("owner command");
        assert!(matches!(response, RpcResponse::Ack));
        assert_eq!(node.skill_count().await.unwrap(), 1);

        let stranger = Keypair::generate();
        let intruder = admin_client(&stranger, SHORT_RPC_TIMEOUT).expect("client");
        let err = intruder
            .owner_command(node.contact(), OwnerCommand::AddSkill("Go".into()))
            .await
            .expect_err("stranger must be refused");
        assert_eq!(
            protocol_error(&err),
            Some(&ProfileError::Unauthorized { caller: stranger.identity() })
        );
        assert_eq!(node.skill_count().await.unwrap(), 1);

        admin.quit().await;
        intruder.quit().await;
        node.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "owner command test timed out");
}

#[tokio::test]
async fn remote_owner_drives_handshake() {
    let result = timeout(TEST_TIMEOUT, async {
        let owner = Keypair::generate();
        let a = Node::bind(&test_addr(), test_config().with_owner(owner.identity()))
            .await
            .expect("bind");
        let b = bind_node().await;

        let admin = admin_client(&owner, SHORT_RPC_TIMEOUT).expect("client");
        admin
            .owner_command(a.contact(), OwnerCommand::Connect { remote: b.contact().clone() })
            .await
            .expect("connect");
        assert_eq!(b.pending_requests().await.unwrap(), vec![a.identity()]);
        match admin
            .owner_command(a.contact(), OwnerCommand::OutgoingRequests)
            .await
            .expect("outgoing")
        {
            RpcResponse::Identities(ids) => assert_eq!(ids, vec![b.identity()]),
            other => panic!("unexpected response: {:?}", other),
        }

        b.accept_connection_request(a.identity()).await.expect("accept");
        let response = admin
            .owner_command(a.contact(), OwnerCommand::Connections)
            .await
            .expect("connections");
        match response {
            RpcResponse::Identities(ids) => assert_eq!(ids, vec![b.identity()]),
            other => panic!("unexpected response: {:?}", other),
        }

        admin.quit().await;
        a.shutdown().await;
        b.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "remote handshake timed out");
}

#[tokio::test]
async fn forged_sender_is_refused() {
    let result = timeout(TEST_TIMEOUT, async {
        let (a, b) = connected_pair().await;
        b.add_skill("Rust").await.expect("skill");

        // A stranger claims to be `a`; the TLS identity says otherwise.
        let stranger = Keypair::generate();
        let client = admin_client(&stranger, SHORT_RPC_TIMEOUT).expect("client");
        let forged = RpcRequest::Peer(PeerRequest::Endorsement {
            from: a.contact().clone(),
            delivery: profilemesh::EndorsementDelivery {
                skill: "Rust".into(),
                rating: 10,
                comment: "trust me".into(),
            },
        });
        let response = client.rpc_raw(b.contact(), forged).await.expect("rpc");
        assert!(matches!(response, RpcResponse::Error { .. }));
        assert!(b.skill_endorsements("Rust").await.unwrap().is_empty());

        client.quit().await;
        a.shutdown().await;
        b.shutdown().await;
    })
    .await;
    assert!(result.is_ok(), "forgery test timed out");
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config().with_data_dir(dir.path());

    let identity = {
        let node = Node::bind(&test_addr(), config.clone()).await.expect("bind");
        node.update_skills(vec!["Rust".into(), "Zig".into()])
            .await
            .expect("skills");
        let identity = node.identity();
        node.shutdown().await;
        identity
    };

    let node = Node::bind(&test_addr(), config).await.expect("rebind");
    assert_eq!(node.identity(), identity);
    let profile = node.profile().await.expect("profile");
    assert_eq!(profile.skills, vec!["Rust".to_string(), "Zig".to_string()]);
    node.shutdown().await;
}
