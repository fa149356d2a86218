//! Liveness across a silent primary: the primary of view 0 is never started, so the backups' view
//! timers expire, a view change installs view 1, and the request the dead primary sat on executes
//! under the new one.

use std::collections::HashMap;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use log::LevelFilter;
use rand_core::OsRng;

use pbft_rs::client::ClientProxy;
use pbft_rs::configuration::Configuration;
use pbft_rs::types::basic::ViewNumber;
use pbft_rs::types::keypair::Keypair;

mod common;

use common::{
    await_result, logging::setup_logger, make_principals, network::mock_network, node::Node,
    wait_until,
};

#[test]
fn silent_primary_view_change_test() {
    setup_logger(LevelFilter::Info);

    let mut csprng = OsRng {};
    let keypairs: Vec<SigningKey> = (0..5).map(|_| SigningKey::generate(&mut csprng)).collect();
    let principals = make_principals(&keypairs, 4);
    let network_stubs = mock_network(4, 5);

    let configuration = Configuration::builder()
        .num_replicas(4)
        .max_faulty(1)
        .log_size(8)
        .checkpoint_interval(4)
        .view_timeout(Duration::from_millis(500))
        .status_interval(Duration::from_millis(100))
        .log_events(true)
        .build();

    // Replica 0, the primary of view 0, is deliberately never started. Its network stub exists,
    // so messages to it vanish into an unread inbox, exactly like a crashed process.
    let nodes: Vec<Node> = (1..4)
        .map(|id| {
            Node::new(
                configuration.clone(),
                keypairs[id].clone(),
                principals.clone(),
                network_stubs[id].clone(),
            )
        })
        .collect();

    let mut client = ClientProxy::new(
        &configuration,
        Keypair::new(keypairs[4].clone()),
        principals.clone(),
        HashMap::new(),
        network_stubs[4].clone(),
    );

    // The proxy initially believes replica 0 is the primary; the unicast goes nowhere, the
    // retransmission multicast reaches the backups, their view timers expire, and view 1 takes
    // over.
    let request_id = client.submit(7u64.to_le_bytes().to_vec());
    let result = await_result(&mut client, request_id);
    assert_eq!(result, 7u64.to_le_bytes().to_vec());

    wait_until("the three live replicas to execute the request", || {
        nodes.iter().all(|node| node.counter() == 7)
    });

    // Every live replica installed some view beyond 0.
    assert!(nodes.iter().all(|node| {
        node.views_entered()
            .iter()
            .any(|view| *view >= ViewNumber::new(1))
    }));

    // Liveness persists in the new view: a second request executes without further view changes
    // being necessary.
    let request_id = client.submit(3u64.to_le_bytes().to_vec());
    let result = await_result(&mut client, request_id);
    assert_eq!(result, 10u64.to_le_bytes().to_vec());
    wait_until("the second request to execute everywhere", || {
        nodes.iter().all(|node| node.counter() == 10)
    });
}
