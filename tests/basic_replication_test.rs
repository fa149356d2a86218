//! Fault-free replication across a group of 4 replicas (f = 1): a client's requests execute on
//! every replica in order, the client accepts a result once f + 1 replicas agree on it, and
//! retransmitted requests execute exactly once.
//!
//! The replicas use a mock [`NetworkStub`](common::network::NetworkStub), an in-memory ledger, and
//! a counter app; channels simulate all communication.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use log::LevelFilter;
use rand_core::OsRng;

use pbft_rs::client::ClientProxy;
use pbft_rs::configuration::Configuration;
use pbft_rs::messages::Message;
use pbft_rs::networking::network::Network;
use pbft_rs::requests::messages::{Request, RequestMessage};
use pbft_rs::types::basic::PrincipalId;
use pbft_rs::types::keypair::Keypair;

mod common;

use common::{
    await_result, logging::setup_logger, make_principals, network::mock_network, node::Node,
    wait_until,
};

#[test]
fn basic_replication_test() {
    setup_logger(LevelFilter::Info);

    // 1. Initialize test components: 4 replicas, 1 client (id 4), connected by a mock network.
    let mut csprng = OsRng {};
    let keypairs: Vec<SigningKey> = (0..5).map(|_| SigningKey::generate(&mut csprng)).collect();
    let principals = make_principals(&keypairs, 4);
    let network_stubs = mock_network(4, 5);

    let configuration = Configuration::builder()
        .num_replicas(4)
        .max_faulty(1)
        .log_size(8)
        .checkpoint_interval(4)
        .view_timeout(Duration::from_secs(5))
        .status_interval(Duration::from_millis(200))
        .log_events(true)
        .build();

    let nodes: Vec<Node> = (0..4)
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

    // 2. Submit a request and collect f + 1 matching replies.
    log::debug!("Submitting an add-5 request.");
    let first_id = client.submit(5u64.to_le_bytes().to_vec());
    let result = await_result(&mut client, first_id);
    assert_eq!(result, 5u64.to_le_bytes().to_vec());

    // 3. Every replica executes it and appends the batch to its ledger.
    wait_until("every replica to execute the first request", || {
        nodes.iter().all(|node| node.counter() == 5)
    });
    wait_until("every replica to append the first batch", || {
        nodes.iter().all(|node| node.ledger_len() >= 1)
    });

    // 4. A retransmission of the exact same request executes zero additional times. The raw
    //    request is re-broadcast to all replicas, bypassing the proxy's own deduplication.
    log::debug!("Re-broadcasting the first request verbatim.");
    let duplicate = Request::new(
        &Keypair::new(keypairs[4].clone()),
        PrincipalId::new(4),
        first_id,
        5u64.to_le_bytes().to_vec(),
    );
    let mut injector = network_stubs[4].clone();
    injector.broadcast(Message::from(RequestMessage::Request(duplicate)));
    thread::sleep(Duration::from_secs(1));
    assert!(nodes.iter().all(|node| node.counter() == 5));

    // 5. A second request still goes through (and observes the first's effect exactly once).
    log::debug!("Submitting an add-2 request.");
    let second_id = client.submit(2u64.to_le_bytes().to_vec());
    let result = await_result(&mut client, second_id);
    assert_eq!(result, 7u64.to_le_bytes().to_vec());

    wait_until("every replica to execute the second request", || {
        nodes.iter().all(|node| node.counter() == 7)
    });

    // 6. Nobody had a reason to leave the initial view.
    assert!(nodes.iter().all(|node| node.views_entered().is_empty()));
}
