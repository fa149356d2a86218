//! Recovery from message loss: the primary's first Pre-Prepare never reaches one backup, so that
//! backup buffers the Prepares and Commits it does receive and obtains the Pre-Prepare through the
//! status exchange, after which it executes like everyone else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use log::LevelFilter;
use rand_core::OsRng;

use pbft_rs::client::ClientProxy;
use pbft_rs::configuration::Configuration;
use pbft_rs::messages::{Message, ProtocolMessage};
use pbft_rs::networking::network::Network;
use pbft_rs::ordering::messages::OrderingMessage;
use pbft_rs::types::basic::PrincipalId;
use pbft_rs::types::keypair::Keypair;
use pbft_rs::types::principals::Principal;

mod common;

use common::{
    await_result, logging::setup_logger, make_principals, network::mock_network, node::Node,
    wait_until,
};

/// Wraps the primary's network stub and swallows its first broadcast Pre-Prepare on the way to one
/// victim replica. Everything else passes through.
#[derive(Clone)]
struct PrePrepareDroppingStub {
    inner: common::network::NetworkStub,
    victim: PrincipalId,
    drops_left: Arc<Mutex<u32>>,
}

impl Network for PrePrepareDroppingStub {
    fn init_principals(&mut self, principals: Vec<Principal>) {
        self.inner.init_principals(principals)
    }

    fn add_principal(&mut self, principal: Principal) {
        self.inner.add_principal(principal)
    }

    fn broadcast(&mut self, message: Message) {
        let is_pre_prepare = matches!(
            message,
            Message::ProtocolMessage(ProtocolMessage::OrderingMessage(
                OrderingMessage::PrePrepare(_)
            ))
        );
        if is_pre_prepare {
            let mut drops_left = self.drops_left.lock().unwrap();
            if *drops_left > 0 {
                *drops_left -= 1;
                // Deliver to everyone except the victim; the status exchange must repair this.
                let victim = self.victim;
                drop(drops_left);
                for peer in (0..4).map(PrincipalId::new) {
                    if peer != victim {
                        self.inner.send(peer, message.clone());
                    }
                }
                return;
            }
        }
        self.inner.broadcast(message)
    }

    fn send(&mut self, peer: PrincipalId, message: Message) {
        self.inner.send(peer, message)
    }

    fn recv(&mut self) -> Option<(PrincipalId, Message)> {
        self.inner.recv()
    }
}

#[test]
fn dropped_pre_prepare_recovers_via_status_test() {
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
        .view_timeout(Duration::from_secs(10))
        .status_interval(Duration::from_millis(200))
        .log_events(true)
        .build();

    // The primary (replica 0) drops its first Pre-Prepare toward replica 3.
    let lossy_primary_stub = PrePrepareDroppingStub {
        inner: network_stubs[0].clone(),
        victim: PrincipalId::new(3),
        drops_left: Arc::new(Mutex::new(1)),
    };

    let mut nodes = Vec::new();
    nodes.push(Node::new(
        configuration.clone(),
        keypairs[0].clone(),
        principals.clone(),
        lossy_primary_stub,
    ));
    for id in 1..4 {
        nodes.push(Node::new(
            configuration.clone(),
            keypairs[id].clone(),
            principals.clone(),
            network_stubs[id].clone(),
        ));
    }

    let mut client = ClientProxy::new(
        &configuration,
        Keypair::new(keypairs[4].clone()),
        principals.clone(),
        HashMap::new(),
        network_stubs[4].clone(),
    );

    // The three replicas that saw the Pre-Prepare commit and reply on their own (f + 1 = 2
    // matching replies is enough for the client), with no view change required.
    let request_id = client.submit(9u64.to_le_bytes().to_vec());
    let result = await_result(&mut client, request_id);
    assert_eq!(result, 9u64.to_le_bytes().to_vec());

    // Replica 3, which never saw the Pre-Prepare directly, recovers it through a peer's status
    // retransmission and catches up in bounded time.
    wait_until("the victim replica to execute the request", || {
        nodes.iter().all(|node| node.counter() == 9)
    });
    assert!(nodes.iter().all(|node| node.views_entered().is_empty()));
}
