pub(crate) mod counter_app;

pub(crate) mod logging;

pub(crate) mod mem_ledger;

pub(crate) mod network;

pub(crate) mod node;

use std::thread;
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use pbft_rs::client::ClientProxy;
use pbft_rs::types::basic::{PrincipalId, RequestId};
use pbft_rs::types::principals::{Principal, Role};

use self::network::NetworkStub;

/// Build the principal set for a group where ids `0..num_replicas` are replicas and the rest are
/// clients, one principal per keypair.
pub(crate) fn make_principals(keypairs: &[SigningKey], num_replicas: u32) -> Vec<Principal> {
    keypairs
        .iter()
        .enumerate()
        .map(|(id, keypair)| Principal {
            id: PrincipalId::new(id as u32),
            role: if (id as u32) < num_replicas {
                Role::Replica
            } else {
                Role::Client
            },
            verifying_key: keypair.verifying_key(),
            address: None,
        })
        .collect()
}

/// Poll `condition` until it holds, panicking after a generous deadline so a wedged cluster fails
/// the test instead of hanging it.
pub(crate) fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Drive the client proxy until the given request's result arrives.
pub(crate) fn await_result(client: &mut ClientProxy<NetworkStub>, request_id: RequestId) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        for (id, payload) in client.poll() {
            if id == request_id {
                return payload;
            }
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for the result of request {}", request_id);
        }
        thread::sleep(Duration::from_millis(50));
    }
}
