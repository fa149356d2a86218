//! A "mock" (totally local) network for passing around PBFT-rs messages.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use pbft_rs::messages::Message;
use pbft_rs::networking::network::Network;
use pbft_rs::types::basic::PrincipalId;
use pbft_rs::types::principals::Principal;

/// A network stub that passes messages to and from participants using channels.
///
/// ## Limitations
///
/// `NetworkStub`'s implementations of the [`Network`] trait's `init_principals` and
/// `add_principal` methods are no-ops. As a consequence, the set of peers reachable from a given
/// `NetworkStub` is fixed on construction by [`mock_network`]. Tests that admit new principals
/// must "plan ahead" and create the mock network with extra ids.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_id: PrincipalId,
    num_replicas: u32,
    all_peers: HashMap<PrincipalId, Sender<(PrincipalId, Message)>>,
    inbox: Arc<Mutex<Receiver<(PrincipalId, Message)>>>,
}

impl Network for NetworkStub {
    fn init_principals(&mut self, _: Vec<Principal>) {}

    fn add_principal(&mut self, _: Principal) {}

    fn broadcast(&mut self, message: Message) {
        // To all replicas except the broadcaster itself: self-delivery is the library's loopback
        // path, not the network's.
        for (peer, sender) in &self.all_peers {
            if peer.int() < self.num_replicas && *peer != self.my_id {
                let _ = sender.send((self.my_id, message.clone()));
            }
        }
    }

    fn send(&mut self, peer: PrincipalId, message: Message) {
        if let Some(sender) = self.all_peers.get(&peer) {
            let _ = sender.send((self.my_id, message));
        }
    }

    fn recv(&mut self) -> Option<(PrincipalId, Message)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(origin_and_message) => Some(origin_and_message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create one connected `NetworkStub` per id in `0..num_principals`. The first `num_replicas` ids
/// are the replicas (broadcast targets); the rest are clients.
pub(crate) fn mock_network(num_replicas: u32, num_principals: u32) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let id_and_inboxes: Vec<(PrincipalId, Receiver<(PrincipalId, Message)>)> = (0..num_principals)
        .map(|id| {
            let id = PrincipalId::new(id);
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(id, sender);
            (id, receiver)
        })
        .collect();

    id_and_inboxes
        .into_iter()
        .map(|(my_id, inbox)| NetworkStub {
            my_id,
            num_replicas,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
