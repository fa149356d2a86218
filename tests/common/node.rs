//! A test harness wrapping one replica together with the handles the tests observe it through.

use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use pbft_rs::configuration::Configuration;
use pbft_rs::networking::network::Network;
use pbft_rs::replica::{Replica, ReplicaSpec};
use pbft_rs::types::basic::{SeqNumber, ViewNumber};
use pbft_rs::types::keypair::Keypair;
use pbft_rs::types::principals::Principal;

use crate::common::{counter_app::CounterApp, mem_ledger::MemLedger};

/// Things the Nodes have in common: the principal set and the configuration. Things they differ
/// in: the keypair, the network stub, and their (initially identical) app and ledger instances.
pub(crate) struct Node {
    app: CounterApp,
    ledger: MemLedger,
    stabilized: Arc<Mutex<Vec<SeqNumber>>>,
    views_entered: Arc<Mutex<Vec<ViewNumber>>>,
    _replica: Replica,
}

impl Node {
    pub(crate) fn new(
        configuration: Configuration,
        keypair: SigningKey,
        principals: Vec<Principal>,
        network: impl Network + 'static,
    ) -> Node {
        let app = CounterApp::new();
        let ledger = MemLedger::new();
        let stabilized = Arc::new(Mutex::new(Vec::new()));
        let views_entered = Arc::new(Mutex::new(Vec::new()));

        let stabilized_handle = stabilized.clone();
        let views_entered_handle = views_entered.clone();

        let replica = ReplicaSpec::new(
            configuration,
            Keypair::new(keypair),
            principals,
            app.clone(),
            ledger.clone(),
            network,
        )
        .on_stabilize_checkpoint(move |event| {
            stabilized_handle.lock().unwrap().push(event.seqno)
        })
        .on_enter_view(move |event| views_entered_handle.lock().unwrap().push(event.view))
        .start();

        Node {
            app,
            ledger,
            stabilized,
            views_entered,
            _replica: replica,
        }
    }

    pub(crate) fn counter(&self) -> u64 {
        self.app.counter()
    }

    pub(crate) fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    pub(crate) fn stabilized_checkpoints(&self) -> Vec<SeqNumber> {
        self.stabilized.lock().unwrap().clone()
    }

    pub(crate) fn views_entered(&self) -> Vec<ViewNumber> {
        self.views_entered.lock().unwrap().clone()
    }
}
