/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that build ([`ReplicaSpec`]) and start ([`ReplicaSpec::start`]) a replica, as well as
//! [the type](Replica) which keeps the replica alive.
//!
//! PBFT-rs works to totally order client requests across multiple processes in the presence of
//! Byzantine faults. In our terminology, these processes are called 'replicas'; a group of n = 3f
//! + 1 replicas tolerates f of them being faulty. Each participant, replica or client, is
//! uniquely identified by a [`PrincipalId`] and an ed25519 public key, registered in the group's
//! [`PrincipalRegistry`](crate::types::principals::PrincipalRegistry).
//!
//! ## Threads
//!
//! Starting a replica spawns four threads:
//! 1. The **poller**, which drains the user-provided [`Network`] and distributes messages,
//! 2. The **algorithm** thread, the only mutator of ordering state,
//! 3. The **log sync server**, which serves catch-up requests from the shared ledger, and
//! 4. The **event bus** (only when handlers are registered or event logging is on).
//!
//! Dropping the [`Replica`] shuts them down in reverse dependency order.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::algorithm::start_algorithm;
use crate::app::App;
use crate::checkpointing::types::CheckpointCertificate;
use crate::configuration::Configuration;
use crate::event_bus::{start_event_bus, EventHandlers, UserHandlers};
use crate::events::*;
use crate::ledger::Ledger;
use crate::log_sync::server::start_log_sync_server;
use crate::networking::network::Network;
use crate::networking::receiving::start_polling;
use crate::types::basic::{PrincipalId, SeqNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::{Principal, PrincipalRegistry, SessionKey};

/// Everything needed to start a replica. Build one with [`ReplicaSpec::new`], chain the optional
/// setters, then call [`start`](ReplicaSpec::start).
pub struct ReplicaSpec<N: Network + 'static, A: App, L: Ledger> {
    configuration: Configuration,
    keypair: Keypair,
    principals: Vec<Principal>,
    session_keys: HashMap<PrincipalId, SessionKey>,
    initial_stable_checkpoint: Option<CheckpointCertificate>,
    app: A,
    ledger: L,
    network: N,
    handlers: UserHandlers,
}

impl<N: Network + 'static, A: App, L: Ledger> ReplicaSpec<N, A, L> {
    /// Create a spec with the required components. `principals` must contain every replica and
    /// every initially known client, including this replica itself (identified by `keypair`'s
    /// public key).
    pub fn new(
        configuration: Configuration,
        keypair: Keypair,
        principals: Vec<Principal>,
        app: A,
        ledger: L,
        network: N,
    ) -> ReplicaSpec<N, A, L> {
        ReplicaSpec {
            configuration,
            keypair,
            principals,
            session_keys: HashMap::new(),
            initial_stable_checkpoint: None,
            app,
            ledger,
            network,
            handlers: UserHandlers::default(),
        }
    }

    /// Provide the pairwise session keys for the
    /// [`SessionMacs`](crate::types::principals::AuthenticationScheme::SessionMacs)
    /// authentication scheme.
    pub fn session_keys(mut self, session_keys: HashMap<PrincipalId, SessionKey>) -> Self {
        self.session_keys = session_keys;
        self
    }

    /// Resume from a persisted stable checkpoint instead of the genesis state. Required whenever
    /// the host state machine resumes at a version above zero.
    pub fn initial_stable_checkpoint(mut self, certificate: CheckpointCertificate) -> Self {
        self.initial_stable_checkpoint = Some(certificate);
        self
    }

    pub fn on_pre_prepare(mut self, handler: impl Fn(&PrePrepareEvent) + Send + 'static) -> Self {
        self.handlers.on_pre_prepare = Some(Box::new(handler));
        self
    }

    pub fn on_prepare(mut self, handler: impl Fn(&PrepareEvent) + Send + 'static) -> Self {
        self.handlers.on_prepare = Some(Box::new(handler));
        self
    }

    pub fn on_commit(mut self, handler: impl Fn(&CommitEvent) + Send + 'static) -> Self {
        self.handlers.on_commit = Some(Box::new(handler));
        self
    }

    pub fn on_checkpoint(mut self, handler: impl Fn(&CheckpointEvent) + Send + 'static) -> Self {
        self.handlers.on_checkpoint = Some(Box::new(handler));
        self
    }

    pub fn on_view_change(mut self, handler: impl Fn(&ViewChangeEvent) + Send + 'static) -> Self {
        self.handlers.on_view_change = Some(Box::new(handler));
        self
    }

    pub fn on_new_view(mut self, handler: impl Fn(&NewViewEvent) + Send + 'static) -> Self {
        self.handlers.on_new_view = Some(Box::new(handler));
        self
    }

    pub fn on_receive_request(mut self, handler: impl Fn(&ReceiveRequestEvent) + Send + 'static) -> Self {
        self.handlers.on_receive_request = Some(Box::new(handler));
        self
    }

    pub fn on_receive_pre_prepare(mut self, handler: impl Fn(&ReceivePrePrepareEvent) + Send + 'static) -> Self {
        self.handlers.on_receive_pre_prepare = Some(Box::new(handler));
        self
    }

    pub fn on_receive_prepare(mut self, handler: impl Fn(&ReceivePrepareEvent) + Send + 'static) -> Self {
        self.handlers.on_receive_prepare = Some(Box::new(handler));
        self
    }

    pub fn on_receive_commit(mut self, handler: impl Fn(&ReceiveCommitEvent) + Send + 'static) -> Self {
        self.handlers.on_receive_commit = Some(Box::new(handler));
        self
    }

    pub fn on_receive_checkpoint(mut self, handler: impl Fn(&ReceiveCheckpointEvent) + Send + 'static) -> Self {
        self.handlers.on_receive_checkpoint = Some(Box::new(handler));
        self
    }

    pub fn on_receive_view_change(mut self, handler: impl Fn(&ReceiveViewChangeEvent) + Send + 'static) -> Self {
        self.handlers.on_receive_view_change = Some(Box::new(handler));
        self
    }

    pub fn on_receive_new_view(mut self, handler: impl Fn(&ReceiveNewViewEvent) + Send + 'static) -> Self {
        self.handlers.on_receive_new_view = Some(Box::new(handler));
        self
    }

    pub fn on_execute(mut self, handler: impl Fn(&ExecuteEvent) + Send + 'static) -> Self {
        self.handlers.on_execute = Some(Box::new(handler));
        self
    }

    pub fn on_stabilize_checkpoint(mut self, handler: impl Fn(&StabilizeCheckpointEvent) + Send + 'static) -> Self {
        self.handlers.on_stabilize_checkpoint = Some(Box::new(handler));
        self
    }

    pub fn on_enter_view(mut self, handler: impl Fn(&EnterViewEvent) + Send + 'static) -> Self {
        self.handlers.on_enter_view = Some(Box::new(handler));
        self
    }

    pub fn on_view_timeout(mut self, handler: impl Fn(&ViewTimeoutEvent) + Send + 'static) -> Self {
        self.handlers.on_view_timeout = Some(Box::new(handler));
        self
    }

    pub fn on_start_catch_up(mut self, handler: impl Fn(&StartCatchUpEvent) + Send + 'static) -> Self {
        self.handlers.on_start_catch_up = Some(Box::new(handler));
        self
    }

    pub fn on_end_catch_up(mut self, handler: impl Fn(&EndCatchUpEvent) + Send + 'static) -> Self {
        self.handlers.on_end_catch_up = Some(Box::new(handler));
        self
    }

    /// Validate the configuration, spawn the replica's threads, and return the handle that keeps
    /// them alive.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is inconsistent, if `keypair` does not belong to any registered
    /// principal, or if the host state machine resumes above version zero without a persisted
    /// stable checkpoint.
    pub fn start(self) -> Replica {
        let ReplicaSpec {
            configuration,
            keypair,
            principals,
            session_keys,
            initial_stable_checkpoint,
            mut app,
            ledger,
            mut network,
            handlers,
        } = self;

        configuration.validate();

        let public_key = keypair.public();
        let me = principals
            .iter()
            .find(|principal| principal.verifying_key == public_key)
            .map(|principal| principal.id)
            .expect("the keypair does not belong to any registered principal");

        let registry = Arc::new(RwLock::new(PrincipalRegistry::new(
            principals.clone(),
            configuration.num_replicas,
            configuration.max_faulty,
            configuration.authentication_scheme,
            me,
            session_keys,
        )));

        let init_stable_checkpoint = match initial_stable_checkpoint {
            Some(certificate) => certificate,
            None => {
                let version = app.current_version();
                assert!(
                    version == SeqNumber::init(),
                    "resuming above version zero requires the persisted stable checkpoint"
                );
                CheckpointCertificate::genesis(app.snapshot(version))
            }
        };
        let stable_holder = Arc::new(Mutex::new(init_stable_checkpoint.clone()));

        network.init_principals(principals);

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, dispatch_receiver, loopback, sync_request_receiver) =
            start_polling(network.clone(), poller_shutdown_receiver);

        let (log_sync_server_shutdown, log_sync_server_shutdown_receiver) = mpsc::channel();
        let log_sync_server = start_log_sync_server(
            ledger.clone(),
            registry.clone(),
            keypair.clone(),
            network.clone(),
            sync_request_receiver,
            stable_holder.clone(),
            configuration.log_sync_request_limit,
            log_sync_server_shutdown_receiver,
        );

        let event_handlers = EventHandlers::new(configuration.log_events, handlers);
        let (event_publisher, event_bus, event_bus_shutdown) = if event_handlers.is_empty() {
            (None, None, None)
        } else {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            let event_bus = start_event_bus(
                event_handlers,
                event_subscriber,
                event_bus_shutdown_receiver,
            );
            (Some(event_publisher), Some(event_bus), Some(event_bus_shutdown))
        };

        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = start_algorithm(
            configuration,
            keypair,
            registry,
            app,
            ledger,
            network,
            loopback,
            dispatch_receiver,
            init_stable_checkpoint,
            stable_holder,
            algorithm_shutdown_receiver,
            event_publisher,
        );

        Replica {
            poller: Some(poller),
            poller_shutdown,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            log_sync_server: Some(log_sync_server),
            log_sync_server_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// Keeps the replica's threads alive. Dropping this shuts the replica down.
pub struct Replica {
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    log_sync_server: Option<JoinHandle<()>>,
    log_sync_server_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The order of thread shutdown in this function matters: the algorithm and log sync
        // server threads receive messages from the poller and assume it outlives them. Sends are
        // allowed to fail: the algorithm thread exits on its own when the host diverges.

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.algorithm_shutdown.send(());
        if let Some(algorithm) = self.algorithm.take() {
            let _ = algorithm.join();
        }

        let _ = self.log_sync_server_shutdown.send(());
        if let Some(log_sync_server) = self.log_sync_server.take() {
            let _ = log_sync_server.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}
