/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The dispatch loop that drives the replica.
//!
//! [`Algorithm`] is the single thread that mutates ordering state. It consumes one inbound message
//! or timer fire at a time, hands it to the owning subprotocol ([ordering](crate::ordering),
//! [checkpointing](crate::checkpointing), [view change](crate::view_change),
//! [status](crate::status), or the [log sync client](crate::log_sync::client)), and then performs
//! the cross-subprotocol consequences the handler reported: executing newly committed slots,
//! arming and cancelling timers, stabilizing checkpoints, resuming ordering after a view install,
//! and registering reconfigured principals. Handlers run to completion; there are no suspension
//! points and no reentrant callbacks.
//!
//! The loop halts (and the thread exits) only on shutdown or on a
//! [`HostFailure`](crate::app::HostFailure): a host that cannot apply an agreed batch has diverged
//! from its peers, and a diverged replica must not keep participating.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::app::App;
use crate::checkpointing::protocol::{Checkpointing, CheckpointingConfiguration};
use crate::checkpointing::types::CheckpointCertificate;
use crate::configuration::Configuration;
use crate::events::Event;
use crate::ledger::Ledger;
use crate::log_sync::client::{LogSyncClient, LogSyncConfiguration};
use crate::messages::{AuthenticatedMessage, Message, ProtocolMessage};
use crate::networking::network::Network;
use crate::networking::receiving::{Inbound, MessageReceiveError, ProtocolMessageStub};
use crate::networking::sending::SenderHandle;
use crate::ordering::messages::OrderingMessage;
use crate::ordering::protocol::{Ordering, OrderingConfiguration, OrderingOutcome, RequestOutcome};
use crate::requests::messages::{Data, Request, RequestMessage};
use crate::state::ReplicaState;
use crate::status::protocol::{StatusConfiguration, StatusExchange};
use crate::timers::{TimerHandle, TimerKind, TimerWheel};
use crate::types::basic::{Digest, PrincipalId};
use crate::types::keypair::Keypair;
use crate::types::principals::PrincipalRegistry;
use crate::view_change::messages::ViewChangeMessage;
use crate::view_change::protocol::{
    ViewChangeConfiguration, ViewChangeEngine, ViewChangeOutcome,
};

/// How long one `recv` waits before the loop goes back to ticking timers.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct Algorithm<N: Network, A: App, L: Ledger> {
    me: PrincipalId,
    keypair: Keypair,
    registry: Arc<RwLock<PrincipalRegistry>>,
    state: ReplicaState,
    ordering: Ordering<N>,
    checkpointing: Checkpointing<N>,
    view_change: ViewChangeEngine<N>,
    status: StatusExchange<N>,
    log_sync_client: LogSyncClient<N>,
    sender: SenderHandle<N>,
    stub: ProtocolMessageStub,
    timers: TimerWheel,
    fetch_timers: HashMap<Digest, TimerHandle>,
    status_interval_ms: u64,
    fetch_timeout_ms: u64,
    app: A,
    ledger: L,
    stable_holder: Arc<Mutex<CheckpointCertificate>>,
    shutdown_signal: Receiver<()>,
}

/// Build the [`Algorithm`] and spawn its thread.
pub(crate) fn start_algorithm<N: Network + 'static, A: App, L: Ledger>(
    configuration: Configuration,
    keypair: Keypair,
    registry: Arc<RwLock<PrincipalRegistry>>,
    app: A,
    ledger: L,
    network: N,
    loopback: Sender<(PrincipalId, Inbound)>,
    dispatch_receiver: Receiver<(PrincipalId, Inbound)>,
    init_stable_checkpoint: CheckpointCertificate,
    stable_holder: Arc<Mutex<CheckpointCertificate>>,
    shutdown_signal: Receiver<()>,
    event_publisher: Option<Sender<Event>>,
) -> JoinHandle<()> {
    let me = registry.read().unwrap().me();
    let sender = SenderHandle::new(me, network, loopback);

    let state = ReplicaState::initialize(
        init_stable_checkpoint,
        configuration.log_size,
        configuration.request_table_capacity,
    );

    let ordering = Ordering::new(
        OrderingConfiguration {
            me,
            keypair: keypair.clone(),
            max_batch_size: configuration.max_batch_size,
            big_request_threshold: configuration.big_request_threshold,
        },
        sender.clone(),
        state.last_executed + 1,
        event_publisher.clone(),
    );
    let checkpointing = Checkpointing::new(
        CheckpointingConfiguration {
            keypair: keypair.clone(),
            interval: configuration.checkpoint_interval,
        },
        sender.clone(),
        event_publisher.clone(),
    );
    let view_change = ViewChangeEngine::new(
        ViewChangeConfiguration {
            me,
            keypair: keypair.clone(),
            base_timeout: configuration.view_timeout,
        },
        sender.clone(),
        event_publisher.clone(),
    );
    let status = StatusExchange::new(
        StatusConfiguration {
            me,
            keypair: keypair.clone(),
        },
        sender.clone(),
    );
    let log_sync_client = LogSyncClient::new(
        LogSyncConfiguration {
            me,
            keypair: keypair.clone(),
            request_limit: configuration.log_sync_request_limit,
            recovery_timeout_ms: configuration.recovery_timeout.as_millis() as u64,
        },
        sender.clone(),
        event_publisher,
    );
    let stub = ProtocolMessageStub::new(dispatch_receiver, configuration.msg_buffer_capacity);

    let mut algorithm = Algorithm {
        me,
        keypair,
        registry,
        state,
        ordering,
        checkpointing,
        view_change,
        status,
        log_sync_client,
        sender,
        stub,
        timers: TimerWheel::new(),
        fetch_timers: HashMap::new(),
        status_interval_ms: configuration.status_interval.as_millis() as u64,
        fetch_timeout_ms: configuration.fetch_timeout.as_millis() as u64,
        app,
        ledger,
        stable_holder,
        shutdown_signal,
    };

    thread::spawn(move || algorithm.execute())
}

impl<N: Network, A: App, L: Ledger> Algorithm<N, A, L> {
    fn execute(&mut self) {
        self.timers
            .set(self.status_interval_ms, TimerKind::Status);
        let mut last_tick = Instant::now();

        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Algorithm thread disconnected from main thread")
                }
            }

            let elapsed_ms = last_tick.elapsed().as_millis() as u64;
            if elapsed_ms > 0 {
                last_tick += Duration::from_millis(elapsed_ms);
                for (handle, kind) in self.timers.tick(elapsed_ms) {
                    if !self.on_timer(handle, kind) {
                        return;
                    }
                }
            }

            let deadline = Instant::now() + POLL_INTERVAL;
            match self.stub.recv(self.state.view, deadline) {
                Ok((origin, inbound)) => {
                    if !self.on_inbound(origin, inbound) {
                        return;
                    }
                }
                Err(MessageReceiveError::Timeout) => (),
                Err(MessageReceiveError::Disconnected) => return,
            }
        }
    }

    /// Handle one fired timer. Returns false iff the replica must halt.
    fn on_timer(&mut self, handle: TimerHandle, kind: TimerKind) -> bool {
        match kind {
            TimerKind::View { .. } => {
                let registry = self.registry.read().unwrap();
                self.view_change
                    .on_view_timeout(handle, &mut self.state, &registry, &mut self.timers);
                true
            }
            TimerKind::Status => {
                {
                    let registry = self.registry.read().unwrap();
                    self.status.broadcast_status(&self.state, &registry);
                }
                self.timers.set(self.status_interval_ms, TimerKind::Status);
                true
            }
            TimerKind::Fetch { digest } => {
                self.fetch_timers.remove(&digest);
                if self.state.requests.wanted().contains(&digest) {
                    {
                        let registry = self.registry.read().unwrap();
                        let fetch = crate::requests::messages::Fetch::new(
                            &registry,
                            &self.keypair,
                            digest,
                        );
                        self.sender.broadcast_request(fetch);
                    }
                    self.arm_fetch_timer(digest);
                }
                true
            }
            TimerKind::Recovery => {
                let registry = self.registry.read().unwrap();
                self.log_sync_client
                    .on_timeout(&self.state, &registry, &mut self.timers);
                true
            }
        }
    }

    /// Handle one inbound message. Returns false iff the replica must halt.
    fn on_inbound(&mut self, origin: PrincipalId, inbound: Inbound) -> bool {
        match inbound {
            Inbound::Protocol(ProtocolMessage::OrderingMessage(msg)) => {
                self.on_ordering_message(origin, msg)
            }
            Inbound::Protocol(ProtocolMessage::Checkpoint(checkpoint)) => {
                let certificate = {
                    let registry = self.registry.read().unwrap();
                    self.checkpointing.on_receive_checkpoint(
                        checkpoint,
                        origin,
                        &mut self.state,
                        &registry,
                    )
                };
                if let Some(certificate) = certificate {
                    self.stabilize(certificate);
                }
                true
            }
            Inbound::Protocol(ProtocolMessage::ViewChangeMessage(msg)) => {
                self.on_view_change_message(origin, msg)
            }
            Inbound::Protocol(ProtocolMessage::Status(status)) => {
                let peer_is_ahead = {
                    let registry = self.registry.read().unwrap();
                    self.status
                        .on_receive_status(status, origin, &mut self.state, &registry)
                };
                if peer_is_ahead {
                    let registry = self.registry.read().unwrap();
                    self.log_sync_client
                        .start(None, &self.state, &registry, &mut self.timers);
                }
                true
            }
            Inbound::Request(RequestMessage::Request(request)) => self.on_request(origin, request),
            Inbound::Request(RequestMessage::Fetch(fetch)) => {
                let registry = self.registry.read().unwrap();
                if fetch.verify_against(&registry).is_err() {
                    self.state.counters.dropped_bad_auth += 1;
                    self.state.counters.suspect(origin);
                    return true;
                }
                if let Some(request) = self.state.requests.get(&fetch.digest) {
                    let data = Data {
                        request: request.clone(),
                    };
                    self.sender
                        .send_message(fetch.from, Message::from(RequestMessage::Data(data)));
                }
                true
            }
            Inbound::Request(RequestMessage::Data(data)) => {
                // A fetched body is handled like a directly received request; the signature
                // embedded by the client is its proof either way.
                self.on_request(origin, data.request)
            }
            Inbound::SyncResponse(response) => {
                let result = {
                    let registry = self.registry.read().unwrap();
                    self.log_sync_client.on_receive_response(
                        response,
                        origin,
                        &mut self.state,
                        &registry,
                        &mut self.timers,
                        &mut self.app,
                        &mut self.ledger,
                    )
                };
                match result {
                    Err(failure) => {
                        log::error!(
                            "HostFailure, the state machine diverged during catch-up: {}",
                            failure.0
                        );
                        false
                    }
                    Ok(Some(certificate)) => {
                        self.stabilize(certificate);
                        self.run_execution()
                    }
                    Ok(None) => true,
                }
            }
            Inbound::Advertise(advertisement) => {
                let registry = self.registry.read().unwrap();
                self.log_sync_client.on_receive_advertisement(
                    advertisement,
                    origin,
                    &mut self.state,
                    &registry,
                    &mut self.timers,
                );
                true
            }
        }
    }

    fn on_request(&mut self, origin: PrincipalId, request: Request) -> bool {
        let outcome = {
            let registry = self.registry.read().unwrap();
            self.ordering
                .on_receive_request(request, origin, &mut self.state, &registry)
        };
        match outcome {
            RequestOutcome::Accepted {
                digest,
                resumed_slot,
            } => {
                let i_am_primary = {
                    let registry = self.registry.read().unwrap();
                    registry.primary(self.state.view) == self.me
                };
                if !i_am_primary {
                    self.view_change
                        .note_request(digest, &self.state, &mut self.timers);
                }
                if let Some(seqno) = resumed_slot {
                    if let Some(handle) = self.fetch_timers.remove(&digest) {
                        self.timers.cancel(handle);
                    }
                    let registry = self.registry.read().unwrap();
                    self.ordering
                        .on_request_arrived(digest, seqno, &mut self.state, &registry);
                }
                self.run_execution()
            }
            RequestOutcome::AlreadyExecuted | RequestOutcome::Dropped => true,
        }
    }

    fn on_ordering_message(&mut self, origin: PrincipalId, msg: OrderingMessage) -> bool {
        let outcome = {
            let registry = self.registry.read().unwrap();
            match msg {
                OrderingMessage::PrePrepare(pre_prepare) => self.ordering.on_receive_pre_prepare(
                    pre_prepare,
                    origin,
                    &mut self.state,
                    &registry,
                ),
                OrderingMessage::Prepare(prepare) => {
                    self.ordering
                        .on_receive_prepare(prepare, origin, &mut self.state, &registry)
                }
                OrderingMessage::Commit(commit) => {
                    self.ordering
                        .on_receive_commit(commit, origin, &mut self.state, &registry)
                }
            }
        };

        match outcome {
            OrderingOutcome::Equivocation => {
                let next_view = self.state.view + 1;
                let registry = self.registry.read().unwrap();
                self.view_change.start_view_change(
                    next_view,
                    &mut self.state,
                    &registry,
                    &mut self.timers,
                );
                true
            }
            OrderingOutcome::FetchesNeeded(digests) => {
                for digest in digests {
                    self.arm_fetch_timer(digest);
                }
                true
            }
            OrderingOutcome::Handled => self.run_execution(),
            OrderingOutcome::Dropped => true,
        }
    }

    fn on_view_change_message(&mut self, origin: PrincipalId, msg: ViewChangeMessage) -> bool {
        let outcome = {
            let registry = self.registry.read().unwrap();
            match msg {
                ViewChangeMessage::ViewChange(view_change) => {
                    self.view_change.on_receive_view_change(
                        view_change,
                        origin,
                        &mut self.state,
                        &registry,
                        &mut self.timers,
                    )
                }
                ViewChangeMessage::ViewChangeAck(ack) => {
                    self.view_change.on_receive_view_change_ack(
                        ack,
                        origin,
                        &mut self.state,
                        &registry,
                    );
                    ViewChangeOutcome::Handled
                }
                ViewChangeMessage::NewView(new_view) => self.view_change.on_receive_new_view(
                    new_view,
                    origin,
                    &mut self.state,
                    &registry,
                    &mut self.timers,
                ),
                ViewChangeMessage::ViewInfo(view_info) => self.view_change.on_receive_view_info(
                    view_info,
                    origin,
                    &mut self.state,
                    &registry,
                    &mut self.timers,
                ),
            }
        };

        match outcome {
            ViewChangeOutcome::Installed { catch_up_needed } => {
                let fetches = {
                    let registry = self.registry.read().unwrap();
                    self.ordering
                        .resume_after_view_change(&mut self.state, &registry)
                };
                for digest in fetches {
                    self.arm_fetch_timer(digest);
                }
                *self.stable_holder.lock().unwrap() = self.state.stable_checkpoint.clone();
                if catch_up_needed {
                    let registry = self.registry.read().unwrap();
                    self.log_sync_client
                        .start(None, &self.state, &registry, &mut self.timers);
                }
                self.run_execution()
            }
            ViewChangeOutcome::Handled | ViewChangeOutcome::Dropped => true,
        }
    }

    /// Execute everything newly committed, then do the post-execution bookkeeping: view timer
    /// progress, checkpoint boundaries, and principal reconfiguration. Returns false iff the host
    /// failed (the replica must halt).
    fn run_execution(&mut self) -> bool {
        let executed = {
            let registry = self.registry.read().unwrap();
            self.ordering
                .try_execute(&mut self.state, &registry, &mut self.app, &mut self.ledger)
        };

        let batches = match executed {
            Err(failure) => {
                log::error!(
                    "HostFailure, the state machine failed to apply an agreed batch: {}",
                    failure.0
                );
                return false;
            }
            Ok(batches) => batches,
        };
        if batches.is_empty() {
            return true;
        }

        let mut executed_digests: Vec<Digest> = Vec::new();
        let mut new_principals = Vec::new();
        {
            let registry = self.registry.read().unwrap();
            for batch in &batches {
                executed_digests.extend(batch.request_digests.iter().copied());
                self.checkpointing
                    .on_executed(batch.seqno, &registry, &mut self.app);
            }
        }
        for batch in batches {
            new_principals.extend(batch.new_principals);
        }

        self.view_change
            .note_executed(&executed_digests, &self.state, &mut self.timers);

        if !new_principals.is_empty() {
            let mut registry = self.registry.write().unwrap();
            for (principal, session_key) in new_principals {
                registry.add_principal(principal.clone(), session_key);
                self.sender.add_principal(principal);
            }
        }

        // Executed slots may release fetches that no longer matter.
        self.cancel_stale_fetch_timers();
        true
    }

    /// Install a freshly stable checkpoint and refresh everything derived from the watermark.
    fn stabilize(&mut self, certificate: CheckpointCertificate) {
        self.checkpointing
            .stabilize(certificate, &mut self.state, &mut self.app);
        *self.stable_holder.lock().unwrap() = self.state.stable_checkpoint.clone();
        self.cancel_stale_fetch_timers();

        // Seqnos freed by the advance may already have work waiting for them.
        let registry = self.registry.read().unwrap();
        self.ordering.on_window_advanced(&mut self.state, &registry);
    }

    fn arm_fetch_timer(&mut self, digest: Digest) {
        if !self.fetch_timers.contains_key(&digest) {
            let handle = self
                .timers
                .set(self.fetch_timeout_ms, TimerKind::Fetch { digest });
            self.fetch_timers.insert(digest, handle);
        }
    }

    /// Cancel fetch timers whose digest is no longer wanted (the body arrived, the slot executed,
    /// or the slot fell below the watermark).
    fn cancel_stale_fetch_timers(&mut self) {
        let wanted: HashSet<Digest> = self.state.requests.wanted().into_iter().collect();
        let stale: Vec<Digest> = self
            .fetch_timers
            .keys()
            .filter(|digest| !wanted.contains(*digest))
            .copied()
            .collect();
        for digest in stale {
            if let Some(handle) = self.fetch_timers.remove(&digest) {
                self.timers.cancel(handle);
            }
        }
    }
}
