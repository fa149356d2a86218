/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The serving side of the log sync protocol.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use borsh::BorshDeserialize;

use crate::checkpointing::types::CheckpointCertificate;
use crate::ledger::Ledger;
use crate::messages::{AuthenticatedMessage, Message};
use crate::networking::network::Network;
use crate::types::basic::{PrincipalId, SeqNumber};
use crate::types::keypair::Keypair;
use crate::types::principals::PrincipalRegistry;

use super::messages::{AppendEntriesRequest, AppendEntriesResponse, LedgerEntry, MetaData};

/// Start the log sync server thread.
///
/// The thread answers [`AppendEntriesRequest`]s with bounded batches of ledger entries plus the
/// latest stable checkpoint certificate (shared with the algorithm thread through
/// `stable_checkpoint`). Per peer, it remembers the last acknowledged seqno (the `from_seqno` of
/// the peer's latest request), which bounds what a repeatedly-asking peer can make the server
/// re-read.
pub(crate) fn start_log_sync_server<N: Network + 'static>(
    ledger: impl Ledger,
    registry: Arc<RwLock<PrincipalRegistry>>,
    keypair: Keypair,
    mut network: N,
    requests: Receiver<(PrincipalId, AppendEntriesRequest)>,
    stable_checkpoint: Arc<Mutex<CheckpointCertificate>>,
    request_limit: u32,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_acked: HashMap<PrincipalId, SeqNumber> = HashMap::new();

        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("log sync server thread disconnected from main thread")
                }
            }

            let (origin, request) = match requests.try_recv() {
                Ok(received) => received,
                Err(TryRecvError::Empty) => {
                    thread::yield_now();
                    continue;
                }
                Err(TryRecvError::Disconnected) => return,
            };

            let registry = registry.read().unwrap();
            if request.verify_against(&registry).is_err() {
                log::warn!(
                    "LogSyncServer, dropped a request with a bad authenticator from {}",
                    origin
                );
                continue;
            }

            last_acked.insert(request.from, request.from_seqno);

            let certificate = stable_checkpoint.lock().unwrap().clone();
            let limit = request.limit.min(request_limit).max(1);

            let mut entries: Vec<LedgerEntry> = Vec::new();
            let mut seqno = request.from_seqno;
            while (entries.len() as u32) < limit && seqno <= ledger.latest() {
                let Some(bytes) = ledger.get_entry(seqno) else {
                    break;
                };
                let Ok(entry) = LedgerEntry::try_from_slice(&bytes) else {
                    log::error!("LogSyncServer, ledger entry {} does not parse", seqno);
                    break;
                };
                entries.push(entry);
                seqno = seqno + 1;
            }

            let response = AppendEntriesResponse::new(
                &registry,
                &keypair,
                request.from,
                entries,
                MetaData {
                    stable_checkpoint: certificate,
                },
            );
            network.send(request.from, Message::from(response));
        }
    })
}
