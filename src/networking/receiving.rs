//! Functions and types for receiving messages from the P2P network.

use std::{
    collections::BTreeMap,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::Instant,
};

use crate::log_sync::messages::{AppendEntriesRequest, AppendEntriesResponse, LogSyncMessage, MetaDataDigest};
use crate::messages::{Cacheable, Message, ProtocolMessage};
use crate::ordering::messages::OrderingMessage;
use crate::requests::messages::RequestMessage;
use crate::types::basic::{BufferSize, PrincipalId, ViewNumber};

use super::network::Network;

/// Everything the dispatch (algorithm) thread consumes: protocol messages, request traffic, and
/// the client half of the log sync protocol.
pub(crate) enum Inbound {
    Protocol(ProtocolMessage),
    Request(RequestMessage),
    SyncResponse(AppendEntriesResponse),
    Advertise(MetaDataDigest),
}

/// Spawn the poller thread, which polls the [`Network`] for messages and distributes them into
/// receiver handles.
///
/// The kinds of messages that the poller distributes are:
/// 1. [`Inbound`] messages (processed by the [`Algorithm`][crate::algorithm::Algorithm]'s dispatch
///    loop), and
/// 2. Log sync requests (processed by the
///    [log sync server][crate::log_sync::server::start_log_sync_server]).
///
/// Replies addressed to this principal are dropped: replicas do not consume replies.
///
/// Besides the two receivers, this returns a sender cloned onto the dispatch channel, which
/// [`SenderHandle`](super::sending::SenderHandle) uses to short-circuit self-sends past the
/// network.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (
    JoinHandle<()>,
    Receiver<(PrincipalId, Inbound)>,
    Sender<(PrincipalId, Inbound)>,
    Receiver<(PrincipalId, AppendEntriesRequest)>,
) {
    let (to_dispatch, dispatch_receiver) = mpsc::channel();
    let (to_sync_server, sync_server_receiver) = mpsc::channel();
    let loopback = to_dispatch.clone();

    let poller_thread = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            match msg {
                Message::ProtocolMessage(p_msg) => {
                    let _ = to_dispatch.send((origin, Inbound::Protocol(p_msg)));
                }
                Message::RequestMessage(r_msg) => {
                    let _ = to_dispatch.send((origin, Inbound::Request(r_msg)));
                }
                Message::LogSyncMessage(s_msg) => match s_msg {
                    LogSyncMessage::AppendEntriesRequest(s_req) => {
                        let _ = to_sync_server.send((origin, s_req));
                    }
                    LogSyncMessage::AppendEntriesResponse(s_res) => {
                        let _ = to_dispatch.send((origin, Inbound::SyncResponse(s_res)));
                    }
                    LogSyncMessage::MetaDataDigest(adv) => {
                        let _ = to_dispatch.send((origin, Inbound::Advertise(adv)));
                    }
                },
                Message::ReplyMessage(_) => (),
            }
        } else {
            thread::yield_now()
        }
    });

    (
        poller_thread,
        dispatch_receiver,
        loopback,
        sync_server_receiver,
    )
}

/// A receiving end for [`Inbound`] messages.
///
/// ## View-aware buffering
///
/// `ProtocolMessageStub` performs "view-aware buffering" on ordering messages. This means that it
/// inspects their view numbers to decide whether to:
/// 1. Return them from `recv` for immediate processing (current view),
/// 2. Place them in its buffer for future processing (future view), or
/// 3. Discard them (past view).
///
/// This helps prevent interruptions to progress when replicas' views are mostly synchronized but
/// they enter views at slightly different times.
///
/// Checkpoint, status, view-change, request, and log sync traffic is returned immediately: those
/// paths do their own view gating (or have none).
///
/// ## Buffer management
///
/// If the buffer grows beyond the capacity specified in [`new`](Self::new), highest-viewed
/// messages are removed first to make space: the nearer a buffered message's view, the sooner it
/// would have been useful.
pub(crate) struct ProtocolMessageStub {
    receiver: Receiver<(PrincipalId, Inbound)>,
    buffer: OrderingMessageBuffer,
}

/// Ways in which [`ProtocolMessageStub::recv`] can fail.
pub(crate) enum MessageReceiveError {
    /// No message became available before the deadline.
    Timeout,
    /// The poller thread hung up.
    Disconnected,
}

impl ProtocolMessageStub {
    pub(crate) fn new(
        receiver: Receiver<(PrincipalId, Inbound)>,
        buffer_capacity: BufferSize,
    ) -> ProtocolMessageStub {
        ProtocolMessageStub {
            receiver,
            buffer: OrderingMessageBuffer::new(buffer_capacity),
        }
    }

    /// Receive a message to process at `cur_view`. Buffered ordering messages for the current view
    /// are drained before the channel is polled; ordering messages older than the current view are
    /// dropped; ordering messages for future views are cached.
    pub(crate) fn recv(
        &mut self,
        cur_view: ViewNumber,
        deadline: Instant,
    ) -> Result<(PrincipalId, Inbound), MessageReceiveError> {
        // Clear the buffer of messages with views lower than the current one.
        self.buffer.remove_expired_msgs(cur_view);

        if let Some((origin, msg)) = self.buffer.get_msg(cur_view) {
            return Ok((origin, Inbound::Protocol(ProtocolMessage::OrderingMessage(msg))));
        }

        while Instant::now() < deadline {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(timeout) {
                Ok((origin, Inbound::Protocol(ProtocolMessage::OrderingMessage(msg)))) => {
                    if msg.view() == cur_view {
                        return Ok((
                            origin,
                            Inbound::Protocol(ProtocolMessage::OrderingMessage(msg)),
                        ));
                    } else if msg.view() > cur_view {
                        self.buffer.insert(msg, origin);
                    }
                    // Ordering messages from past views are dropped here; the status subprotocol
                    // is what helps genuinely lagging peers.
                }
                Ok((origin, msg)) => return Ok((origin, msg)),
                Err(RecvTimeoutError::Timeout) => return Err(MessageReceiveError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MessageReceiveError::Disconnected)
                }
            }
        }

        Err(MessageReceiveError::Timeout)
    }
}

/// A bounded, view-indexed buffer of [`OrderingMessage`]s from future views.
struct OrderingMessageBuffer {
    capacity: BufferSize,
    size: BufferSize,
    buffer: BTreeMap<ViewNumber, Vec<(PrincipalId, OrderingMessage)>>,
}

impl OrderingMessageBuffer {
    fn new(capacity: BufferSize) -> OrderingMessageBuffer {
        OrderingMessageBuffer {
            capacity,
            size: BufferSize::new(0),
            buffer: BTreeMap::new(),
        }
    }

    /// Insert a message, evicting highest-viewed messages if the buffer would overflow. A message
    /// larger than the whole buffer is dropped outright.
    fn insert(&mut self, msg: OrderingMessage, origin: PrincipalId) {
        let msg_size = Cacheable::size(&msg);
        if msg_size > self.capacity.int() {
            return;
        }

        while self.size.int() + msg_size > self.capacity.int() {
            let (&highest_view, _) = self
                .buffer
                .iter()
                .next_back()
                .expect("the buffer is non-empty while it is over capacity");
            let for_view = self.buffer.get_mut(&highest_view).unwrap();
            let (_, evicted) = for_view.pop().unwrap();
            self.size -= Cacheable::size(&evicted);
            if for_view.is_empty() {
                self.buffer.remove(&highest_view);
            }
        }

        self.size += msg_size;
        self.buffer
            .entry(Cacheable::view(&msg))
            .or_default()
            .push((origin, msg));
    }

    /// Pop a buffered message for exactly `view`, oldest first.
    fn get_msg(&mut self, view: ViewNumber) -> Option<(PrincipalId, OrderingMessage)> {
        let for_view = self.buffer.get_mut(&view)?;
        if for_view.is_empty() {
            self.buffer.remove(&view);
            return None;
        }
        let (origin, msg) = for_view.remove(0);
        self.size -= Cacheable::size(&msg);
        if for_view.is_empty() {
            self.buffer.remove(&view);
        }
        Some((origin, msg))
    }

    /// Drop all buffered messages with views lower than `cur_view`.
    fn remove_expired_msgs(&mut self, cur_view: ViewNumber) {
        while let Some((&view, _)) = self.buffer.iter().next() {
            if view >= cur_view {
                break;
            }
            let removed = self.buffer.remove(&view).unwrap();
            for (_, msg) in removed {
                self.size -= Cacheable::size(&msg);
            }
        }
    }
}
