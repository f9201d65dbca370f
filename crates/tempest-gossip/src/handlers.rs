//! Verb handlers: one per message kind, mapping an incoming message to
//! an optional reply. `dispatch` is the single entry point the engine
//! and embedders route received messages through.

use std::net::SocketAddr;
use std::sync::Arc;
use tempest_common::prelude::*;

use crate::gossiper::Gossiper;
use crate::messages::GossipMessage;

/// Handles one gossip verb. Handlers are synchronous; replies travel
/// back through the transport the caller owns.
pub trait VerbHandler: Send + Sync {
    fn do_verb(&self, from: SocketAddr, msg: GossipMessage) -> Option<GossipMessage>;
}

pub struct SynHandler(pub Arc<Gossiper>);

impl VerbHandler for SynHandler {
    fn do_verb(&self, from: SocketAddr, msg: GossipMessage) -> Option<GossipMessage> {
        match msg {
            GossipMessage::Syn { cluster, partitioner, digests } => {
                self.0.handle_syn(from, &cluster, &partitioner, digests)
            }
            other => {
                debug!(%from, verb = other.verb(), "unexpected verb for SYN handler");
                None
            }
        }
    }
}

pub struct AckHandler(pub Arc<Gossiper>);

impl VerbHandler for AckHandler {
    fn do_verb(&self, from: SocketAddr, msg: GossipMessage) -> Option<GossipMessage> {
        match msg {
            GossipMessage::Ack { digests, states } => self.0.handle_ack(from, digests, states),
            other => {
                debug!(%from, verb = other.verb(), "unexpected verb for ACK handler");
                None
            }
        }
    }
}

pub struct Ack2Handler(pub Arc<Gossiper>);

impl VerbHandler for Ack2Handler {
    fn do_verb(&self, from: SocketAddr, msg: GossipMessage) -> Option<GossipMessage> {
        match msg {
            GossipMessage::Ack2 { states } => {
                self.0.handle_ack2(from, states);
                None
            }
            other => {
                debug!(%from, verb = other.verb(), "unexpected verb for ACK2 handler");
                None
            }
        }
    }
}

/// ECHO is a pure liveness probe: any reply proves the link.
pub struct EchoHandler;

impl VerbHandler for EchoHandler {
    fn do_verb(&self, _from: SocketAddr, _msg: GossipMessage) -> Option<GossipMessage> {
        Some(GossipMessage::EchoResponse)
    }
}

pub struct ShutdownHandler(pub Arc<Gossiper>);

impl VerbHandler for ShutdownHandler {
    fn do_verb(&self, from: SocketAddr, _msg: GossipMessage) -> Option<GossipMessage> {
        self.0.handle_shutdown(from);
        None
    }
}

/// Route a received message to its verb handler and return the reply
/// to send back, if any.
pub fn dispatch(
    gossiper: &Arc<Gossiper>,
    from: SocketAddr,
    msg: GossipMessage,
) -> Option<GossipMessage> {
    match &msg {
        GossipMessage::Syn { .. } => SynHandler(Arc::clone(gossiper)).do_verb(from, msg),
        GossipMessage::Ack { .. } => AckHandler(Arc::clone(gossiper)).do_verb(from, msg),
        GossipMessage::Ack2 { .. } => Ack2Handler(Arc::clone(gossiper)).do_verb(from, msg),
        GossipMessage::Echo => EchoHandler.do_verb(from, msg),
        GossipMessage::EchoResponse => None,
        GossipMessage::Shutdown => ShutdownHandler(Arc::clone(gossiper)).do_verb(from, msg),
    }
}
