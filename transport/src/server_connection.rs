//! The server side of a single connection: inbound requests are queued until a worker picks
//!  them up, and the connection's authenticated identity is tracked.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::framed_message::FramedMessage;
use crate::reactor::{lock, ConnectionHandler, TransportHandle};

#[cfg(test)] use mockall::automock;

/// The identity a connection authenticated as. It starts out empty and is set at most once:
///  there is no logout and no re-login on the same connection.
#[derive(Default)]
pub struct IdentitySlot {
    identity: Mutex<Option<String>>,
}

impl IdentitySlot {
    pub fn get(&self) -> Option<String> {
        lock(&self.identity).clone()
    }

    /// Returns the established identity, or - if there is none yet - runs `login` while holding
    ///  the slot's lock. `login` may establish the identity by filling in the slot.
    ///
    /// Holding the lock for the duration of `login` means that of several requests racing on an
    ///  unauthenticated connection, exactly one is treated as the login attempt. The others see
    ///  its outcome.
    pub fn established_or_else<R>(&self, login: impl FnOnce(&mut Option<String>) -> R) -> Result<String, R> {
        let mut identity = lock(&self.identity);
        match identity.as_ref() {
            Some(name) => Ok(name.clone()),
            None => Err(login(&mut identity)),
        }
    }
}

/// What request handlers know about the connection a request arrived on
pub struct ConnectionContext {
    pub connection_id: u64,
    pub peer_addr: Option<SocketAddr>,
    pub identity: IdentitySlot,
}

/// Application logic on the server side. Each request is handled on its own task, so several
///  requests of the same connection may be in progress concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produces the reply payload for a request payload. Errors are turned into a reply via
    ///  [RequestHandler::encode_error].
    async fn handle_request(&self, ctx: &ConnectionContext, request: Vec<u8>) -> anyhow::Result<Vec<u8>>;

    /// Encodes an error as a reply payload. This must not fail: every request gets a reply.
    fn encode_error(&self, error: &anyhow::Error) -> Vec<u8>;
}

/// Queues a connection's inbound requests for workers.
pub struct ServerConnection {
    transport: TransportHandle,
    context: Arc<ConnectionContext>,
    inbound: Mutex<VecDeque<FramedMessage>>,
    inbound_signal: Notify,
}

impl ServerConnection {
    pub fn new(connection_id: u64, peer_addr: Option<SocketAddr>, config: Arc<TransportConfig>) -> ServerConnection {
        ServerConnection {
            transport: TransportHandle::new(config),
            context: Arc::new(ConnectionContext {
                connection_id,
                peer_addr,
                identity: Default::default(),
            }),
            inbound: Default::default(),
            inbound_signal: Notify::new(),
        }
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.context
    }

    /// Waits for the next inbound request. Returns `None` once the connection failed or was
    ///  stopped: requests still queued at that point are abandoned since their replies could
    ///  not be delivered anyway.
    pub async fn next_request(&self) -> Option<FramedMessage> {
        loop {
            let arrived = self.inbound_signal.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if self.transport.is_finished() {
                return None;
            }
            if let Some(request) = lock(&self.inbound).pop_front() {
                return Some(request);
            }

            tokio::select! {
                _ = &mut arrived => {}
                _ = self.transport.finished() => {}
            }
        }
    }

    /// Sends a reply, tagged with the id of the request it answers
    pub fn send_reply(&self, request_id: u64, reply: Vec<u8>) -> Result<(), TransportError> {
        self.transport.enqueue_send(FramedMessage::new(request_id, reply))
    }

    /// Stops the connection, waking up everybody waiting for requests
    pub fn request_stop(&self) {
        self.transport.request_stop();
        self.inbound_signal.notify_waiters();
    }
}

impl ConnectionHandler for ServerConnection {
    fn on_message_arrived(&self, message: FramedMessage) {
        trace!("queueing request #{}", message.id);
        lock(&self.inbound).push_back(message);
        self.inbound_signal.notify_waiters();
    }

    fn on_connection_failed(&self, error: &TransportError) {
        debug!("connection #{} failed: {}", self.context.connection_id, error);
        self.inbound_signal.notify_waiters();
    }

    fn on_connection_stopped(&self) {
        self.inbound_signal.notify_waiters();
    }
}
