use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use rustc_hash::FxHashMap;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::framed_message::FramedMessage;
use crate::reactor::{lock, spawn_reactor, ConnectionHandler, TransportHandle};
use crate::tls::SessionHandshake;

#[derive(Default)]
struct PendingCalls {
    next_id: u64,
    waiters: FxHashMap<u64, oneshot::Sender<Vec<u8>>>,
    connection_lost: bool,
    failure_reason: Option<String>,
}

/// The client side of a connection: every request gets a fresh correlation id, and the reply
///  carrying that id completes the request's waiter. Replies may arrive in any order.
///
/// Once the connection is lost, all pending calls fail with [TransportError::ConnectionLost],
///  and so does every later call. There is no reconnect: a new connection needs a new client.
pub struct RpcClient {
    transport: TransportHandle,
    calls: Mutex<PendingCalls>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Starts a client on an already connected stream. The handshake runs in the background;
    ///  calls issued before it completes are queued.
    pub fn start<S, H>(raw: S, handshake: Arc<H>, config: Arc<TransportConfig>) -> Arc<RpcClient>
    where
        S: Send + 'static,
        H: SessionHandshake<S>,
    {
        let client = Arc::new(RpcClient {
            transport: TransportHandle::new(config),
            calls: Default::default(),
            reactor: Default::default(),
        });

        let reactor = spawn_reactor(raw, handshake, client.transport.clone(), client.clone());
        *lock(&client.reactor) = Some(reactor);
        client
    }

    /// Connects to a server and waits for the handshake to complete
    pub async fn connect<A, H>(addr: A, handshake: Arc<H>, config: Arc<TransportConfig>) -> anyhow::Result<Arc<RpcClient>>
    where
        A: ToSocketAddrs,
        H: SessionHandshake<TcpStream>,
    {
        config.validate()?;

        let stream = timeout(config.io_timeout, TcpStream::connect(addr)).await
            .context("timeout connecting to server")??;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        info!("connected to {:?}", peer_addr);

        let client = Self::start(stream, handshake, config);
        if !client.transport.established().await {
            let reason = lock(&client.calls).failure_reason.clone()
                .unwrap_or_else(|| "connection stopped".to_string());
            return Err(anyhow!("connection to {:?} failed: {}", peer_addr, reason));
        }
        Ok(client)
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Sends a request, returning a future for its reply. The request is enqueued before this
    ///  method returns, regardless of when (or if) the returned future is polled.
    pub fn call(&self, request: Vec<u8>) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send + 'static {
        let registered = self.register_call(request);
        async move {
            registered?.await
                .map_err(|_| TransportError::ConnectionLost)
        }
    }

    pub async fn call_and_wait(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.call(request).await
    }

    /// Sends a request and blocks the current thread until the reply arrives. This is for
    ///  synchronous callers outside the async runtime; it panics if called from async code.
    pub fn call_blocking(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.register_call(request)?
            .blocking_recv()
            .map_err(|_| TransportError::ConnectionLost)
    }

    /// number of requests that were sent but did not get a reply yet
    pub fn num_pending_calls(&self) -> usize {
        lock(&self.calls).waiters.len()
    }

    /// Stops the connection and waits for its reactor to finish. Pending calls fail.
    pub async fn shutdown(&self) {
        self.transport.request_stop();

        let reactor = lock(&self.reactor).take();
        if let Some(reactor) = reactor {
            if let Err(e) = reactor.await {
                warn!("reactor terminated abnormally: {}", e);
            }
        }

        self.fail_all_calls("client shut down".to_string());
    }

    fn register_call(&self, request: Vec<u8>) -> Result<oneshot::Receiver<Vec<u8>>, TransportError> {
        let (sender, receiver) = oneshot::channel();
        let id = {
            let mut calls = lock(&self.calls);
            if calls.connection_lost {
                return Err(TransportError::ConnectionLost);
            }
            let id = calls.next_id;
            calls.next_id += 1;
            calls.waiters.insert(id, sender);
            id
        };

        if let Err(e) = self.transport.enqueue_send(FramedMessage::new(id, request)) {
            lock(&self.calls).waiters.remove(&id);
            return Err(e);
        }
        Ok(receiver)
    }

    fn fail_all_calls(&self, reason: String) {
        let waiters = {
            let mut calls = lock(&self.calls);
            calls.connection_lost = true;
            calls.failure_reason.get_or_insert(reason);
            mem::take(&mut calls.waiters)
        };

        if !waiters.is_empty() {
            info!("failing {} pending calls", waiters.len());
        }
        // dropping the senders completes the waiters with an error
        drop(waiters);
    }
}

impl ConnectionHandler for RpcClient {
    fn on_message_arrived(&self, message: FramedMessage) {
        let waiter = lock(&self.calls).waiters.remove(&message.id);
        match waiter {
            Some(sender) => {
                if sender.send(message.payload).is_err() {
                    debug!("caller for reply #{} is gone - discarding reply", message.id);
                }
            }
            None => {
                warn!("received reply #{} without a pending request - dropping", message.id);
            }
        }
    }

    fn on_connection_failed(&self, error: &TransportError) {
        self.fail_all_calls(error.to_string());
    }

    fn on_connection_stopped(&self) {
        self.fail_all_calls("connection stopped".to_string());
    }
}
