use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::framed_message::FramedMessage;
use crate::reactor::{lock, spawn_reactor};
use crate::server_connection::{RequestHandler, ServerConnection};
use crate::tls::SessionHandshake;

/// Accepts connections and serves each of them on its own set of tasks: one reactor, one
///  dispatch loop, and one worker per request.
pub struct RpcServer<A, H> {
    listener: TcpListener,
    handshake: Arc<A>,
    handler: Arc<H>,
    config: Arc<TransportConfig>,
    next_connection_id: AtomicU64,
    live_connections: Arc<Mutex<FxHashMap<u64, Arc<ServerConnection>>>>,
}

impl <A, H> RpcServer<A, H>
where
    A: SessionHandshake<TcpStream>,
    H: RequestHandler,
{
    pub async fn bind(addr: impl ToSocketAddrs, handshake: Arc<A>, handler: Arc<H>, config: Arc<TransportConfig>) -> anyhow::Result<RpcServer<A, H>> {
        config.validate()?;

        let listener = TcpListener::bind(addr).await?;
        info!("listening on {:?}", listener.local_addr()?);

        Ok(RpcServer {
            listener,
            handshake,
            handler,
            config,
            next_connection_id: AtomicU64::new(0),
            live_connections: Default::default(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn num_live_connections(&self) -> usize {
        lock(&self.live_connections).len()
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes, then stops all live connections and
    ///  waits for them to finish. Failing connections do not affect the accept loop.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            // registered before its task first runs, so that a shutdown right
                            //  after the accept still stops it
                            let conn = self.register_connection(peer_addr);
                            connections.spawn(self.accepted_connection(conn, stream));
                        }
                        Err(e) => {
                            warn!("error accepting connection: {}", e);
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task terminated abnormally: {}", e);
                    }
                }
            }
        }

        let live: Vec<Arc<ServerConnection>> = lock(&self.live_connections).values().cloned().collect();
        info!("shutting down - stopping {} connections", live.len());
        for conn in live {
            conn.request_stop();
        }
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    fn register_connection(&self, peer_addr: SocketAddr) -> Arc<ServerConnection> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::AcqRel);
        let conn = Arc::new(ServerConnection::new(connection_id, Some(peer_addr), self.config.clone()));
        lock(&self.live_connections).insert(connection_id, conn.clone());
        conn
    }

    fn accepted_connection(&self, conn: Arc<ServerConnection>, stream: TcpStream) -> impl Future<Output = ()> + Send + 'static {
        let handshake = self.handshake.clone();
        let handler = self.handler.clone();
        let live_connections = self.live_connections.clone();

        async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not disable Nagle's algorithm: {}", e);
            }

            let connection_id = conn.context().connection_id;
            serve_connection(conn, stream, handshake, handler).await;
            lock(&live_connections).remove(&connection_id);
        }
    }
}

/// Serves a single connection on an already accepted stream until the connection is failed or
///  stopped. Each request is handled on its own task, and its reply goes out as soon as it is
///  ready - regardless of requests that arrived earlier.
///
/// Returns only after all requests in progress are handled and the reactor has finished.
#[instrument(name="connection", skip_all, fields(id=conn.context().connection_id, addr=?conn.context().peer_addr))]
pub async fn serve_connection<S, A, H>(conn: Arc<ServerConnection>, raw: S, handshake: Arc<A>, handler: Arc<H>)
where
    S: Send + 'static,
    A: SessionHandshake<S>,
    H: RequestHandler,
{
    info!("accepted connection");
    let reactor = spawn_reactor(raw, handshake, conn.transport().clone(), conn.clone());

    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            request = conn.next_request() => {
                let Some(request) = request else {
                    break;
                };
                spawn_worker(&mut workers, conn.clone(), handler.clone(), request);
            }
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    error!("request worker terminated abnormally: {}", e);
                }
            }
        }
    }

    if !workers.is_empty() {
        debug!("waiting for {} requests in progress", workers.len());
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("request worker terminated abnormally: {}", e);
        }
    }

    if let Err(e) = reactor.await {
        error!("reactor terminated abnormally: {}", e);
    }
    info!("connection closed");
}

fn spawn_worker<H: RequestHandler>(workers: &mut JoinSet<()>, conn: Arc<ServerConnection>, handler: Arc<H>, request: FramedMessage) {
    workers.spawn(async move {
        let reply = handle_isolated(&conn, &handler, request.payload).await;
        let sent = match conn.send_reply(request.id, reply) {
            Err(TransportError::FrameTooLarge { len, max }) => {
                warn!("reply #{} has {} bytes, exceeding the maximum of {}", request.id, len, max);
                let error = anyhow!("reply of {} bytes exceeds the maximum of {} bytes", len, max);
                conn.send_reply(request.id, handler.encode_error(&error))
            }
            other => other,
        };
        if let Err(e) = sent {
            debug!("could not send reply #{}: {}", request.id, e);
        }
    }.instrument(Span::current()));
}

/// Runs the handler on a task of its own, so that a panic is contained and turned into an error
///  reply instead of leaving the client waiting forever.
async fn handle_isolated<H: RequestHandler>(conn: &ServerConnection, handler: &Arc<H>, request: Vec<u8>) -> Vec<u8> {
    let ctx = conn.context().clone();
    let worker_handler = handler.clone();
    let worker = tokio::spawn(async move {
        worker_handler.handle_request(&ctx, request).await
    }.instrument(Span::current()));

    match worker.await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            debug!("request failed: {}", e);
            handler.encode_error(&e)
        }
        Err(e) => {
            error!("request handler terminated abnormally: {}", e);
            handler.encode_error(&anyhow!("internal error: {}", e))
        }
    }
}
