use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use transport::client::RpcClient;
use transport::codec::{decode_exact, encode_to_vec, DecodeError};
use transport::config::TransportConfig;
use transport::error::TransportError;
use transport::tls::SessionHandshake;

use crate::messages::*;

#[derive(Clone, Debug)]
pub struct FsClientConfig {
    pub username: String,
    pub password: String,
    /// how often an idle connection is kept alive; must be well below the server's I/O timeout
    pub keep_alive_interval: Duration,
}

impl FsClientConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> FsClientConfig {
        FsClientConfig {
            username: username.into(),
            password: password.into(),
            keep_alive_interval: Duration::from_secs(1),
        }
    }

    pub fn validate(&self, transport_config: &TransportConfig) -> anyhow::Result<()> {
        if self.username.is_empty() {
            bail!("username must not be empty");
        }
        if self.keep_alive_interval.is_zero() {
            bail!("keep-alive interval must be positive");
        }
        if self.keep_alive_interval >= transport_config.io_timeout {
            bail!("keep-alive interval {:?} must be shorter than the I/O timeout {:?}", self.keep_alive_interval, transport_config.io_timeout);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FsClientError {
    /// the server answered with an [ErrorReply]
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected reply {0} from server")]
    UnexpectedReply(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),
}

pub type FsResult<T> = Result<T, FsClientError>;

/// Typed access to a remote filesystem. Calls may be issued concurrently from any number of
///  tasks over the same connection.
pub struct FsClient {
    rpc: Arc<RpcClient>,
}

impl FsClient {
    /// Wraps a connection that is not logged in yet
    pub fn new(rpc: Arc<RpcClient>) -> FsClient {
        FsClient { rpc }
    }

    /// Connects, completes the handshake and logs in
    pub async fn connect<A, H>(addr: A, handshake: Arc<H>, transport_config: Arc<TransportConfig>, config: &FsClientConfig) -> anyhow::Result<FsClient>
    where
        A: ToSocketAddrs,
        H: SessionHandshake<TcpStream>,
    {
        config.validate(&transport_config)?;

        let client = FsClient::new(RpcClient::connect(addr, handshake, transport_config).await?);
        client.login(&config.username, &config.password).await?;
        Ok(client)
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    /// Sends a request and waits for a reply of type `R`
    pub async fn call<R>(&self, request: impl Into<AnyMessage>) -> FsResult<R>
    where
        R: TryFrom<AnyMessage, Error = AnyMessage>,
    {
        let reply = self.rpc.call(encode_to_vec(&request.into())).await?;
        match R::try_from(decode_exact::<AnyMessage>(&reply)?) {
            Ok(reply) => Ok(reply),
            Err(AnyMessage::ErrorReply(e)) => Err(FsClientError::Server(e.error)),
            Err(other) => Err(FsClientError::UnexpectedReply(other.variant_name())),
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> FsResult<()> {
        let _: LoginReply = self.call(LoginReq { username: username.to_string(), password: password.to_string() }).await?;
        info!("logged in as {:?}", username);
        Ok(())
    }

    pub async fn keep_alive(&self) -> FsResult<()> {
        let _: KeepAliveReply = self.call(KeepAliveReq {}).await?;
        Ok(())
    }

    /// Sends a keep-alive request every `interval` until one fails. The task's result is the
    ///  error that ended it.
    pub fn spawn_keep_alive(&self, interval: Duration) -> JoinHandle<FsClientError> {
        let client = FsClient::new(self.rpc.clone());
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = client.keep_alive().await {
                    error!("keep-alive failed: {}", e);
                    return e;
                }
                debug!("keep-alive");
            }
        })
    }

    pub async fn getattr(&self, path: &str) -> FsResult<GetattrReply> {
        self.call(GetattrReq { path: path.to_string() }).await
    }

    pub async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let reply: ReaddirReply = self.call(ReaddirReq { path: path.to_string() }).await?;
        Ok(reply.entries)
    }

    /// `true` if the path exists
    pub async fn open(&self, path: &str) -> FsResult<bool> {
        let reply: OpenReply = self.call(OpenReq { path: path.to_string() }).await?;
        Ok(reply.ok == 1)
    }

    pub async fn read(&self, path: &str, off: i64, len: u64) -> FsResult<Vec<u8>> {
        let reply: ReadReply = self.call(ReadReq { path: path.to_string(), off, len }).await?;
        Ok(reply.data)
    }

    /// returns the number of bytes written, or -1 if the path is not a regular file
    pub async fn write(&self, path: &str, off: i64, data: Vec<u8>) -> FsResult<i32> {
        let reply: WriteReply = self.call(WriteReq { path: path.to_string(), off, len: data.len() as u64, data }).await?;
        Ok(reply.len)
    }

    pub async fn create(&self, path: &str, mode: i32) -> FsResult<i32> {
        let reply: CreateReply = self.call(CreateReq { path: path.to_string(), mode }).await?;
        Ok(reply.ok)
    }

    pub async fn chmod(&self, path: &str, mode: i32) -> FsResult<i32> {
        let reply: ChmodReply = self.call(ChmodReq { path: path.to_string(), mode }).await?;
        Ok(reply.ok)
    }

    pub async fn mkdir(&self, path: &str, mode: i32) -> FsResult<i32> {
        let reply: MkdirReply = self.call(MkdirReq { path: path.to_string(), mode }).await?;
        Ok(reply.ok)
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<i32> {
        let reply: RmdirReply = self.call(RmdirReq { path: path.to_string() }).await?;
        Ok(reply.ok)
    }

    pub async fn unlink(&self, path: &str) -> FsResult<i32> {
        let reply: UnlinkReply = self.call(UnlinkReq { path: path.to_string() }).await?;
        Ok(reply.ok)
    }

    pub async fn truncate(&self, path: &str, size: i64) -> FsResult<i32> {
        let reply: TruncateReply = self.call(TruncateReq { path: path.to_string(), size }).await?;
        Ok(reply.res)
    }

    pub async fn rename(&self, path: &str, new_path: &str) -> FsResult<i32> {
        let reply: RenameReply = self.call(RenameReq { path: path.to_string(), new_path: new_path.to_string() }).await?;
        Ok(reply.ok)
    }

    /// times are (seconds, nanoseconds) since the epoch
    pub async fn utimens(&self, path: &str, accessed: (i64, i64), modified: (i64, i64)) -> FsResult<i32> {
        let reply: UTimensReply = self.call(UTimensReq {
            path: path.to_string(),
            asecs: accessed.0,
            ans: accessed.1,
            msecs: modified.0,
            mns: modified.1,
        }).await?;
        Ok(reply.ok)
    }

    pub async fn statfs(&self, path: &str) -> FsResult<StatfsReply> {
        self.call(StatfsReq { path: path.to_string() }).await
    }

    pub async fn shutdown(&self) {
        self.rpc.shutdown().await;
    }
}
