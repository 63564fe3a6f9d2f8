use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::Parser;
use clap_derive::{Args, Parser, Subcommand};
use remotefs::fs_client::{FsClient, FsClientConfig};
use remotefs::fs_server::{FsServer, FsServerConfig};
use remotefs::messages::FileType;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transport::config::TransportConfig;
use transport::server::RpcServer;
use transport::tls::{TlsClientHandshake, TlsClientSettings, TlsServerHandshake, TlsServerSettings};

/// chunk size for streaming file contents in either direction
const CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Parser)]
#[clap(name = "remotefs", about = "Serve a directory over TLS, or access one that is served")]
struct CommandLine {
    /// -v for debug output, -vv for trace output; without it, RUST_LOG is honored
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    Server(ServerArgs),
    Client(ClientArgs),
}

#[derive(Args)]
struct ServerArgs {
    #[clap(long, default_value = "127.0.0.1")]
    ip: IpAddr,
    #[clap(long, default_value_t = 42069)]
    port: u16,
    #[clap(long, default_value = "cert.pem")]
    cert: PathBuf,
    #[clap(long, default_value = "key.pem")]
    key: PathBuf,
    /// the directory to serve
    #[clap(long)]
    root: PathBuf,
    #[clap(long)]
    users: PathBuf,
    #[clap(long)]
    acl: Option<PathBuf>,
    /// I/O timeout in seconds
    #[clap(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Args)]
struct ClientArgs {
    #[clap(long, default_value = "127.0.0.1")]
    ip: IpAddr,
    #[clap(long, default_value_t = 42069)]
    port: u16,
    /// certificate the server's certificate is verified against
    #[clap(long, default_value = "cert.pem")]
    ca: PathBuf,
    #[clap(long, default_value = "localhost")]
    server_name: String,
    #[clap(long)]
    username: String,
    #[clap(long)]
    password: String,
    /// I/O timeout in seconds
    #[clap(long, default_value_t = 30)]
    timeout: u64,

    #[clap(subcommand)]
    command: ClientCommand,
}

#[derive(Subcommand)]
enum ClientCommand {
    Stat { path: String },
    Ls {
        #[clap(default_value = "/")]
        path: String,
    },
    Cat { path: String },
    /// copy a local file to the server, replacing the remote file's content
    Put { local: PathBuf, remote: String },
    Mkdir { path: String },
    Rm { path: String },
    Rmdir { path: String },
    Mv { from: String, to: String },
    Df {
        #[clap(default_value = "/")]
        path: String,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = CommandLine::parse();
    init_logging(args.verbose);

    match args.mode {
        Mode::Server(server_args) => run_server(server_args).await,
        Mode::Client(client_args) => run_client(client_args).await,
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let transport_config = Arc::new(TransportConfig::with_io_timeout(Duration::from_secs(args.timeout)));
    let handshake = TlsServerHandshake::from_settings(&TlsServerSettings {
        cert_path: args.cert,
        key_path: args.key,
    })?;
    let fs_server = FsServer::from_config(&FsServerConfig {
        root: args.root,
        users_path: args.users,
        acl_path: args.acl,
    })?;

    let server = RpcServer::bind((args.ip, args.port), Arc::new(handshake), Arc::new(fs_server), transport_config).await?;
    server.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received Ctrl-C");
    }).await
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let transport_config = Arc::new(TransportConfig::with_io_timeout(Duration::from_secs(args.timeout)));
    let handshake = TlsClientHandshake::from_settings(&TlsClientSettings {
        ca_cert_path: args.ca,
        server_name: args.server_name,
    })?;
    let config = FsClientConfig::new(args.username, args.password);

    let client = FsClient::connect((args.ip, args.port), Arc::new(handshake), transport_config, &config).await?;
    let keep_alive = client.spawn_keep_alive(config.keep_alive_interval);

    // losing the connection ends the process, even while a command is in progress
    let result = select! {
        result = execute(&client, args.command) => result,
        lost = keep_alive => Err(match lost {
            Ok(e) => anyhow!("connection lost: {}", e),
            Err(e) => anyhow!("keep-alive terminated abnormally: {}", e),
        }),
    };

    client.shutdown().await;
    result
}

async fn execute(client: &FsClient, command: ClientCommand) -> anyhow::Result<()> {
    match command {
        ClientCommand::Stat { path } => {
            let attr = client.getattr(&path).await?;
            if attr.file_type == FileType::None {
                bail!("{}: no such file or directory", path);
            }
            println!("{}: {:?}, mode {:o}, {} links, {} bytes", path, attr.file_type, attr.mode, attr.links, attr.size);
        }
        ClientCommand::Ls { path } => {
            for entry in client.readdir(&path).await? {
                println!("{}", entry);
            }
        }
        ClientCommand::Cat { path } => {
            if !client.open(&path).await? {
                bail!("{}: no such file", path);
            }
            let mut stdout = tokio::io::stdout();
            let mut offset = 0i64;
            loop {
                let chunk = client.read(&path, offset, CHUNK_SIZE).await?;
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as i64;
                stdout.write_all(&chunk).await?;
            }
            stdout.flush().await?;
        }
        ClientCommand::Put { local, remote } => {
            let content = tokio::fs::read(&local).await?;
            if client.create(&remote, 0o644).await? != 0 && client.truncate(&remote, 0).await? != 0 {
                bail!("{}: cannot create file", remote);
            }
            let mut offset = 0;
            for chunk in content.chunks(CHUNK_SIZE as usize) {
                let written = client.write(&remote, offset, chunk.to_vec()).await?;
                if written < 0 || written as usize != chunk.len() {
                    bail!("{}: write failed at offset {}", remote, offset);
                }
                offset += chunk.len() as i64;
            }
            info!("copied {} bytes to {}", content.len(), remote);
        }
        ClientCommand::Mkdir { path } => {
            check_status(client.mkdir(&path, 0o755).await?, "mkdir", &path)?;
        }
        ClientCommand::Rm { path } => {
            check_status(client.unlink(&path).await?, "rm", &path)?;
        }
        ClientCommand::Rmdir { path } => {
            check_status(client.rmdir(&path).await?, "rmdir", &path)?;
        }
        ClientCommand::Mv { from, to } => {
            check_status(client.rename(&from, &to).await?, "mv", &from)?;
        }
        ClientCommand::Df { path } => {
            let stat = client.statfs(&path).await?;
            check_status(stat.ok, "df", &path)?;
            println!("block size {}, {} of {} blocks available, {} of {} inodes available",
                     stat.frsize, stat.bavail, stat.blocks, stat.favail, stat.files);
        }
    }
    Ok(())
}

fn check_status(status: i32, command: &str, path: &str) -> anyhow::Result<()> {
    if status != 0 {
        bail!("{}: {} failed", command, path);
    }
    Ok(())
}
