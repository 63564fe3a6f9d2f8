//! Serves a local directory tree to authenticated clients.

use std::fs::{FileTimes, Metadata, Permissions};
use std::io::{ErrorKind, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use transport::codec::{decode_exact, encode_to_vec};
use transport::server_connection::{ConnectionContext, RequestHandler};

use crate::acl::{Acl, Authorizer};
use crate::messages::*;

/// special nanosecond values in a [UTimensReq], with the same meaning as for `utimensat(2)`
const UTIME_NOW: i64 = (1 << 30) - 1;
const UTIME_OMIT: i64 = (1 << 30) - 2;

const UNAUTHORIZED_PATH: &str = "Unauthorized path";

#[derive(Clone, Debug)]
pub struct FsServerConfig {
    /// the directory that is served; request paths are relative to it
    pub root: PathBuf,
    pub users_path: PathBuf,
    pub acl_path: Option<PathBuf>,
}

impl FsServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.root.is_dir() {
            bail!("root {:?} is not a directory", self.root);
        }
        Ok(())
    }
}

/// A request path, checked not to leave the served directory
struct ResolvedPath {
    /// normalized form of the path as the client sees it, e.g. `/a/b` - this is what access
    ///  rules are matched against
    virtual_path: String,
    local: PathBuf,
}

pub struct FsServer {
    root: PathBuf,
    authorizer: Arc<dyn Authorizer>,
}

impl FsServer {
    pub fn new(root: PathBuf, authorizer: Arc<dyn Authorizer>) -> FsServer {
        FsServer { root, authorizer }
    }

    pub fn from_config(config: &FsServerConfig) -> anyhow::Result<FsServer> {
        config.validate()?;
        let acl = Acl::load(config.acl_path.as_deref(), &config.users_path)?;
        info!("serving {:?}", config.root);
        Ok(FsServer::new(config.root.clone(), Arc::new(acl)))
    }

    /// The first request on a connection must be a login. This runs while the connection's
    ///  identity is locked, so at most one login attempt per connection can succeed.
    fn login(&self, identity: &mut Option<String>, msg: &AnyMessage) -> anyhow::Result<AnyMessage> {
        let AnyMessage::LoginReq(req) = msg else {
            bail!("Not logged in");
        };

        info!("authenticating {:?}", req.username);
        if !self.authorizer.authorize(&req.username, &req.password) {
            warn!("failed login for {:?}", req.username);
            bail!("Invalid username or password");
        }

        *identity = Some(req.username.clone());
        Ok(LoginReply {}.into())
    }

    fn resolve(&self, path: &str) -> anyhow::Result<ResolvedPath> {
        let mut virtual_path = String::new();
        let mut local = self.root.clone();

        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => {
                    let name = name.to_str()
                        .ok_or_else(|| anyhow!("invalid path {:?}", path))?;
                    virtual_path.push('/');
                    virtual_path.push_str(name);
                    local.push(name);
                }
                Component::ParentDir | Component::Prefix(_) => {
                    bail!("path {:?} leaves the served directory", path);
                }
            }
        }

        if virtual_path.is_empty() {
            virtual_path.push('/');
        }
        Ok(ResolvedPath { virtual_path, local })
    }

    /// resolves a path and checks the user's access to it, returning `None` if access is denied
    fn accessible(&self, user: &str, path: &str) -> anyhow::Result<Option<ResolvedPath>> {
        let resolved = self.resolve(path)?;
        if self.authorizer.authorize_path(user, &resolved.virtual_path) {
            Ok(Some(resolved))
        }
        else {
            debug!("{} may not access {:?}", user, resolved.virtual_path);
            Ok(None)
        }
    }

    async fn dispatch(&self, user: &str, msg: AnyMessage) -> anyhow::Result<AnyMessage> {
        let unauthorized = || AnyMessage::from(ErrorReply::new(UNAUTHORIZED_PATH));

        let reply = match msg {
            AnyMessage::KeepAliveReq(_) => KeepAliveReply {}.into(),
            AnyMessage::GetattrReq(req) => self.getattr(&self.resolve(&req.path)?).await?.into(),
            AnyMessage::StatfsReq(req) => self.statfs(&self.resolve(&req.path)?).await?.into(),
            AnyMessage::ReaddirReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.readdir(&path).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::OpenReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.open(&path).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::ReadReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.read(&path, &req).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::WriteReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.write(&path, &req).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::CreateReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.create(&path, req.mode).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::ChmodReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.chmod(&path, req.mode).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::MkdirReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.mkdir(&path, req.mode).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::RmdirReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.rmdir(&path).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::UnlinkReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.unlink(&path).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::TruncateReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.truncate(&path, req.size).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::UTimensReq(req) => match self.accessible(user, &req.path)? {
                Some(path) => self.utimens(&path, &req).await?.into(),
                None => unauthorized(),
            },
            AnyMessage::RenameReq(req) => match (self.accessible(user, &req.path)?, self.accessible(user, &req.new_path)?) {
                (Some(from), Some(to)) => self.rename(&from, &to).await?.into(),
                _ => unauthorized(),
            },
            other => bail!("unexpected message {}", other.variant_name()),
        };
        Ok(reply)
    }

    async fn getattr(&self, path: &ResolvedPath) -> anyhow::Result<GetattrReply> {
        let file_type = match metadata_if_exists(&path.local).await? {
            Some(meta) if meta.is_dir() => Some((FileType::Directory, meta)),
            Some(meta) if meta.is_file() => Some((FileType::RegFile, meta)),
            _ => None,
        };

        Ok(match file_type {
            Some((file_type, meta)) => GetattrReply {
                file_type,
                mode: meta.mode() as u64,
                links: meta.nlink(),
                size: meta.size(),
            },
            None => GetattrReply { file_type: FileType::None, mode: 0, links: 0, size: 0 },
        })
    }

    async fn readdir(&self, path: &ResolvedPath) -> anyhow::Result<ReaddirReply> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path.local).await
            .with_context(|| format!("reading directory {}", path.virtual_path))?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        entries.sort();
        Ok(ReaddirReply { entries })
    }

    async fn open(&self, path: &ResolvedPath) -> anyhow::Result<OpenReply> {
        let exists = metadata_if_exists(&path.local).await?.is_some();
        Ok(OpenReply { ok: if exists { 1 } else { 0 } })
    }

    async fn read(&self, path: &ResolvedPath, req: &ReadReq) -> anyhow::Result<ReadReply> {
        if !is_regular_file(&path.local).await? {
            return Ok(ReadReply { data: Vec::new() });
        }
        let offset = u64::try_from(req.off).context("negative read offset")?;

        let mut file = File::open(&path.local).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut data = Vec::new();
        file.take(req.len).read_to_end(&mut data).await?;
        Ok(ReadReply { data })
    }

    async fn write(&self, path: &ResolvedPath, req: &WriteReq) -> anyhow::Result<WriteReply> {
        if !is_regular_file(&path.local).await? {
            return Ok(WriteReply { len: -1 });
        }
        let offset = u64::try_from(req.off).context("negative write offset")?;
        let len = usize::try_from(req.len).unwrap_or(usize::MAX).min(req.data.len());

        let mut file = OpenOptions::new().write(true).open(&path.local).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&req.data[..len]).await?;
        file.flush().await?;

        Ok(WriteReply { len: i32::try_from(len)? })
    }

    async fn create(&self, path: &ResolvedPath, mode: i32) -> anyhow::Result<CreateReply> {
        if metadata_if_exists(&path.local).await?.is_some() {
            return Ok(CreateReply { ok: -1 });
        }
        OpenOptions::new().write(true).create_new(true).open(&path.local).await?;
        tokio::fs::set_permissions(&path.local, Permissions::from_mode(mode_bits(mode)?)).await?;
        Ok(CreateReply { ok: 0 })
    }

    async fn chmod(&self, path: &ResolvedPath, mode: i32) -> anyhow::Result<ChmodReply> {
        if metadata_if_exists(&path.local).await?.is_none() {
            return Ok(ChmodReply { ok: -1 });
        }
        tokio::fs::set_permissions(&path.local, Permissions::from_mode(mode_bits(mode)?)).await?;
        Ok(ChmodReply { ok: 0 })
    }

    async fn mkdir(&self, path: &ResolvedPath, mode: i32) -> anyhow::Result<MkdirReply> {
        if metadata_if_exists(&path.local).await?.is_some() {
            return Ok(MkdirReply { ok: -1 });
        }
        DirBuilder::new()
            .mode(mode_bits(mode)?)
            .create(&path.local).await?;
        Ok(MkdirReply { ok: 0 })
    }

    async fn rmdir(&self, path: &ResolvedPath) -> anyhow::Result<RmdirReply> {
        if !metadata_if_exists(&path.local).await?.is_some_and(|m| m.is_dir()) {
            return Ok(RmdirReply { ok: -1 });
        }
        tokio::fs::remove_dir(&path.local).await?;
        Ok(RmdirReply { ok: 0 })
    }

    async fn unlink(&self, path: &ResolvedPath) -> anyhow::Result<UnlinkReply> {
        if !is_regular_file(&path.local).await? {
            return Ok(UnlinkReply { ok: -1 });
        }
        tokio::fs::remove_file(&path.local).await?;
        Ok(UnlinkReply { ok: 0 })
    }

    async fn truncate(&self, path: &ResolvedPath, size: i64) -> anyhow::Result<TruncateReply> {
        if !is_regular_file(&path.local).await? {
            return Ok(TruncateReply { res: -1 });
        }
        let size = u64::try_from(size).context("negative file size")?;
        let file = OpenOptions::new().write(true).open(&path.local).await?;
        file.set_len(size).await?;
        Ok(TruncateReply { res: 0 })
    }

    async fn rename(&self, from: &ResolvedPath, to: &ResolvedPath) -> anyhow::Result<RenameReply> {
        if !is_regular_file(&from.local).await? {
            return Ok(RenameReply { ok: -1 });
        }
        tokio::fs::rename(&from.local, &to.local).await?;
        Ok(RenameReply { ok: 0 })
    }

    async fn utimens(&self, path: &ResolvedPath, req: &UTimensReq) -> anyhow::Result<UTimensReply> {
        let mut times = FileTimes::new();
        if let Some(accessed) = timestamp(req.asecs, req.ans)? {
            times = times.set_accessed(accessed);
        }
        if let Some(modified) = timestamp(req.msecs, req.mns)? {
            times = times.set_modified(modified);
        }

        let local = path.local.clone();
        let result = tokio::task::spawn_blocking(move || std::fs::File::open(local)?.set_times(times)).await?;
        match result {
            Ok(()) => Ok(UTimensReply { ok: 0 }),
            Err(e) => {
                debug!("setting times of {:?} failed: {}", path.virtual_path, e);
                Ok(UTimensReply { ok: -1 })
            }
        }
    }

    async fn statfs(&self, path: &ResolvedPath) -> anyhow::Result<StatfsReply> {
        let local = path.local.clone();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&local)).await?;

        Ok(match stat {
            Ok(stat) => StatfsReply {
                ok: 0,
                frsize: stat.fragment_size() as u64,
                blksize: stat.block_size() as u64,
                blocks: stat.blocks() as u64,
                bfree: stat.blocks_free() as u64,
                bavail: stat.blocks_available() as u64,
                files: stat.files() as u64,
                ffree: stat.files_free() as u64,
                favail: stat.files_available() as u64,
                namemax: stat.name_max() as u64,
            },
            Err(e) => {
                debug!("statvfs on {:?} failed: {}", path.virtual_path, e);
                StatfsReply { ok: -1, frsize: 0, blksize: 0, blocks: 0, bfree: 0, bavail: 0, files: 0, ffree: 0, favail: 0, namemax: 0 }
            }
        })
    }
}

#[async_trait]
impl RequestHandler for FsServer {
    async fn handle_request(&self, ctx: &ConnectionContext, request: Vec<u8>) -> anyhow::Result<Vec<u8>> {
        let msg = decode_exact::<AnyMessage>(&request)?;

        let user = match ctx.identity.established_or_else(|identity| self.login(identity, &msg)) {
            Ok(user) => user,
            Err(login_reply) => return Ok(encode_to_vec(&login_reply?)),
        };

        debug!("{} from {}", msg.variant_name(), user);
        let reply = self.dispatch(&user, msg).await?;
        Ok(encode_to_vec(&reply))
    }

    fn encode_error(&self, error: &anyhow::Error) -> Vec<u8> {
        encode_to_vec(&AnyMessage::from(ErrorReply::new(format!("Error: {:#}", error))))
    }
}

async fn metadata_if_exists(path: &Path) -> anyhow::Result<Option<Metadata>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn is_regular_file(path: &Path) -> anyhow::Result<bool> {
    Ok(metadata_if_exists(path).await?.is_some_and(|m| m.is_file()))
}

fn mode_bits(mode: i32) -> anyhow::Result<u32> {
    let mode = u32::try_from(mode).with_context(|| format!("invalid mode {}", mode))?;
    Ok(mode & 0o7777)
}

fn timestamp(secs: i64, nanos: i64) -> anyhow::Result<Option<SystemTime>> {
    match nanos {
        UTIME_OMIT => Ok(None),
        UTIME_NOW => Ok(Some(SystemTime::now())),
        _ => {
            let nanos = u64::try_from(nanos).ok()
                .filter(|n| *n < 1_000_000_000)
                .ok_or_else(|| anyhow!("invalid nanoseconds {}", nanos))?;
            let whole_secs = Duration::from_secs(secs.unsigned_abs());
            let t = if secs >= 0 { UNIX_EPOCH.checked_add(whole_secs) } else { UNIX_EPOCH.checked_sub(whole_secs) };
            t.and_then(|t| t.checked_add(Duration::from_nanos(nanos)))
                .map(Some)
                .ok_or_else(|| anyhow!("timestamp out of range: {}s", secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::MockAuthorizer;
    use rstest::rstest;
    use tempfile::TempDir;

    fn authorizer() -> MockAuthorizer {
        let mut authorizer = MockAuthorizer::new();
        authorizer.expect_authorize()
            .returning(|user, password| user == "alice" && password == "secret");
        authorizer.expect_authorize_path()
            .returning(|user, path| !path.starts_with("/private") || user == "root");
        authorizer
    }

    fn setup() -> (TempDir, FsServer) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::create_dir(dir.path().join("private")).unwrap();
        std::fs::write(dir.path().join("private").join("secret.txt"), b"secret").unwrap();

        let server = FsServer::new(dir.path().to_path_buf(), Arc::new(authorizer()));
        (dir, server)
    }

    fn context() -> ConnectionContext {
        ConnectionContext {
            connection_id: 0,
            peer_addr: None,
            identity: Default::default(),
        }
    }

    fn logged_in(user: &str) -> ConnectionContext {
        let ctx = context();
        let _ = ctx.identity.established_or_else(|identity| *identity = Some(user.to_string()));
        ctx
    }

    async fn request(server: &FsServer, ctx: &ConnectionContext, msg: impl Into<AnyMessage>) -> AnyMessage {
        let reply = match server.handle_request(ctx, encode_to_vec(&msg.into())).await {
            Ok(reply) => reply,
            Err(e) => server.encode_error(&e),
        };
        decode_exact(&reply).unwrap()
    }

    fn error(text: &str) -> AnyMessage {
        ErrorReply::new(text).into()
    }

    #[tokio::test]
    async fn test_login_gate() {
        let (_dir, server) = setup();
        let ctx = context();

        let reply = request(&server, &ctx, GetattrReq { path: "/hello.txt".to_string() }).await;
        assert_eq!(reply, error("Error: Not logged in"));

        let reply = request(&server, &ctx, LoginReq { username: "alice".to_string(), password: "wrong".to_string() }).await;
        assert_eq!(reply, error("Error: Invalid username or password"));
        assert_eq!(ctx.identity.get(), None);

        let reply = request(&server, &ctx, LoginReq { username: "alice".to_string(), password: "secret".to_string() }).await;
        assert_eq!(reply, LoginReply {}.into());
        assert_eq!(ctx.identity.get(), Some("alice".to_string()));

        let reply = request(&server, &ctx, KeepAliveReq {}).await;
        assert_eq!(reply, KeepAliveReply {}.into());

        let reply = request(&server, &ctx, LoginReq { username: "alice".to_string(), password: "secret".to_string() }).await;
        assert_eq!(reply, error("Error: unexpected message LoginReq"));
    }

    #[tokio::test]
    async fn test_login_asks_authorizer_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut authorizer = MockAuthorizer::new();
        authorizer.expect_authorize()
            .withf(|user, password| user == "bob" && password == "pw")
            .times(1)
            .return_const(true);
        let server = FsServer::new(dir.path().to_path_buf(), Arc::new(authorizer));
        let ctx = context();

        let reply = request(&server, &ctx, LoginReq { username: "bob".to_string(), password: "pw".to_string() }).await;
        assert_eq!(reply, LoginReply {}.into());
        assert_eq!(request(&server, &ctx, KeepAliveReq {}).await, KeepAliveReply {}.into());
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let err = server.handle_request(&ctx, vec![0, 0, 0]).await.unwrap_err();
        let reply = decode_exact::<AnyMessage>(&server.encode_error(&err)).unwrap();
        assert!(matches!(reply, AnyMessage::ErrorReply(e) if e.error.starts_with("Error: ")));
    }

    #[tokio::test]
    async fn test_getattr() {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let AnyMessage::GetattrReply(file) = request(&server, &ctx, GetattrReq { path: "/hello.txt".to_string() }).await else {
            panic!("expected GetattrReply");
        };
        assert_eq!(file.file_type, FileType::RegFile);
        assert_eq!(file.size, 11);
        assert_eq!(file.links, 1);

        let AnyMessage::GetattrReply(dir) = request(&server, &ctx, GetattrReq { path: "/sub".to_string() }).await else {
            panic!("expected GetattrReply");
        };
        assert_eq!(dir.file_type, FileType::Directory);
        assert_ne!(dir.mode, 0);

        let missing = request(&server, &ctx, GetattrReq { path: "/missing".to_string() }).await;
        assert_eq!(missing, GetattrReply { file_type: FileType::None, mode: 0, links: 0, size: 0 }.into());

        let below_file = request(&server, &ctx, GetattrReq { path: "/hello.txt/x".to_string() }).await;
        assert_eq!(below_file, GetattrReply { file_type: FileType::None, mode: 0, links: 0, size: 0 }.into());
    }

    #[tokio::test]
    async fn test_readdir() {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let reply = request(&server, &ctx, ReaddirReq { path: "/".to_string() }).await;
        assert_eq!(reply, ReaddirReply { entries: vec!["hello.txt".to_string(), "private".to_string(), "sub".to_string()] }.into());

        let reply = request(&server, &ctx, ReaddirReq { path: "/sub".to_string() }).await;
        assert_eq!(reply, ReaddirReply { entries: vec![] }.into());

        let reply = request(&server, &ctx, ReaddirReq { path: "/missing".to_string() }).await;
        assert!(matches!(reply, AnyMessage::ErrorReply(_)));
    }

    #[tokio::test]
    async fn test_open() {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        assert_eq!(request(&server, &ctx, OpenReq { path: "/hello.txt".to_string() }).await, OpenReply { ok: 1 }.into());
        assert_eq!(request(&server, &ctx, OpenReq { path: "/missing".to_string() }).await, OpenReply { ok: 0 }.into());
    }

    #[rstest]
    #[case::whole(0, 100, b"hello world".as_slice())]
    #[case::prefix(0, 5, b"hello".as_slice())]
    #[case::middle(6, 3, b"wor".as_slice())]
    #[case::past_end(20, 5, b"".as_slice())]
    #[tokio::test]
    async fn test_read(#[case] off: i64, #[case] len: u64, #[case] expected: &[u8]) {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let reply = request(&server, &ctx, ReadReq { path: "/hello.txt".to_string(), off, len }).await;
        assert_eq!(reply, ReadReply { data: expected.to_vec() }.into());
    }

    #[tokio::test]
    async fn test_read_directory_is_empty() {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let reply = request(&server, &ctx, ReadReq { path: "/sub".to_string(), off: 0, len: 10 }).await;
        assert_eq!(reply, ReadReply { data: vec![] }.into());
    }

    #[tokio::test]
    async fn test_create_write_truncate() {
        let (dir, server) = setup();
        let ctx = logged_in("alice");

        assert_eq!(request(&server, &ctx, CreateReq { path: "/new.txt".to_string(), mode: 0o640 }).await, CreateReply { ok: 0 }.into());
        assert_eq!(request(&server, &ctx, CreateReq { path: "/new.txt".to_string(), mode: 0o640 }).await, CreateReply { ok: -1 }.into());
        let mode = std::fs::metadata(dir.path().join("new.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o640);

        let reply = request(&server, &ctx, WriteReq { path: "/new.txt".to_string(), off: 0, len: 5, data: b"abcdefgh".to_vec() }).await;
        assert_eq!(reply, WriteReply { len: 5 }.into());
        let reply = request(&server, &ctx, WriteReq { path: "/new.txt".to_string(), off: 3, len: 10, data: b"XY".to_vec() }).await;
        assert_eq!(reply, WriteReply { len: 2 }.into());
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"abcXY".to_vec());

        assert_eq!(request(&server, &ctx, TruncateReq { path: "/new.txt".to_string(), size: 2 }).await, TruncateReply { res: 0 }.into());
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"ab".to_vec());

        assert_eq!(request(&server, &ctx, WriteReq { path: "/sub".to_string(), off: 0, len: 1, data: vec![1] }).await, WriteReply { len: -1 }.into());
        assert_eq!(request(&server, &ctx, TruncateReq { path: "/missing".to_string(), size: 0 }).await, TruncateReply { res: -1 }.into());
    }

    #[tokio::test]
    async fn test_chmod() {
        let (dir, server) = setup();
        let ctx = logged_in("alice");

        assert_eq!(request(&server, &ctx, ChmodReq { path: "/hello.txt".to_string(), mode: 0o600 }).await, ChmodReply { ok: 0 }.into());
        let mode = std::fs::metadata(dir.path().join("hello.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o600);

        assert_eq!(request(&server, &ctx, ChmodReq { path: "/missing".to_string(), mode: 0o600 }).await, ChmodReply { ok: -1 }.into());
    }

    #[tokio::test]
    async fn test_directories() {
        let (dir, server) = setup();
        let ctx = logged_in("alice");

        assert_eq!(request(&server, &ctx, MkdirReq { path: "/d".to_string(), mode: 0o755 }).await, MkdirReply { ok: 0 }.into());
        assert!(dir.path().join("d").is_dir());
        assert_eq!(request(&server, &ctx, MkdirReq { path: "/d".to_string(), mode: 0o755 }).await, MkdirReply { ok: -1 }.into());

        assert_eq!(request(&server, &ctx, RmdirReq { path: "/hello.txt".to_string() }).await, RmdirReply { ok: -1 }.into());
        assert_eq!(request(&server, &ctx, RmdirReq { path: "/d".to_string() }).await, RmdirReply { ok: 0 }.into());
        assert!(!dir.path().join("d").exists());
    }

    #[tokio::test]
    async fn test_unlink_and_rename() {
        let (dir, server) = setup();
        let ctx = logged_in("alice");

        assert_eq!(request(&server, &ctx, RenameReq { path: "/hello.txt".to_string(), new_path: "/sub/moved.txt".to_string() }).await, RenameReply { ok: 0 }.into());
        assert_eq!(std::fs::read(dir.path().join("sub").join("moved.txt")).unwrap(), b"hello world".to_vec());
        assert_eq!(request(&server, &ctx, RenameReq { path: "/hello.txt".to_string(), new_path: "/x".to_string() }).await, RenameReply { ok: -1 }.into());

        assert_eq!(request(&server, &ctx, UnlinkReq { path: "/sub".to_string() }).await, UnlinkReply { ok: -1 }.into());
        assert_eq!(request(&server, &ctx, UnlinkReq { path: "/sub/moved.txt".to_string() }).await, UnlinkReply { ok: 0 }.into());
        assert!(!dir.path().join("sub").join("moved.txt").exists());
    }

    #[tokio::test]
    async fn test_utimens() {
        let (dir, server) = setup();
        let ctx = logged_in("alice");

        let reply = request(&server, &ctx, UTimensReq { path: "/hello.txt".to_string(), asecs: 0, ans: UTIME_OMIT, msecs: 1_000_000, mns: 500 }).await;
        assert_eq!(reply, UTimensReply { ok: 0 }.into());
        let modified = std::fs::metadata(dir.path().join("hello.txt")).unwrap().modified().unwrap();
        assert_eq!(modified, UNIX_EPOCH + Duration::new(1_000_000, 500));

        let reply = request(&server, &ctx, UTimensReq { path: "/missing".to_string(), asecs: 0, ans: 0, msecs: 0, mns: 0 }).await;
        assert_eq!(reply, UTimensReply { ok: -1 }.into());
    }

    #[rstest]
    #[case::omit(5, UTIME_OMIT, None)]
    #[case::epoch(0, 0, Some(UNIX_EPOCH))]
    #[case::positive(10, 20, Some(UNIX_EPOCH + Duration::new(10, 20)))]
    #[case::negative(-10, 0, Some(UNIX_EPOCH - Duration::from_secs(10)))]
    fn test_timestamp(#[case] secs: i64, #[case] nanos: i64, #[case] expected: Option<SystemTime>) {
        assert_eq!(timestamp(secs, nanos).unwrap(), expected);
    }

    #[rstest]
    #[case::negative_nanos(-1)]
    #[case::too_many_nanos(1_000_000_000)]
    fn test_timestamp_invalid(#[case] nanos: i64) {
        assert!(timestamp(0, nanos).is_err());
    }

    #[tokio::test]
    async fn test_statfs() {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let AnyMessage::StatfsReply(reply) = request(&server, &ctx, StatfsReq { path: "/".to_string() }).await else {
            panic!("expected StatfsReply");
        };
        assert_eq!(reply.ok, 0);
        assert!(reply.namemax > 0);

        let AnyMessage::StatfsReply(reply) = request(&server, &ctx, StatfsReq { path: "/missing".to_string() }).await else {
            panic!("expected StatfsReply");
        };
        assert_eq!(reply.ok, -1);
    }

    #[rstest]
    #[case::read(ReadReq { path: "/private/secret.txt".to_string(), off: 0, len: 10 }.into())]
    #[case::open(OpenReq { path: "/private/secret.txt".to_string() }.into())]
    #[case::readdir(ReaddirReq { path: "/private".to_string() }.into())]
    #[case::unlink(UnlinkReq { path: "/private/secret.txt".to_string() }.into())]
    #[case::duplicate_separator(ReadReq { path: "//private/./secret.txt".to_string(), off: 0, len: 10 }.into())]
    #[case::rename_source(RenameReq { path: "/private/secret.txt".to_string(), new_path: "/stolen.txt".to_string() }.into())]
    #[case::rename_target(RenameReq { path: "/hello.txt".to_string(), new_path: "/private/hello.txt".to_string() }.into())]
    #[tokio::test]
    async fn test_unauthorized_path(#[case] msg: AnyMessage) {
        let (dir, server) = setup();
        let ctx = logged_in("alice");

        assert_eq!(request(&server, &ctx, msg).await, error(UNAUTHORIZED_PATH));
        assert!(dir.path().join("private").join("secret.txt").exists());
        assert!(dir.path().join("hello.txt").exists());
    }

    #[tokio::test]
    async fn test_authorized_user_reaches_private_path() {
        let (_dir, server) = setup();
        let ctx = logged_in("root");

        let reply = request(&server, &ctx, ReadReq { path: "/private/secret.txt".to_string(), off: 0, len: 10 }).await;
        assert_eq!(reply, ReadReply { data: b"secret".to_vec() }.into());
    }

    #[rstest]
    #[case::parent("/../etc/passwd")]
    #[case::nested_parent("/sub/../../x")]
    #[tokio::test]
    async fn test_path_escaping_root(#[case] path: &str) {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let reply = request(&server, &ctx, GetattrReq { path: path.to_string() }).await;
        assert!(matches!(reply, AnyMessage::ErrorReply(e) if e.error.contains("leaves the served directory")));
    }

    #[tokio::test]
    async fn test_unexpected_message() {
        let (_dir, server) = setup();
        let ctx = logged_in("alice");

        let reply = request(&server, &ctx, OpenReply { ok: 1 }).await;
        assert_eq!(reply, error("Error: unexpected message OpenReply"));
    }

    #[test]
    fn test_config_validation() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsServerConfig {
            root: dir.path().join("missing"),
            users_path: dir.path().join("users"),
            acl_path: None,
        };
        assert!(config.validate().is_err());
        assert!(FsServer::from_config(&config).is_err());
    }
}
