//! The remote filesystem protocol: one request and one reply type per operation, all carried as
//!  alternatives of [AnyMessage].
//!
//! Numeric result fields (`ok`, `res`, `len` in write replies) follow the POSIX convention of
//!  non-negative for success and -1 for failure. Errors that prevent an operation from being
//!  attempted at all (authorization, malformed requests) are reported as [ErrorReply] instead.

use transport::{wire_enum, wire_struct, wire_union};

wire_enum! {
    pub enum FileType {
        /// the path does not exist, or is neither a directory nor a regular file
        None,
        Directory,
        RegFile,
        Symlink,
    }
}

wire_struct! {
    pub struct ErrorReply {
        pub error: String,
    }
}

wire_struct! {
    pub struct KeepAliveReq {}
}

wire_struct! {
    pub struct KeepAliveReply {}
}

wire_struct! {
    pub struct LoginReq {
        pub username: String,
        pub password: String,
    }
}

wire_struct! {
    pub struct LoginReply {}
}

wire_struct! {
    pub struct GetattrReq {
        pub path: String,
    }
}

wire_struct! {
    pub struct GetattrReply {
        pub file_type: FileType,
        pub mode: u64,
        pub links: u64,
        pub size: u64,
    }
}

wire_struct! {
    pub struct ReaddirReq {
        pub path: String,
    }
}

wire_struct! {
    pub struct ReaddirReply {
        /// names of the directory's entries, without the directory's own path
        pub entries: Vec<String>,
    }
}

wire_struct! {
    pub struct OpenReq {
        pub path: String,
    }
}

wire_struct! {
    pub struct OpenReply {
        /// 1 if the path exists, 0 otherwise
        pub ok: i32,
    }
}

wire_struct! {
    pub struct ReadReq {
        pub path: String,
        pub off: i64,
        pub len: u64,
    }
}

wire_struct! {
    pub struct ReadReply {
        pub data: Vec<u8>,
    }
}

wire_struct! {
    pub struct WriteReq {
        pub path: String,
        pub off: i64,
        pub len: u64,
        pub data: Vec<u8>,
    }
}

wire_struct! {
    pub struct WriteReply {
        pub len: i32,
    }
}

wire_struct! {
    pub struct CreateReq {
        pub path: String,
        pub mode: i32,
    }
}

wire_struct! {
    pub struct CreateReply {
        pub ok: i32,
    }
}

wire_struct! {
    pub struct MkdirReq {
        pub path: String,
        pub mode: i32,
    }
}

wire_struct! {
    pub struct MkdirReply {
        pub ok: i32,
    }
}

wire_struct! {
    pub struct RmdirReq {
        pub path: String,
    }
}

wire_struct! {
    pub struct RmdirReply {
        pub ok: i32,
    }
}

wire_struct! {
    pub struct UnlinkReq {
        pub path: String,
    }
}

wire_struct! {
    pub struct UnlinkReply {
        pub ok: i32,
    }
}

wire_struct! {
    pub struct TruncateReq {
        pub path: String,
        pub size: i64,
    }
}

wire_struct! {
    pub struct TruncateReply {
        pub res: i32,
    }
}

wire_struct! {
    pub struct RenameReq {
        pub path: String,
        pub new_path: String,
    }
}

wire_struct! {
    pub struct RenameReply {
        pub ok: i32,
    }
}

wire_struct! {
    /// access and modification time, each as seconds and nanoseconds since the epoch
    pub struct UTimensReq {
        pub path: String,
        pub asecs: i64,
        pub ans: i64,
        pub msecs: i64,
        pub mns: i64,
    }
}

wire_struct! {
    pub struct UTimensReply {
        pub ok: i32,
    }
}

wire_struct! {
    pub struct StatfsReq {
        pub path: String,
    }
}

wire_struct! {
    pub struct StatfsReply {
        pub ok: i32,
        pub frsize: u64,
        pub blksize: u64,
        pub blocks: u64,
        pub bfree: u64,
        pub bavail: u64,
        pub files: u64,
        pub ffree: u64,
        pub favail: u64,
        pub namemax: u64,
    }
}

wire_struct! {
    pub struct ChmodReq {
        pub path: String,
        pub mode: i32,
    }
}

wire_struct! {
    pub struct ChmodReply {
        pub ok: i32,
    }
}

wire_union! {
    /// Every payload exchanged between client and server. The variant order defines the wire
    ///  indices and must not change.
    pub enum AnyMessage {
        ErrorReply(ErrorReply),
        KeepAliveReq(KeepAliveReq),
        KeepAliveReply(KeepAliveReply),
        LoginReq(LoginReq),
        LoginReply(LoginReply),
        GetattrReq(GetattrReq),
        GetattrReply(GetattrReply),
        ReaddirReq(ReaddirReq),
        ReaddirReply(ReaddirReply),
        OpenReq(OpenReq),
        OpenReply(OpenReply),
        ReadReq(ReadReq),
        ReadReply(ReadReply),
        WriteReq(WriteReq),
        WriteReply(WriteReply),
        CreateReq(CreateReq),
        CreateReply(CreateReply),
        MkdirReq(MkdirReq),
        MkdirReply(MkdirReply),
        RmdirReq(RmdirReq),
        RmdirReply(RmdirReply),
        UnlinkReq(UnlinkReq),
        UnlinkReply(UnlinkReply),
        TruncateReq(TruncateReq),
        TruncateReply(TruncateReply),
        RenameReq(RenameReq),
        RenameReply(RenameReply),
        UTimensReq(UTimensReq),
        UTimensReply(UTimensReply),
        StatfsReply(StatfsReply),
        StatfsReq(StatfsReq),
        ChmodReq(ChmodReq),
        ChmodReply(ChmodReply),
    }
}

impl ErrorReply {
    pub fn new(error: impl Into<String>) -> ErrorReply {
        ErrorReply { error: error.into() }
    }
}
