//! Fatal, out-of-protocol errors.
//!
//! Every fatal failure is tied to the setup or serving stage it happened in,
//! and each stage documents itself as the process exit code. In-protocol
//! errors (negative errnos inside `fuse_out_header`) never appear here; they
//! are ordinary successful reply transactions.

use std::error;
use std::fmt;
use std::io;

use crate::ll::fuse_abi::InitFlags;

/// A fatal error and the stage that produced it.
#[derive(Debug)]
pub enum ServiceError {
    /// Backing file or mountpoint unusable (exit 1).
    BackingFile(io::Error),
    /// `/dev/fuse` could not be opened or cloned (exit 2).
    OpenDevice(io::Error),
    /// The `mount(2)` call failed (exit 3).
    Mount(io::Error),
    /// Reading the first init message failed (exit 4).
    InitRead(io::Error),
    /// The init message was malformed or the protocol too old (exit 5).
    InitProtocol(&'static str),
    /// Writing the version-mismatch reply failed (exit 6).
    InitVersionReply(io::Error),
    /// Re-reading init after a version reply failed (exit 7).
    InitReread(io::Error),
    /// The kernel lacks capabilities the pipeline needs (exit 8).
    MissingCapabilities(InitFlags),
    /// Writing the init reply failed (exit 9).
    InitReply(io::Error),
    /// io_uring could not be set up (exit 10).
    RingSetup(io::Error),
    /// A per-slot pipe could not be created (exit 11).
    PipeCreate(io::Error),
    /// A per-slot pipe could not be grown to one full message (exit 12).
    PipeSize(io::Error),
    /// Registering the fixed-file table failed (exit 13).
    RegisterFiles(io::Error),
    /// Registering the buffer arenas failed (exit 14).
    RegisterBuffers(io::Error),
    /// The backing file could not be stat'ed (exit 15).
    BackingStat(io::Error),
    /// Submitting to the ring failed (exit 18).
    Submit(io::Error),
    /// A request task reported a fatal error (exit 19).
    TaskFailed(io::Error),
}

impl ServiceError {
    pub fn exit_code(&self) -> i32 {
        use ServiceError::*;
        match self {
            BackingFile(_) => 1,
            OpenDevice(_) => 2,
            Mount(_) => 3,
            InitRead(_) => 4,
            InitProtocol(_) => 5,
            InitVersionReply(_) => 6,
            InitReread(_) => 7,
            MissingCapabilities(_) => 8,
            InitReply(_) => 9,
            RingSetup(_) => 10,
            PipeCreate(_) => 11,
            PipeSize(_) => 12,
            RegisterFiles(_) => 13,
            RegisterBuffers(_) => 14,
            BackingStat(_) => 15,
            Submit(_) => 18,
            TaskFailed(_) => 19,
        }
    }

}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ServiceError::*;
        match self {
            BackingFile(err) => write!(f, "backing file or mountpoint unusable: {err}"),
            OpenDevice(err) => write!(f, "opening /dev/fuse failed: {err}"),
            Mount(err) => write!(f, "mounting the fuse filesystem failed: {err}"),
            InitRead(err) => write!(f, "reading FUSE_INIT failed: {err}"),
            InitProtocol(reason) => write!(f, "FUSE_INIT protocol error: {reason}"),
            InitVersionReply(err) => write!(f, "writing the version reply failed: {err}"),
            InitReread(err) => write!(f, "re-reading FUSE_INIT failed: {err}"),
            MissingCapabilities(missing) => {
                write!(f, "kernel is missing fuse capabilities: {missing:?}")
            }
            InitReply(err) => write!(f, "writing the FUSE_INIT reply failed: {err}"),
            RingSetup(err) => write!(f, "io_uring setup failed: {err}"),
            PipeCreate(err) => write!(f, "creating a request pipe failed: {err}"),
            PipeSize(err) => write!(f, "sizing a request pipe failed: {err}"),
            RegisterFiles(err) => write!(f, "registering fixed files failed: {err}"),
            RegisterBuffers(err) => write!(f, "registering fixed buffers failed: {err}"),
            BackingStat(err) => write!(f, "stat of the backing file failed: {err}"),
            Submit(err) => write!(f, "io_uring submit failed: {err}"),
            TaskFailed(err) => write!(f, "request task failed: {err}"),
        }
    }
}

impl error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use ServiceError::*;
        match self {
            BackingFile(err) | OpenDevice(err) | Mount(err) | InitRead(err)
            | InitVersionReply(err) | InitReread(err) | InitReply(err) | RingSetup(err)
            | PipeCreate(err) | PipeSize(err) | RegisterFiles(err) | RegisterBuffers(err)
            | BackingStat(err) | Submit(err) | TaskFailed(err) => Some(err),
            InitProtocol(_) | MissingCapabilities(_) => None,
        }
    }
}
