//! Low-level building blocks: the kernel wire format and the index newtypes
//! used to name ring-registered resources.

pub mod fuse_abi;

use io_uring::types;

/// Index into the ring's registered (fixed) file table.
///
/// The core never touches raw file descriptors; every I/O operation names
/// its file by fixed index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFd(pub u32);

impl FixedFd {
    /// The `io-uring` fixed-file target for this index.
    pub fn fixed(self) -> types::Fixed {
        types::Fixed(self.0)
    }
}

/// Index into the ring's registered buffer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufIndex(pub u16);

/// Inode number in the fixed namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct INodeNo(pub u64);

impl INodeNo {
    /// The root directory.
    pub const ROOT: INodeNo = INodeNo(1);
    /// The single regular file exposing the backing volume.
    pub const VOLUME: INodeNo = INodeNo(3);
}

/// The `unique` id of an in-flight FUSE request. Replies must echo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub u64);
