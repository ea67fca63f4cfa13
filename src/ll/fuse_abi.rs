//! FUSE kernel interface.
//!
//! Bit-exact types used for communication between the kernel driver and this
//! server, as defined by `fuse_kernel.h` for protocol 7.31. Only the subset
//! the volume server actually speaks is kept: the fixed namespace needs no
//! link/rename/xattr plumbing.
//!
//! Request structs implement [`FromBytes`] so they can be lifted straight out
//! of the header or payload buffers; reply structs implement [`IntoBytes`]
//! so they can be laid down into the scratch buffer without intermediate
//! copies.

#![allow(missing_docs)]
#![allow(non_camel_case_types)]

use std::mem;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

pub const FUSE_ROOT_ID: u64 = 1;

/// Opcodes the kernel may send us. Anything missing from this table is
/// answered with `-ENOSYS`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum fuse_opcode {
    FUSE_LOOKUP = 1,
    FUSE_GETATTR = 3,
    FUSE_SETATTR = 4,
    FUSE_OPEN = 14,
    FUSE_READ = 15,
    FUSE_WRITE = 16,
    FUSE_RELEASE = 18,
    FUSE_INIT = 26,
    FUSE_OPENDIR = 27,
    FUSE_READDIR = 28,
    FUSE_RELEASEDIR = 29,
}

bitflags! {
    /// `FUSE_INIT` capability bits (the 7.31 single-word set).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u32 {
        /// asynchronous read requests
        const FUSE_ASYNC_READ = 1 << 0;
        /// handles the O_TRUNC open flag in the filesystem
        const FUSE_ATOMIC_O_TRUNC = 1 << 3;
        /// filesystem handles lookups of "." and ".."
        const FUSE_EXPORT_SUPPORT = 1 << 4;
        /// filesystem can handle write size larger than 4kB
        const FUSE_BIG_WRITES = 1 << 5;
        /// kernel supports splice write on the device
        const FUSE_SPLICE_WRITE = 1 << 7;
        /// kernel supports splice move on the device
        const FUSE_SPLICE_MOVE = 1 << 8;
        /// kernel supports splice read on the device
        const FUSE_SPLICE_READ = 1 << 9;
        /// ioctl on directories is supported
        const FUSE_IOCTL_DIR = 1 << 11;
        /// automatically invalidate cached pages
        const FUSE_AUTO_INVAL_DATA = 1 << 12;
        /// asynchronous direct I/O submission
        const FUSE_ASYNC_DIO = 1 << 15;
        /// use writeback cache for buffered writes
        const FUSE_WRITEBACK_CACHE = 1 << 16;
        /// allow parallel lookups and readdir
        const FUSE_PARALLEL_DIROPS = 1 << 18;
        /// fs handles killing suid/sgid/cap on write/chown/trunc
        const FUSE_HANDLE_KILLPRIV = 1 << 19;
        /// init_out.max_pages contains the max number of req pages
        const FUSE_MAX_PAGES = 1 << 22;
    }
}

bitflags! {
    /// Flags returned in open responses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FopenFlags: u32 {
        /// bypass page cache for this open file
        const FOPEN_DIRECT_IO = 1 << 0;
        /// don't invalidate the data cache on open
        const FOPEN_KEEP_CACHE = 1 << 1;
        /// the file is not seekable
        const FOPEN_NONSEEKABLE = 1 << 2;
        /// allow caching this directory
        const FOPEN_CACHE_DIR = 1 << 3;
    }
}

pub mod consts {
    // Bitmasks for fuse_setattr_in.valid
    pub const FATTR_SIZE: u32 = 1 << 3;
    pub const FATTR_FH: u32 = 1 << 6;

    // Bitmasks for fuse_getattr_in.getattr_flags
    pub const FUSE_GETATTR_FH: u32 = 1 << 0;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_entry_out {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_getattr_in {
    pub getattr_flags: u32,
    pub dummy: u32,
    pub fh: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_attr_out {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: fuse_attr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_setattr_in {
    pub valid: u32,
    pub padding: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub unused4: u32,
    pub uid: u32,
    pub gid: u32,
    pub unused5: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_open_in {
    pub flags: u32,
    pub unused: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_open_out {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_release_in {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_read_in {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_write_in {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_write_out {
    pub size: u32,
    pub padding: u32,
}

/// The 7.8-compatible prefix of the init request. Kernels past 7.36 send a
/// longer message; the extra words are capability bits we do not negotiate.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_init_in {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_init_out {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
    pub max_pages: u16,
    pub padding: u16,
    pub unused: [u32; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_in_header {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_out_header {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

/// Fixed-size prefix of a directory entry; `namelen` bytes of name follow,
/// zero-padded to [`dirent_align`].
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct fuse_dirent {
    pub ino: u64,
    pub off: u64,
    pub namelen: u32,
    pub typ: u32,
    // followed by name of namelen bytes
}

pub const FUSE_NAME_OFFSET: usize = mem::size_of::<fuse_dirent>();

/// Directory entries are padded to 8-byte boundaries.
pub const fn dirent_align(len: usize) -> usize {
    (len + 7) & !7
}

/// The `d_type` encoding used in directory entries.
pub const fn dirent_type(mode: u32) -> u32 {
    (mode & libc::S_IFMT) >> 12
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_the_kernel() {
        assert_eq!(mem::size_of::<fuse_in_header>(), 40);
        assert_eq!(mem::size_of::<fuse_out_header>(), 16);
        assert_eq!(mem::size_of::<fuse_attr>(), 88);
        assert_eq!(mem::size_of::<fuse_entry_out>(), 128);
        assert_eq!(mem::size_of::<fuse_attr_out>(), 104);
        assert_eq!(mem::size_of::<fuse_getattr_in>(), 16);
        assert_eq!(mem::size_of::<fuse_setattr_in>(), 88);
        assert_eq!(mem::size_of::<fuse_open_in>(), 8);
        assert_eq!(mem::size_of::<fuse_open_out>(), 16);
        assert_eq!(mem::size_of::<fuse_release_in>(), 24);
        assert_eq!(mem::size_of::<fuse_read_in>(), 40);
        assert_eq!(mem::size_of::<fuse_write_in>(), 40);
        assert_eq!(mem::size_of::<fuse_write_out>(), 8);
        assert_eq!(mem::size_of::<fuse_init_in>(), 16);
        assert_eq!(mem::size_of::<fuse_init_out>(), 64);
        assert_eq!(mem::size_of::<fuse_dirent>(), 24);
    }

    #[test]
    fn dirent_alignment() {
        assert_eq!(dirent_align(24), 24);
        assert_eq!(dirent_align(25), 32);
        assert_eq!(dirent_align(FUSE_NAME_OFFSET + "volume".len()), 32);
    }

    #[test]
    fn dirent_types() {
        assert_eq!(dirent_type(libc::S_IFDIR | 0o777), libc::DT_DIR as u32);
        assert_eq!(dirent_type(libc::S_IFREG | 0o777), libc::DT_REG as u32);
    }

    #[test]
    fn opcode_round_trip() {
        assert_eq!(fuse_opcode::try_from(1).unwrap(), fuse_opcode::FUSE_LOOKUP);
        assert_eq!(fuse_opcode::try_from(26).unwrap(), fuse_opcode::FUSE_INIT);
        assert!(fuse_opcode::try_from(4096).is_err());
    }
}
