//! The fixed namespace: one root directory holding one regular file named
//! `volume`, backed by the host file handed over at startup.
//!
//! Nothing here is stored or mutated. Attributes are synthesized from the
//! backing file size on every request; inodes 2 and 4 exist only inside
//! directory listings.

use crate::ll::INodeNo;
use crate::ll::fuse_abi::{dirent_type, fuse_attr, fuse_entry_out};
use crate::reply::push_dirent;

/// Name of the single regular file.
pub const VOLUME_NAME: &[u8] = b"volume";

/// Seconds of validity the kernel may cache entries and attributes for.
pub const ATTR_TIMEOUT_SECS: u64 = 3600;

const ACCESS_ALL: u32 = 0o777;

/// Attribute source for the fixed namespace.
#[derive(Debug, Clone, Copy)]
pub struct Volume {
    pub backing_size: u64,
    pub blksize: u32,
}

impl Volume {
    pub fn new(backing_size: u64, blksize: u32) -> Volume {
        Volume {
            backing_size,
            blksize,
        }
    }

    pub fn root_attr(&self) -> fuse_attr {
        fuse_attr {
            ino: INodeNo::ROOT.0,
            mode: libc::S_IFDIR | ACCESS_ALL,
            ..zeroed_attr()
        }
    }

    pub fn file_attr(&self) -> fuse_attr {
        fuse_attr {
            ino: INodeNo::VOLUME.0,
            size: self.backing_size,
            blocks: self.backing_size.div_ceil(512),
            mode: libc::S_IFREG | ACCESS_ALL,
            blksize: self.blksize,
            ..zeroed_attr()
        }
    }

    /// Attributes by node id; `None` for ids outside the namespace.
    pub fn attr_for(&self, node: INodeNo) -> Option<fuse_attr> {
        match node {
            INodeNo::ROOT => Some(self.root_attr()),
            INodeNo::VOLUME => Some(self.file_attr()),
            _ => None,
        }
    }

    /// Resolve a name in the root directory.
    pub fn lookup(&self, name: &[u8]) -> Option<fuse_entry_out> {
        if name != VOLUME_NAME {
            return None;
        }
        Some(fuse_entry_out {
            nodeid: INodeNo::VOLUME.0,
            generation: 0,
            entry_valid: ATTR_TIMEOUT_SECS,
            attr_valid: ATTR_TIMEOUT_SECS,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr: self.file_attr(),
        })
    }

    /// The complete root listing, appended to `buf` as aligned dirents.
    pub fn append_dirents(&self, buf: &mut Vec<u8>) {
        let dir_type = dirent_type(libc::S_IFDIR);
        let file_type = dirent_type(libc::S_IFREG);
        push_dirent(buf, 2, 1, dir_type, b".");
        push_dirent(buf, 3, 2, dir_type, b"..");
        push_dirent(buf, 4, 3, file_type, VOLUME_NAME);
    }
}

fn zeroed_attr() -> fuse_attr {
    fuse_attr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        atimensec: 0,
        mtimensec: 0,
        ctimensec: 0,
        mode: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
        padding: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll::fuse_abi::{FUSE_NAME_OFFSET, dirent_align, fuse_dirent};
    use zerocopy::FromBytes;

    const VOL: Volume = Volume {
        backing_size: 1_048_576,
        blksize: 4096,
    };

    #[test]
    fn file_attrs_track_backing_size() {
        let attr = VOL.file_attr();
        assert_eq!(attr.ino, 3);
        assert_eq!(attr.mode, libc::S_IFREG | 0o777);
        assert_eq!(attr.size, 1_048_576);
        assert_eq!(attr.blocks, 2048);
        assert_eq!(attr.blksize, 4096);
    }

    #[test]
    fn block_count_rounds_up() {
        let vol = Volume::new(513, 4096);
        assert_eq!(vol.file_attr().blocks, 2);
        assert_eq!(Volume::new(0, 4096).file_attr().blocks, 0);
    }

    #[test]
    fn root_attrs() {
        let attr = VOL.root_attr();
        assert_eq!(attr.ino, 1);
        assert_eq!(attr.mode, libc::S_IFDIR | 0o777);
    }

    #[test]
    fn attr_for_rejects_unknown_nodes() {
        assert!(VOL.attr_for(INodeNo::ROOT).is_some());
        assert!(VOL.attr_for(INodeNo::VOLUME).is_some());
        assert!(VOL.attr_for(INodeNo(2)).is_none());
        assert!(VOL.attr_for(INodeNo(99)).is_none());
    }

    #[test]
    fn lookup_only_resolves_volume() {
        let entry = VOL.lookup(b"volume").unwrap();
        assert_eq!(entry.nodeid, 3);
        assert_eq!(entry.entry_valid, 3600);
        assert_eq!(entry.attr.size, 1_048_576);
        assert!(VOL.lookup(b"other").is_none());
        assert!(VOL.lookup(b"").is_none());
    }

    #[test]
    fn dirent_listing_matches_the_namespace() {
        let mut buf = Vec::new();
        VOL.append_dirents(&mut buf);

        let mut offset = 0;
        let mut seen = Vec::new();
        while offset < buf.len() {
            let dirent = fuse_dirent::read_from_bytes(&buf[offset..offset + 24]).unwrap();
            let name_start = offset + FUSE_NAME_OFFSET;
            let name = buf[name_start..name_start + dirent.namelen as usize].to_vec();
            seen.push((dirent.ino, dirent.off, dirent.typ, name));
            offset += dirent_align(FUSE_NAME_OFFSET + dirent.namelen as usize);
        }
        assert_eq!(offset, buf.len());

        let dir = (libc::S_IFDIR >> 12) as u32;
        let reg = (libc::S_IFREG >> 12) as u32;
        assert_eq!(
            seen,
            vec![
                (2, 1, dir, b".".to_vec()),
                (3, 2, dir, b"..".to_vec()),
                (4, 3, reg, b"volume".to_vec()),
            ]
        );
    }
}
