//! Reply construction.
//!
//! Replies are laid down into the request's scratch buffer (or, for
//! directory listings, a heap buffer) as `fuse_out_header` plus body, and
//! the total length is returned for the send path to splice out. Every
//! encoder echoes the request's `unique` and writes a truthful `len`.

use zerocopy::{Immutable, IntoBytes};

use crate::ll::RequestId;
use crate::ll::fuse_abi::{FUSE_NAME_OFFSET, dirent_align, fuse_dirent, fuse_out_header};

/// Encode a successful reply carrying `body`.
pub fn encode_reply<T>(scratch: &mut [u8], unique: RequestId, body: &T) -> usize
where
    T: IntoBytes + Immutable,
{
    let body_bytes = body.as_bytes();
    let len = size_of::<fuse_out_header>() + body_bytes.len();
    let header = fuse_out_header {
        len: len as u32,
        error: 0,
        unique: unique.0,
    };
    scratch[..size_of::<fuse_out_header>()].copy_from_slice(header.as_bytes());
    scratch[size_of::<fuse_out_header>()..len].copy_from_slice(body_bytes);
    len
}

/// Encode an empty successful reply.
pub fn encode_empty(scratch: &mut [u8], unique: RequestId) -> usize {
    encode_status(scratch, unique, 0)
}

/// Encode an in-protocol error reply. `errno` is the negated errno value,
/// e.g. `-libc::ENOENT`.
pub fn encode_error(scratch: &mut [u8], unique: RequestId, errno: i32) -> usize {
    debug_assert!(errno < 0);
    encode_status(scratch, unique, errno)
}

fn encode_status(scratch: &mut [u8], unique: RequestId, error: i32) -> usize {
    let len = size_of::<fuse_out_header>();
    let header = fuse_out_header {
        len: len as u32,
        error,
        unique: unique.0,
    };
    scratch[..len].copy_from_slice(header.as_bytes());
    len
}

/// Encode only the header of a reply whose payload will be spliced in behind
/// it (the READ path). `len` covers the payload that never enters user
/// memory; the returned count is just the header bytes present in `scratch`.
pub fn encode_data_header(scratch: &mut [u8], unique: RequestId, data_len: usize) -> usize {
    let header_len = size_of::<fuse_out_header>();
    let header = fuse_out_header {
        len: (header_len + data_len) as u32,
        error: 0,
        unique: unique.0,
    };
    scratch[..header_len].copy_from_slice(header.as_bytes());
    header_len
}

/// Append one directory entry, zero-padded to the dirent alignment.
pub fn push_dirent(buf: &mut Vec<u8>, ino: u64, off: u64, typ: u32, name: &[u8]) {
    let entry_len = dirent_align(FUSE_NAME_OFFSET + name.len());
    let dirent = fuse_dirent {
        ino,
        off,
        namelen: name.len() as u32,
        typ,
    };
    let start = buf.len();
    buf.extend_from_slice(dirent.as_bytes());
    buf.extend_from_slice(name);
    buf.resize(start + entry_len, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll::fuse_abi::fuse_attr_out;
    use zerocopy::FromBytes;

    #[test]
    fn reply_echoes_unique_and_len() {
        let mut scratch = [0u8; 4096];
        let body = fuse_attr_out::read_from_bytes(&[0u8; 104]).unwrap();
        let len = encode_reply(&mut scratch, RequestId(0xdead_beef), &body);
        assert_eq!(len, 16 + 104);

        let header = fuse_out_header::read_from_bytes(&scratch[..16]).unwrap();
        assert_eq!(header.len, len as u32);
        assert_eq!(header.error, 0);
        assert_eq!(header.unique, 0xdead_beef);
    }

    #[test]
    fn error_reply_is_header_only() {
        let mut scratch = [0u8; 4096];
        let len = encode_error(&mut scratch, RequestId(9), -libc::ENOENT);
        assert_eq!(len, 16);
        let header = fuse_out_header::read_from_bytes(&scratch[..16]).unwrap();
        assert_eq!(header.error, -libc::ENOENT);
        assert_eq!(header.unique, 9);
    }

    #[test]
    fn data_header_accounts_for_spliced_payload() {
        let mut scratch = [0u8; 4096];
        let written = encode_data_header(&mut scratch, RequestId(3), 8192);
        assert_eq!(written, 16);
        let header = fuse_out_header::read_from_bytes(&scratch[..16]).unwrap();
        assert_eq!(header.len, 16 + 8192);
    }

    #[test]
    fn dirents_are_aligned_and_zero_padded() {
        let mut buf = Vec::new();
        push_dirent(&mut buf, 2, 1, libc::DT_DIR as u32, b".");
        assert_eq!(buf.len(), dirent_align(FUSE_NAME_OFFSET + 1));

        push_dirent(&mut buf, 4, 3, libc::DT_REG as u32, b"volume");
        assert_eq!(buf.len() % 8, 0);

        let dirent = fuse_dirent::read_from_bytes(&buf[..24]).unwrap();
        assert_eq!(dirent.ino, 2);
        assert_eq!(dirent.off, 1);
        assert_eq!(dirent.namelen, 1);
        assert_eq!(dirent.typ, libc::DT_DIR as u32);
        assert_eq!(&buf[24..25], b".");
        // padding bytes are zero
        assert!(buf[25..32].iter().all(|&b| b == 0));
    }
}
