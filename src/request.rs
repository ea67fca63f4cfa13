//! Per-request pipeline.
//!
//! Each request task walks a linear state machine: splice the message from
//! the FUSE device into the slot's pipe (prefetching the header in the same
//! linked chain), classify the opcode, pull the remaining payload out of the
//! pipe, dispatch, reply. Only fixed-size headers and small per-opcode
//! structs ever cross into user memory; READ and WRITE payloads stay in the
//! kernel and move by splice alone.

use std::io;

use io_uring::{opcode, squeue};
use log::debug;
use zerocopy::FromBytes;

use crate::handlers;
use crate::ll::fuse_abi::{
    fuse_getattr_in, fuse_in_header, fuse_open_in, fuse_opcode, fuse_read_in, fuse_release_in,
    fuse_setattr_in, fuse_write_in,
};
use crate::session::{Ctx, HEADER_BUF_SIZE, SessionCtx};
use crate::slots::IoSlot;

/// Splice flags used on every pipeline hop.
pub(crate) const SPLICE_MOVE_NONBLOCK: u32 = libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK;

const IN_HEADER_LEN: usize = size_of::<fuse_in_header>();

/// How much of the message past the fixed header an opcode is expected to
/// carry, and how the pipeline should treat the byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PayloadSpec {
    pub payload_len: usize,
    /// NUL-terminate the payload buffer (name-carrying requests).
    pub nul_terminate: bool,
    /// Extra bytes past `payload_len` are legal and stay in the pipe.
    pub allow_trailing: bool,
}

/// The classification table: payload length by opcode, given `rbytes` bytes
/// spliced in. Opcodes outside the table consume the whole remainder and are
/// answered with `-ENOSYS` later.
pub(crate) fn classify(opcode: u32, rbytes: usize) -> PayloadSpec {
    use fuse_opcode::*;

    let rest = rbytes - IN_HEADER_LEN;
    let fixed = |len| PayloadSpec {
        payload_len: len,
        nul_terminate: false,
        allow_trailing: false,
    };
    match fuse_opcode::try_from(opcode) {
        Ok(FUSE_GETATTR) => fixed(size_of::<fuse_getattr_in>()),
        Ok(FUSE_SETATTR) => fixed(size_of::<fuse_setattr_in>()),
        Ok(FUSE_OPENDIR) | Ok(FUSE_OPEN) => fixed(size_of::<fuse_open_in>()),
        Ok(FUSE_READDIR) | Ok(FUSE_READ) => fixed(size_of::<fuse_read_in>()),
        Ok(FUSE_RELEASEDIR) | Ok(FUSE_RELEASE) => fixed(size_of::<fuse_release_in>()),
        Ok(FUSE_LOOKUP) => PayloadSpec {
            payload_len: rest,
            nul_terminate: true,
            allow_trailing: false,
        },
        Ok(FUSE_WRITE) => PayloadSpec {
            payload_len: size_of::<fuse_write_in>(),
            nul_terminate: false,
            allow_trailing: true,
        },
        Ok(FUSE_INIT) | Err(_) => fixed(rest),
    }
}

/// A request's operation with its arguments lifted out of the I/O buffers.
#[derive(Debug)]
pub(crate) enum Operation {
    Lookup { name: Vec<u8> },
    Getattr(fuse_getattr_in),
    Setattr(fuse_setattr_in),
    Opendir(fuse_open_in),
    Open(fuse_open_in),
    Readdir(fuse_read_in),
    Read(fuse_read_in),
    Releasedir(fuse_release_in),
    Release(fuse_release_in),
    Write(fuse_write_in),
    Unknown(u32),
}

/// One full request cycle. Spawned detached by the session loop, one per
/// free I/O slot; an `Err` return is fatal to the whole session.
pub(crate) async fn service_request(ctx: Ctx) -> io::Result<()> {
    let Some(slot) = ctx.acquire_slot() else {
        return Err(io::Error::other("request task spawned with an empty slot pool"));
    };

    // Splice one message from the device into the slot's pipe and, in the
    // same chain, pull the header (plus a possible fuse_write_in) back out.
    // The hard link keeps the read queued behind the splice even if the
    // splice fails.
    let splice_in = opcode::Splice::new(
        ctx.config.fuse_fd.fixed(),
        -1,
        slot.pipe_wr.fixed(),
        -1,
        ctx.config.max_bufsize as u32,
    )
    .flags(SPLICE_MOVE_NONBLOCK)
    .build()
    .flags(squeue::Flags::IO_HARDLINK);
    let prefetch = opcode::ReadFixed::new(
        slot.pipe_rd.fixed(),
        slot.header.ptr,
        HEADER_BUF_SIZE as u32,
        slot.header.index.0,
    )
    .build();
    let (rbytes, prefetched) = ctx.submit_pair(splice_in, prefetch)?.await;

    if rbytes < 0 || (rbytes as usize) < IN_HEADER_LEN {
        return Err(io::Error::other(format!(
            "short splice from fuse device: {rbytes}"
        )));
    }
    let rbytes = rbytes as usize;
    if prefetched < 0 {
        return Err(io::Error::from_raw_os_error(-prefetched));
    }

    let have = fill_header(&ctx, &slot, prefetched as usize, IN_HEADER_LEN).await?;
    let header = parse_in_header(&slot)?;
    debug!(
        "request unique={} opcode={} nodeid={} len={} ({rbytes} spliced)",
        header.unique, header.opcode, header.nodeid, header.len
    );

    let spec = classify(header.opcode, rbytes);
    if !spec.allow_trailing
        && (spec.payload_len != rbytes - IN_HEADER_LEN || header.len as usize != rbytes)
    {
        return Err(io::Error::other(format!(
            "request length mismatch: opcode {} header len {} spliced {rbytes}",
            header.opcode, header.len
        )));
    }

    let op = read_operation(&ctx, &slot, &header, spec, have).await?;
    handlers::dispatch(&ctx, &slot, &header, rbytes, op).await
}

/// Keep reading from the pipe until `want` bytes of the header buffer are
/// filled. The prefetch usually covers this in one go; short pipe reads are
/// completed here.
async fn fill_header(
    ctx: &SessionCtx,
    slot: &IoSlot,
    mut have: usize,
    want: usize,
) -> io::Result<usize> {
    while have < want {
        let entry = opcode::ReadFixed::new(
            slot.pipe_rd.fixed(),
            unsafe { slot.header.ptr.add(have) },
            (want - have) as u32,
            slot.header.index.0,
        )
        .build();
        let rc = ctx.submit_single(entry)?.await;
        if rc <= 0 {
            return Err(io::Error::other(format!(
                "short header read: {rc} with {have}/{want}"
            )));
        }
        have += rc as usize;
    }
    Ok(have)
}

fn parse_in_header(slot: &IoSlot) -> io::Result<fuse_in_header> {
    let bytes = unsafe { slot.header.as_slice() };
    fuse_in_header::read_from_prefix(bytes)
        .map(|(header, _)| header)
        .map_err(|_| io::Error::other("header buffer smaller than fuse_in_header"))
}

/// Pull the remaining payload out of the pipe and lift the operation's
/// arguments into owned values, leaving the buffers free for the reply.
async fn read_operation(
    ctx: &SessionCtx,
    slot: &IoSlot,
    header: &fuse_in_header,
    spec: PayloadSpec,
    have: usize,
) -> io::Result<Operation> {
    use fuse_opcode::*;

    // The write payload stays in the pipe; only the fuse_write_in struct is
    // lifted, straight from the prefetched header buffer.
    if matches!(fuse_opcode::try_from(header.opcode), Ok(FUSE_WRITE)) {
        fill_header(ctx, slot, have, HEADER_BUF_SIZE).await?;
        let bytes = unsafe { slot.header.as_slice() };
        let write_in = fuse_write_in::read_from_prefix(&bytes[IN_HEADER_LEN..])
            .map(|(arg, _)| arg)
            .map_err(|_| io::Error::other("header buffer smaller than fuse_write_in"))?;
        return Ok(Operation::Write(write_in));
    }

    let payload = read_payload(ctx, slot, spec, have).await?;
    let bytes = payload_bytes(slot, &payload);

    fn lift<T: FromBytes>(bytes: &[u8]) -> io::Result<T> {
        T::read_from_prefix(bytes)
            .map(|(arg, _)| arg)
            .map_err(|_| io::Error::other("payload shorter than its opcode struct"))
    }

    let op = match fuse_opcode::try_from(header.opcode) {
        Ok(FUSE_LOOKUP) => {
            let name_len = memchr::memchr(0, bytes).unwrap_or(bytes.len());
            Operation::Lookup {
                name: bytes[..name_len].to_vec(),
            }
        }
        Ok(FUSE_GETATTR) => Operation::Getattr(lift(bytes)?),
        Ok(FUSE_SETATTR) => Operation::Setattr(lift(bytes)?),
        Ok(FUSE_OPENDIR) => Operation::Opendir(lift(bytes)?),
        Ok(FUSE_OPEN) => Operation::Open(lift(bytes)?),
        Ok(FUSE_READDIR) => Operation::Readdir(lift(bytes)?),
        Ok(FUSE_READ) => Operation::Read(lift(bytes)?),
        Ok(FUSE_RELEASEDIR) => Operation::Releasedir(lift(bytes)?),
        Ok(FUSE_RELEASE) => Operation::Release(lift(bytes)?),
        Ok(FUSE_WRITE) => unreachable!("write handled above"),
        Ok(FUSE_INIT) | Err(_) => Operation::Unknown(header.opcode),
    };
    Ok(op)
}

enum PayloadBuf {
    Empty,
    Scratch(usize),
    Heap(Vec<u8>),
}

fn payload_bytes<'a>(slot: &'a IoSlot, payload: &'a PayloadBuf) -> &'a [u8] {
    match payload {
        PayloadBuf::Empty => &[],
        PayloadBuf::Scratch(len) => unsafe { &slot.scratch.as_slice()[..*len] },
        PayloadBuf::Heap(buf) => buf,
    }
}

/// Read `spec.payload_len` bytes from the pipe. Bytes the header prefetch
/// already captured are copied forward; only the remainder is read, looping
/// on short reads. Small payloads land in the fixed scratch buffer, oversized
/// ones in a heap buffer.
async fn read_payload(
    ctx: &SessionCtx,
    slot: &IoSlot,
    spec: PayloadSpec,
    have: usize,
) -> io::Result<PayloadBuf> {
    if spec.payload_len == 0 {
        return Ok(PayloadBuf::Empty);
    }
    let total = spec.payload_len + usize::from(spec.nul_terminate);
    let captured_end = have.min(IN_HEADER_LEN + spec.payload_len);
    let captured_len = captured_end - IN_HEADER_LEN;

    if total <= slot.scratch.len {
        {
            let header_bytes = unsafe { slot.header.as_slice() };
            let scratch = unsafe { slot.scratch.as_mut_slice() };
            scratch[..captured_len].copy_from_slice(&header_bytes[IN_HEADER_LEN..captured_end]);
        }
        let mut filled = captured_len;
        while filled < spec.payload_len {
            let entry = opcode::ReadFixed::new(
                slot.pipe_rd.fixed(),
                unsafe { slot.scratch.ptr.add(filled) },
                (spec.payload_len - filled) as u32,
                slot.scratch.index.0,
            )
            .build();
            let rc = ctx.submit_single(entry)?.await;
            if rc <= 0 {
                return Err(io::Error::other(format!("short payload read: {rc}")));
            }
            filled += rc as usize;
        }
        if spec.nul_terminate {
            let scratch = unsafe { slot.scratch.as_mut_slice() };
            scratch[spec.payload_len] = 0;
        }
        Ok(PayloadBuf::Scratch(spec.payload_len))
    } else {
        let mut buf = vec![0u8; total];
        {
            let header_bytes = unsafe { slot.header.as_slice() };
            buf[..captured_len].copy_from_slice(&header_bytes[IN_HEADER_LEN..captured_end]);
        }
        let mut filled = captured_len;
        while filled < spec.payload_len {
            let entry = opcode::Read::new(
                slot.pipe_rd.fixed(),
                buf[filled..].as_mut_ptr(),
                (spec.payload_len - filled) as u32,
            )
            .build();
            let rc = ctx.submit_single(entry)?.await;
            if rc <= 0 {
                return Err(io::Error::other(format!("short payload read: {rc}")));
            }
            filled += rc as usize;
        }
        buf.truncate(spec.payload_len);
        Ok(PayloadBuf::Heap(buf))
    }
}

/// Finalize the scratch buffer's reply: write it into the pipe and splice
/// the pipe into the FUSE device as one linked pair. Both hops must move the
/// exact reply length.
pub(crate) async fn send_reply(ctx: &SessionCtx, slot: &IoSlot, len: usize) -> io::Result<()> {
    let write = opcode::WriteFixed::new(
        slot.pipe_wr.fixed(),
        slot.scratch.ptr as *const u8,
        len as u32,
        slot.scratch.index.0,
    )
    .build()
    .flags(squeue::Flags::IO_LINK);
    let drain = opcode::Splice::new(
        slot.pipe_rd.fixed(),
        -1,
        ctx.config.fuse_fd.fixed(),
        -1,
        len as u32,
    )
    .flags(SPLICE_MOVE_NONBLOCK)
    .build();
    let (wrote, spliced) = ctx.submit_pair(write, drain)?.await;
    if wrote != len as i32 || spliced != len as i32 {
        return Err(io::Error::other(format!(
            "reply send moved {wrote}/{spliced} of {len} bytes"
        )));
    }
    Ok(())
}

/// Like [`send_reply`] but for replies built in a heap buffer (directory
/// listings); the buffer outlives the await, so the kernel reads it safely.
pub(crate) async fn send_reply_buf(ctx: &SessionCtx, slot: &IoSlot, buf: &[u8]) -> io::Result<()> {
    let write = opcode::Write::new(slot.pipe_wr.fixed(), buf.as_ptr(), buf.len() as u32)
        .build()
        .flags(squeue::Flags::IO_LINK);
    let drain = opcode::Splice::new(
        slot.pipe_rd.fixed(),
        -1,
        ctx.config.fuse_fd.fixed(),
        -1,
        buf.len() as u32,
    )
    .flags(SPLICE_MOVE_NONBLOCK)
    .build();
    let (wrote, spliced) = ctx.submit_pair(write, drain)?.await;
    if wrote != buf.len() as i32 || spliced != buf.len() as i32 {
        return Err(io::Error::other(format!(
            "reply send moved {wrote}/{spliced} of {} bytes",
            buf.len()
        )));
    }
    Ok(())
}

/// Drain `remaining` payload bytes out of the pipe through the scratch
/// buffer. Used on WRITE error paths: leftover payload would poison the
/// slot's next request.
pub(crate) async fn drain_pipe(
    ctx: &SessionCtx,
    slot: &IoSlot,
    mut remaining: usize,
) -> io::Result<()> {
    while remaining > 0 {
        let chunk = remaining.min(slot.scratch.len);
        let entry = opcode::ReadFixed::new(
            slot.pipe_rd.fixed(),
            slot.scratch.ptr,
            chunk as u32,
            slot.scratch.index.0,
        )
        .build();
        let rc = ctx.submit_single(entry)?.await;
        if rc <= 0 {
            return Err(io::Error::other(format!("pipe drain read: {rc}")));
        }
        remaining -= rc as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_fixed_sizes() {
        let spec = classify(fuse_opcode::FUSE_GETATTR as u32, 56);
        assert_eq!(
            spec,
            PayloadSpec {
                payload_len: 16,
                nul_terminate: false,
                allow_trailing: false
            }
        );
        assert_eq!(classify(fuse_opcode::FUSE_SETATTR as u32, 128).payload_len, 88);
        assert_eq!(classify(fuse_opcode::FUSE_OPEN as u32, 48).payload_len, 8);
        assert_eq!(classify(fuse_opcode::FUSE_OPENDIR as u32, 48).payload_len, 8);
        assert_eq!(classify(fuse_opcode::FUSE_READ as u32, 80).payload_len, 40);
        assert_eq!(classify(fuse_opcode::FUSE_READDIR as u32, 80).payload_len, 40);
        assert_eq!(classify(fuse_opcode::FUSE_RELEASE as u32, 64).payload_len, 24);
        assert_eq!(classify(fuse_opcode::FUSE_RELEASEDIR as u32, 64).payload_len, 24);
    }

    #[test]
    fn classify_lookup_takes_the_rest_nul_terminated() {
        let spec = classify(fuse_opcode::FUSE_LOOKUP as u32, 40 + 7);
        assert_eq!(spec.payload_len, 7);
        assert!(spec.nul_terminate);
        assert!(!spec.allow_trailing);
    }

    #[test]
    fn classify_write_allows_trailing_payload() {
        let spec = classify(fuse_opcode::FUSE_WRITE as u32, 40 + 40 + 4096);
        assert_eq!(spec.payload_len, 40);
        assert!(spec.allow_trailing);
    }

    #[test]
    fn classify_unknown_consumes_the_rest() {
        let spec = classify(999, 52);
        assert_eq!(spec.payload_len, 12);
        assert!(!spec.allow_trailing);
        // INIT mid-session is treated like any unknown opcode.
        assert_eq!(classify(fuse_opcode::FUSE_INIT as u32, 104).payload_len, 64);
    }
}
