//! Opcode handlers.
//!
//! Each handler fills the slot's scratch buffer with a reply and hands it to
//! the common send path, except READ and WRITE which build their own linked
//! splice chains so file data never enters user memory. In-protocol errors
//! (`-ENOSYS`, `-ENOENT`, `-EACCES`, `-EINVAL`) ride inside successful reply
//! transactions; only transport failures bubble up as `Err` and take the
//! session down.

use std::io;

use io_uring::{opcode, squeue};
use log::debug;
use zerocopy::IntoBytes;

use crate::ll::fuse_abi::consts::{FATTR_SIZE, FUSE_GETATTR_FH};
use crate::ll::fuse_abi::{
    FopenFlags, fuse_attr_out, fuse_getattr_in, fuse_in_header, fuse_open_in, fuse_open_out,
    fuse_out_header, fuse_read_in, fuse_release_in, fuse_setattr_in, fuse_write_in, fuse_write_out,
};
use crate::ll::{INodeNo, RequestId};
use crate::reply::{encode_data_header, encode_empty, encode_error, encode_reply};
use crate::request::{
    Operation, SPLICE_MOVE_NONBLOCK, drain_pipe, send_reply, send_reply_buf,
};
use crate::session::{HEADER_BUF_SIZE, SessionCtx};
use crate::slots::IoSlot;
use crate::volume::ATTR_TIMEOUT_SECS;

pub(crate) async fn dispatch(
    ctx: &SessionCtx,
    slot: &IoSlot,
    header: &fuse_in_header,
    rbytes: usize,
    op: Operation,
) -> io::Result<()> {
    let unique = RequestId(header.unique);
    match op {
        Operation::Lookup { name } => lookup(ctx, slot, unique, &name).await,
        Operation::Getattr(arg) => getattr(ctx, slot, header, arg).await,
        Operation::Setattr(arg) => setattr(ctx, slot, header, arg).await,
        Operation::Opendir(arg) => opendir(ctx, slot, unique, arg).await,
        Operation::Open(arg) => open(ctx, slot, unique, arg).await,
        Operation::Readdir(arg) => readdir(ctx, slot, unique, arg).await,
        Operation::Read(arg) => read(ctx, slot, header, arg).await,
        Operation::Releasedir(arg) => release(ctx, slot, unique, arg).await,
        Operation::Release(arg) => release(ctx, slot, unique, arg).await,
        Operation::Write(arg) => write(ctx, slot, header, rbytes, arg).await,
        Operation::Unknown(code) => unknown(ctx, slot, unique, code).await,
    }
}

async fn unknown(ctx: &SessionCtx, slot: &IoSlot, unique: RequestId, code: u32) -> io::Result<()> {
    debug!("unhandled opcode {code}");
    let len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        encode_error(scratch, unique, -libc::ENOSYS)
    };
    send_reply(ctx, slot, len).await
}

async fn lookup(ctx: &SessionCtx, slot: &IoSlot, unique: RequestId, name: &[u8]) -> io::Result<()> {
    debug!("lookup {:?}", String::from_utf8_lossy(name));
    let len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        match ctx.volume.lookup(name) {
            Some(entry) => encode_reply(scratch, unique, &entry),
            None => encode_error(scratch, unique, -libc::ENOENT),
        }
    };
    send_reply(ctx, slot, len).await
}

async fn getattr(
    ctx: &SessionCtx,
    slot: &IoSlot,
    header: &fuse_in_header,
    arg: fuse_getattr_in,
) -> io::Result<()> {
    let node = if arg.getattr_flags & FUSE_GETATTR_FH != 0 {
        INodeNo(arg.fh)
    } else {
        INodeNo(header.nodeid)
    };
    send_attr(ctx, slot, RequestId(header.unique), node).await
}

async fn setattr(
    ctx: &SessionCtx,
    slot: &IoSlot,
    header: &fuse_in_header,
    arg: fuse_setattr_in,
) -> io::Result<()> {
    let node = if arg.fh != 0 {
        INodeNo(arg.fh)
    } else {
        INodeNo(header.nodeid)
    };
    if node == INodeNo::VOLUME && arg.valid & FATTR_SIZE != 0 {
        // The backing size is fixed; the request succeeds but changes nothing.
        debug!("ignoring size change to {}", arg.size);
    }
    send_attr(ctx, slot, RequestId(header.unique), node).await
}

async fn send_attr(
    ctx: &SessionCtx,
    slot: &IoSlot,
    unique: RequestId,
    node: INodeNo,
) -> io::Result<()> {
    let len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        match ctx.volume.attr_for(node) {
            Some(attr) => encode_reply(
                scratch,
                unique,
                &fuse_attr_out {
                    attr_valid: ATTR_TIMEOUT_SECS,
                    attr_valid_nsec: 0,
                    dummy: 0,
                    attr,
                },
            ),
            None => encode_error(scratch, unique, -libc::EACCES),
        }
    };
    send_reply(ctx, slot, len).await
}

async fn opendir(
    ctx: &SessionCtx,
    slot: &IoSlot,
    unique: RequestId,
    arg: fuse_open_in,
) -> io::Result<()> {
    let out = opendir_reply(&arg);
    let len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        encode_reply(scratch, unique, &out)
    };
    send_reply(ctx, slot, len).await
}

async fn open(
    ctx: &SessionCtx,
    slot: &IoSlot,
    unique: RequestId,
    arg: fuse_open_in,
) -> io::Result<()> {
    let out = open_reply(&arg);
    let len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        encode_reply(scratch, unique, &out)
    };
    send_reply(ctx, slot, len).await
}

/// The directory handle caches aggressively; there is only one listing.
fn opendir_reply(arg: &fuse_open_in) -> fuse_open_out {
    fuse_open_out {
        fh: INodeNo::ROOT.0,
        open_flags: arg.flags | FopenFlags::FOPEN_CACHE_DIR.bits(),
        padding: 0,
    }
}

/// File opens keep the page cache warm but bypass it for data, which is
/// what routes reads and writes through the splice pipeline.
fn open_reply(arg: &fuse_open_in) -> fuse_open_out {
    fuse_open_out {
        fh: INodeNo::VOLUME.0,
        open_flags: arg.flags
            | (FopenFlags::FOPEN_KEEP_CACHE | FopenFlags::FOPEN_DIRECT_IO).bits(),
        padding: 0,
    }
}

async fn release(
    ctx: &SessionCtx,
    slot: &IoSlot,
    unique: RequestId,
    _arg: fuse_release_in,
) -> io::Result<()> {
    let len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        encode_empty(scratch, unique)
    };
    send_reply(ctx, slot, len).await
}

async fn readdir(
    ctx: &SessionCtx,
    slot: &IoSlot,
    unique: RequestId,
    arg: fuse_read_in,
) -> io::Result<()> {
    debug!("readdir offset {}", arg.offset);
    let mut buf = vec![0u8; size_of::<fuse_out_header>()];
    // Offset zero gets the whole (three entry) directory; anything else is
    // the EOF signal.
    if arg.offset == 0 {
        ctx.volume.append_dirents(&mut buf);
    }
    let header = fuse_out_header {
        len: buf.len() as u32,
        error: 0,
        unique: unique.0,
    };
    buf[..size_of::<fuse_out_header>()].copy_from_slice(header.as_bytes());
    send_reply_buf(ctx, slot, &buf).await
}

async fn read(
    ctx: &SessionCtx,
    slot: &IoSlot,
    header: &fuse_in_header,
    arg: fuse_read_in,
) -> io::Result<()> {
    let unique = RequestId(header.unique);
    debug!("read node {} offset {} size {}", header.nodeid, arg.offset, arg.size);
    if INodeNo(header.nodeid) != INodeNo::VOLUME {
        let len = {
            let scratch = unsafe { slot.scratch.as_mut_slice() };
            encode_error(scratch, unique, -libc::ENOENT)
        };
        return send_reply(ctx, slot, len).await;
    }

    let size = clamp_read(arg.offset, arg.size, ctx.volume.backing_size);
    let header_len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        encode_data_header(scratch, unique, size as usize)
    };
    let total = header_len + size as usize;

    // Reply header into the pipe, backing bytes spliced in behind it, the
    // whole message spliced out to the device; one kernel-ordered chain.
    let put_header = opcode::WriteFixed::new(
        slot.pipe_wr.fixed(),
        slot.scratch.ptr as *const u8,
        header_len as u32,
        slot.scratch.index.0,
    )
    .build()
    .flags(squeue::Flags::IO_LINK);
    let pull = opcode::Splice::new(
        ctx.config.backing_fd.fixed(),
        arg.offset as i64,
        slot.pipe_wr.fixed(),
        -1,
        size,
    )
    .flags(SPLICE_MOVE_NONBLOCK)
    .build()
    .flags(squeue::Flags::IO_LINK);
    let push = opcode::Splice::new(
        slot.pipe_rd.fixed(),
        -1,
        ctx.config.fuse_fd.fixed(),
        -1,
        total as u32,
    )
    .flags(SPLICE_MOVE_NONBLOCK)
    .build();
    let rcs = ctx.submit_chain([put_header, pull, push])?.await;

    if rcs[0] != header_len as i32 || rcs[1] != size as i32 || rcs[2] != total as i32 {
        return Err(io::Error::other(format!(
            "read chain moved {rcs:?}, wanted [{header_len}, {size}, {total}]"
        )));
    }
    Ok(())
}

async fn write(
    ctx: &SessionCtx,
    slot: &IoSlot,
    header: &fuse_in_header,
    rbytes: usize,
    arg: fuse_write_in,
) -> io::Result<()> {
    let unique = RequestId(header.unique);
    debug!("write node {} offset {} size {}", header.nodeid, arg.offset, arg.size);
    if INodeNo(header.nodeid) != INodeNo::VOLUME {
        drain_pipe(ctx, slot, rbytes - HEADER_BUF_SIZE).await?;
        let len = {
            let scratch = unsafe { slot.scratch.as_mut_slice() };
            encode_error(scratch, unique, -libc::ENOENT)
        };
        return send_reply(ctx, slot, len).await;
    }

    let size = arg.size;
    if header.len as usize != HEADER_BUF_SIZE + size as usize {
        drain_pipe(ctx, slot, rbytes - HEADER_BUF_SIZE).await?;
        let len = {
            let scratch = unsafe { slot.scratch.as_mut_slice() };
            encode_error(scratch, unique, -libc::EINVAL)
        };
        return send_reply(ctx, slot, len).await;
    }

    // Success reply prepared up front; it follows the payload through the
    // pipe in the same chain.
    let reply_len = {
        let scratch = unsafe { slot.scratch.as_mut_slice() };
        encode_reply(scratch, unique, &fuse_write_out { size, padding: 0 })
    };

    let put = opcode::Splice::new(
        slot.pipe_rd.fixed(),
        -1,
        ctx.config.backing_fd.fixed(),
        arg.offset as i64,
        size,
    )
    .flags(SPLICE_MOVE_NONBLOCK)
    .build()
    .flags(squeue::Flags::IO_LINK);
    let reply = opcode::WriteFixed::new(
        slot.pipe_wr.fixed(),
        slot.scratch.ptr as *const u8,
        reply_len as u32,
        slot.scratch.index.0,
    )
    .build()
    .flags(squeue::Flags::IO_LINK);
    let push = opcode::Splice::new(
        slot.pipe_rd.fixed(),
        -1,
        ctx.config.fuse_fd.fixed(),
        -1,
        reply_len as u32,
    )
    .flags(SPLICE_MOVE_NONBLOCK)
    .build();
    let rcs = ctx.submit_chain([put, reply, push])?.await;

    if rcs[0] < 0 {
        // Write to the backing file failed; the linked reply was cancelled,
        // so answer with the splice's errno instead.
        let len = {
            let scratch = unsafe { slot.scratch.as_mut_slice() };
            encode_error(scratch, unique, rcs[0])
        };
        return send_reply(ctx, slot, len).await;
    }
    if (rcs[0] as u32) < size {
        let len = {
            let scratch = unsafe { slot.scratch.as_mut_slice() };
            encode_reply(
                scratch,
                unique,
                &fuse_write_out {
                    size: rcs[0] as u32,
                    padding: 0,
                },
            )
        };
        return send_reply(ctx, slot, len).await;
    }
    if rcs[1] != reply_len as i32 || rcs[2] != reply_len as i32 {
        return Err(io::Error::other(format!(
            "write reply moved {}/{} of {reply_len} bytes",
            rcs[1], rcs[2]
        )));
    }
    Ok(())
}

/// Reads stop at the end of the backing file.
fn clamp_read(offset: u64, size: u32, backing_size: u64) -> u32 {
    backing_size.saturating_sub(offset).min(u64::from(size)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_clamps_to_backing_size() {
        assert_eq!(clamp_read(0, 4096, 1_048_576), 4096);
        assert_eq!(clamp_read(1_048_576 - 100, 4096, 1_048_576), 100);
        assert_eq!(clamp_read(1_048_576, 4096, 1_048_576), 0);
        assert_eq!(clamp_read(2_000_000, 4096, 1_048_576), 0);
        assert_eq!(clamp_read(0, 0, 1_048_576), 0);
    }

    #[test]
    fn open_replies_carry_the_cache_hints() {
        let arg = fuse_open_in {
            flags: libc::O_RDWR as u32,
            unused: 0,
        };

        let out = open_reply(&arg);
        assert_eq!(out.fh, 3);
        assert_eq!(out.open_flags & libc::O_RDWR as u32, libc::O_RDWR as u32);
        assert_ne!(out.open_flags & FopenFlags::FOPEN_KEEP_CACHE.bits(), 0);
        assert_ne!(out.open_flags & FopenFlags::FOPEN_DIRECT_IO.bits(), 0);

        let out = opendir_reply(&arg);
        assert_eq!(out.fh, 1);
        assert_ne!(out.open_flags & FopenFlags::FOPEN_CACHE_DIR.bits(), 0);
    }
}
