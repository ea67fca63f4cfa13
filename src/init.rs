//! The `FUSE_INIT` exchange.
//!
//! Performed with plain blocking reads and writes on the device fd before
//! the ring exists: negotiation is a strict two-message affair and gains
//! nothing from the async machinery. The server requires every capability
//! the zero-copy pipeline depends on and refuses to start degraded.

use std::os::fd::AsFd;

use log::{debug, info};
use nix::unistd::{read, write};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::error::ServiceError;
use crate::ll::fuse_abi::{
    FUSE_KERNEL_MINOR_VERSION, FUSE_KERNEL_VERSION, InitFlags, fuse_in_header, fuse_init_in,
    fuse_init_out, fuse_opcode, fuse_out_header,
};
use crate::mnt::DevFuse;

/// Capabilities the kernel must offer; a kernel lacking any of them cannot
/// drive the splice pipeline and the server exits instead of degrading.
pub const REQUIRED_FLAGS: InitFlags = InitFlags::FUSE_ASYNC_READ
    .union(InitFlags::FUSE_PARALLEL_DIROPS)
    .union(InitFlags::FUSE_AUTO_INVAL_DATA)
    .union(InitFlags::FUSE_HANDLE_KILLPRIV)
    .union(InitFlags::FUSE_ASYNC_DIO)
    .union(InitFlags::FUSE_IOCTL_DIR)
    .union(InitFlags::FUSE_ATOMIC_O_TRUNC)
    .union(InitFlags::FUSE_SPLICE_READ)
    .union(InitFlags::FUSE_SPLICE_WRITE)
    .union(InitFlags::FUSE_MAX_PAGES)
    .union(InitFlags::FUSE_WRITEBACK_CACHE)
    .union(InitFlags::FUSE_EXPORT_SUPPORT)
    .union(InitFlags::FUSE_SPLICE_MOVE);

/// Flags advertised back to the kernel.
pub const ADVERTISED_FLAGS: InitFlags = REQUIRED_FLAGS.union(InitFlags::FUSE_BIG_WRITES);

/// Pages per request advertised at init; fixes `max_write`.
pub const MAX_PAGES: u16 = 256;

const INIT_BUF_SIZE: usize = 8192;

/// What the handshake settled on; sessions size their pipes and buffers
/// from this.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub max_write: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_pages: u16,
    /// The kernel's protocol minor, for the curious log line.
    pub kernel_minor: u32,
}

/// Run the init exchange on a freshly mounted device fd.
pub fn handshake(
    dev: &DevFuse,
    max_background: u16,
    congestion_threshold: u16,
) -> Result<Negotiated, ServiceError> {
    let mut buf = [0u8; INIT_BUF_SIZE];
    let n = read(dev.as_fd(), &mut buf).map_err(|err| ServiceError::InitRead(err.into()))?;
    let (header, init_in) = parse_init(&buf[..n])?;

    if init_in.major > FUSE_KERNEL_VERSION {
        // Newer kernel: send our version and let it re-send a matching init.
        let reply = version_only_reply(header.unique);
        write_all(dev, reply.as_bytes()).map_err(ServiceError::InitVersionReply)?;
        let n = read(dev.as_fd(), &mut buf).map_err(|err| ServiceError::InitReread(err.into()))?;
        return finish_handshake(dev, &buf[..n], max_background, congestion_threshold);
    }

    finish_init(dev, header, init_in, max_background, congestion_threshold)
}

fn finish_handshake(
    dev: &DevFuse,
    buf: &[u8],
    max_background: u16,
    congestion_threshold: u16,
) -> Result<Negotiated, ServiceError> {
    let (header, init_in) = parse_init(buf)?;
    finish_init(dev, header, init_in, max_background, congestion_threshold)
}

fn finish_init(
    dev: &DevFuse,
    header: fuse_in_header,
    init_in: fuse_init_in,
    max_background: u16,
    congestion_threshold: u16,
) -> Result<Negotiated, ServiceError> {
    let offered = InitFlags::from_bits_truncate(init_in.flags);
    let missing = missing_capabilities(offered);
    if !missing.is_empty() {
        return Err(ServiceError::MissingCapabilities(missing));
    }

    let reply = build_init_reply(
        header.unique,
        init_in.max_readahead,
        max_background,
        congestion_threshold,
    );
    write_all(dev, reply.as_bytes()).map_err(ServiceError::InitReply)?;

    info!(
        "fuse protocol {}.{} negotiated, max_write {} bytes",
        init_in.major, init_in.minor, reply.init.max_write
    );
    Ok(Negotiated {
        max_write: reply.init.max_write,
        max_background,
        congestion_threshold,
        max_pages: MAX_PAGES,
        kernel_minor: init_in.minor,
    })
}

/// Capabilities from [`REQUIRED_FLAGS`] the kernel did not offer.
pub fn missing_capabilities(offered: InitFlags) -> InitFlags {
    REQUIRED_FLAGS.difference(offered)
}

/// Validate and split the first message off the device. Kernels past 7.36
/// send a longer `fuse_init_in`; only the 7.8-compatible prefix matters
/// here, so the check is a floor, not an exact length.
fn parse_init(buf: &[u8]) -> Result<(fuse_in_header, fuse_init_in), ServiceError> {
    let (header, rest) = fuse_in_header::read_from_prefix(buf)
        .map_err(|_| ServiceError::InitProtocol("init message shorter than its header"))?;
    if header.opcode != fuse_opcode::FUSE_INIT as u32 {
        return Err(ServiceError::InitProtocol("unexpected opcode during init"));
    }
    if (header.len as usize) < size_of::<fuse_in_header>() + size_of::<fuse_init_in>()
        || header.len as usize != buf.len()
    {
        return Err(ServiceError::InitProtocol("unexpected length during init"));
    }
    let (init_in, _) = fuse_init_in::read_from_prefix(rest)
        .map_err(|_| ServiceError::InitProtocol("init message shorter than fuse_init_in"))?;
    if init_in.major < FUSE_KERNEL_VERSION {
        debug!("kernel offers fuse major {}", init_in.major);
        return Err(ServiceError::InitProtocol("unsupported fuse major version"));
    }
    Ok((header, init_in))
}

/// A full init reply message, contiguous for a single write.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable)]
pub struct InitReply {
    pub header: fuse_out_header,
    pub init: fuse_init_out,
}

fn version_only_reply(unique: u64) -> InitReply {
    let mut reply = build_init_reply(unique, 0, 0, 0);
    reply.init = fuse_init_out {
        major: FUSE_KERNEL_VERSION,
        minor: FUSE_KERNEL_MINOR_VERSION,
        ..zeroed_init_out()
    };
    reply
}

/// Assemble the reply advertising our capabilities and limits.
pub fn build_init_reply(
    unique: u64,
    max_readahead: u32,
    max_background: u16,
    congestion_threshold: u16,
) -> InitReply {
    let max_write = u32::from(MAX_PAGES) * page_size::get() as u32;
    InitReply {
        header: fuse_out_header {
            len: size_of::<InitReply>() as u32,
            error: 0,
            unique,
        },
        init: fuse_init_out {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            max_readahead,
            flags: ADVERTISED_FLAGS.bits(),
            max_background,
            congestion_threshold,
            max_write,
            time_gran: 1,
            max_pages: MAX_PAGES,
            padding: 0,
            unused: [0; 8],
        },
    }
}

fn zeroed_init_out() -> fuse_init_out {
    fuse_init_out {
        major: 0,
        minor: 0,
        max_readahead: 0,
        flags: 0,
        max_background: 0,
        congestion_threshold: 0,
        max_write: 0,
        time_gran: 0,
        max_pages: 0,
        padding: 0,
        unused: [0; 8],
    }
}

fn write_all(dev: &DevFuse, bytes: &[u8]) -> std::io::Result<()> {
    let written = write(dev.as_fd(), bytes).map_err(std::io::Error::from)?;
    if written != bytes.len() {
        return Err(std::io::Error::other(format!(
            "short init write: {written} of {}",
            bytes.len()
        )));
    }
    Ok(())
}
