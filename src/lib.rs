//! Zero-copy FUSE volume server.
//!
//! Speaks the Linux in-kernel FUSE protocol over `/dev/fuse` and services
//! requests with a cooperative single-threaded runtime built directly on
//! io_uring. The namespace is deliberately tiny (one root directory holding
//! one regular file, `volume`, backed by a host file) because the point is
//! the transport: request and reply payloads move between the device fd and
//! the backing fd through per-request pipes using the splice family of ring
//! operations, so bulk data never crosses into user memory. Only fixed-size
//! headers do.

#![warn(rust_2018_idioms)]

pub use crate::error::ServiceError;
pub use crate::init::{Negotiated, handshake};
pub use crate::mnt::{DevFuse, Mount, mount};
pub use crate::session::Session;

pub mod error;
mod handlers;
pub mod init;
pub mod ll;
pub mod mnt;
pub mod reply;
mod request;
pub mod ring;
pub mod runtime;
pub mod session;
pub mod slots;
pub mod volume;
