//! Filesystem session.
//!
//! A session is one thread's complete serving state: its ring, its task
//! runtime, its slot pool and the registered buffers the slots point into.
//! Sessions share nothing; a multi-threaded server runs one session per
//! cloned device fd (see `mnt`), each attached to the primary ring's kernel
//! work queue.
//!
//! The run loop is the only place the process blocks: spawn a request task
//! per free slot, `submit_and_wait(1)`, dispatch completions, repeat until a
//! task reports a fatal error.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use io_uring::{IoUring, squeue};
use log::{error, info};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::pipe2;

use crate::error::ServiceError;
use crate::init::Negotiated;
use crate::ll::fuse_abi::{fuse_in_header, fuse_write_in};
use crate::ll::{BufIndex, FixedFd};
use crate::mnt::DevFuse;
use crate::request::service_request;
use crate::ring::Ring;
use crate::runtime::{
    CompleteOne, CompletePair, CompleteSet, Runtime, submit_chain, submit_pair, submit_single,
};
use crate::slots::{BufRange, IoSlot, SlotGuard, SlotPool};
use crate::volume::Volume;

/// Header buffer size: the fixed request header plus the `fuse_write_in`
/// that the R1 prefetch pulls alongside it.
pub const HEADER_BUF_SIZE: usize = size_of::<fuse_in_header>() + size_of::<fuse_write_in>();

/// Scratch buffer size. The largest reply (`fuse_out_header` +
/// `fuse_entry_out`) is 144 bytes; one page leaves plenty of room.
pub const SCRATCH_BUF_SIZE: usize = 4096;

/// Immutable per-session collaborator state handed to the core.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub fuse_fd: FixedFd,
    pub backing_fd: FixedFd,
    pub backing_size: u64,
    /// Pipe capacity: one maximum-size FUSE message.
    pub max_bufsize: usize,
}

/// Shared state reachable from every request task of one session.
pub struct SessionCtx {
    pub ring: Rc<RefCell<Ring>>,
    pub runtime: Rc<Runtime>,
    pub pool: Rc<RefCell<SlotPool>>,
    pub config: SessionConfig,
    pub volume: Volume,
    last_error: RefCell<Option<io::Error>>,
}

pub(crate) type Ctx = Rc<SessionCtx>;

impl SessionCtx {
    pub(crate) fn submit_single(&self, entry: squeue::Entry) -> io::Result<CompleteOne> {
        submit_single(&self.runtime, &self.ring, entry)
    }

    pub(crate) fn submit_pair(
        &self,
        first: squeue::Entry,
        second: squeue::Entry,
    ) -> io::Result<CompletePair> {
        submit_pair(&self.runtime, &self.ring, first, second)
    }

    pub(crate) fn submit_chain(
        &self,
        entries: impl IntoIterator<Item = squeue::Entry>,
    ) -> io::Result<CompleteSet> {
        submit_chain(&self.runtime, &self.ring, entries)
    }

    pub(crate) fn acquire_slot(&self) -> Option<SlotGuard> {
        SlotPool::acquire(&self.pool)
    }

    fn record_error(&self, err: io::Error) {
        let mut slot = self.last_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_error(&self) -> Option<io::Error> {
        self.last_error.borrow_mut().take()
    }
}

/// One serving thread's session: ring, runtime, slots and the buffers that
/// must outlive them.
pub struct Session {
    ctx: Ctx,
    /// The session's device fd; index 0 of the fixed-file table.
    _dev: DevFuse,
    /// Pipe fds backing the fixed-file table entries past the first two.
    _pipes: Vec<OwnedFd>,
    /// Registered buffer arenas; pinned for the ring's lifetime.
    _header_arena: Box<[u8]>,
    _scratch_arena: Box<[u8]>,
}

impl Session {
    /// Build a session over an already-negotiated device fd: allocate one
    /// pipe and one header/scratch range per slot, then register the fixed
    /// files and buffers with the ring.
    pub fn new(
        uring: IoUring,
        dev: DevFuse,
        backing_fd: RawFd,
        backing_size: u64,
        negotiated: &Negotiated,
        nslots: usize,
    ) -> Result<Session, ServiceError> {
        let max_bufsize = negotiated.max_write as usize + HEADER_BUF_SIZE;

        let mut fixed_fds: Vec<RawFd> = vec![dev.as_raw_fd(), backing_fd];
        let fuse_fd = FixedFd(0);
        let backing = FixedFd(1);

        let mut header_arena = vec![0u8; HEADER_BUF_SIZE * nslots].into_boxed_slice();
        let mut scratch_arena = vec![0u8; SCRATCH_BUF_SIZE * nslots].into_boxed_slice();
        let header_buf_idx = BufIndex(0);
        let scratch_buf_idx = BufIndex(1);

        let mut pipes = Vec::with_capacity(nslots * 2);
        let mut slots = Vec::with_capacity(nslots);
        for i in 0..nslots {
            let (rd, wr) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
                .map_err(|err| ServiceError::PipeCreate(err.into()))?;
            // The pipe must hold one maximum-size message in full.
            fcntl(&rd, FcntlArg::F_SETPIPE_SZ(max_bufsize as libc::c_int))
                .map_err(|err| ServiceError::PipeSize(err.into()))?;

            let pipe_rd = FixedFd(fixed_fds.len() as u32);
            fixed_fds.push(rd.as_raw_fd());
            let pipe_wr = FixedFd(fixed_fds.len() as u32);
            fixed_fds.push(wr.as_raw_fd());
            pipes.push(rd);
            pipes.push(wr);

            slots.push(IoSlot {
                pipe_rd,
                pipe_wr,
                header: BufRange {
                    ptr: unsafe { header_arena.as_mut_ptr().add(i * HEADER_BUF_SIZE) },
                    len: HEADER_BUF_SIZE,
                    index: header_buf_idx,
                },
                scratch: BufRange {
                    ptr: unsafe { scratch_arena.as_mut_ptr().add(i * SCRATCH_BUF_SIZE) },
                    len: SCRATCH_BUF_SIZE,
                    index: scratch_buf_idx,
                },
            });
        }

        let ring = Ring::with_uring(uring);
        ring.register_files(&fixed_fds)
            .map_err(ServiceError::RegisterFiles)?;
        let iovecs = [
            libc::iovec {
                iov_base: header_arena.as_mut_ptr().cast(),
                iov_len: header_arena.len(),
            },
            libc::iovec {
                iov_base: scratch_arena.as_mut_ptr().cast(),
                iov_len: scratch_arena.len(),
            },
        ];
        // The arenas are boxed slices owned by the session; they stay pinned
        // until the ring is gone.
        unsafe { ring.register_buffers(&iovecs) }.map_err(ServiceError::RegisterBuffers)?;

        let ctx = Rc::new(SessionCtx {
            ring: Rc::new(RefCell::new(ring)),
            runtime: Rc::new(Runtime::new()),
            pool: Rc::new(RefCell::new(SlotPool::new(slots))),
            config: SessionConfig {
                fuse_fd,
                backing_fd: backing,
                backing_size,
                max_bufsize,
            },
            volume: Volume::new(backing_size, page_size::get() as u32),
            last_error: RefCell::new(None),
        });

        Ok(Session {
            ctx,
            _dev: dev,
            _pipes: pipes,
            _header_arena: header_arena,
            _scratch_arena: scratch_arena,
        })
    }

    /// The request loop. Returns only on a fatal error; the caller turns
    /// that into the process exit code.
    pub fn run(&self) -> Result<(), ServiceError> {
        let ctx = &self.ctx;
        info!(
            "session running: {} slots, max message {} bytes",
            ctx.pool.borrow().len(),
            ctx.config.max_bufsize
        );
        loop {
            // One detached request task per free slot. Spawn runs the task
            // to its first suspension, so each iteration sees the pool
            // shrink until it empties.
            loop {
                if ctx.last_error.borrow().is_some() || ctx.pool.borrow().is_empty() {
                    break;
                }
                let task_ctx = Rc::clone(ctx);
                drop(ctx.runtime.spawn(async move {
                    if let Err(err) = service_request(Rc::clone(&task_ctx)).await {
                        error!("request failed: {err}");
                        task_ctx.record_error(err);
                    }
                }));
            }
            if let Some(err) = ctx.take_error() {
                return Err(ServiceError::TaskFailed(err));
            }

            ctx.ring
                .borrow_mut()
                .submit(true)
                .map_err(ServiceError::Submit)?;
            let woken = ctx.ring.borrow_mut().drain_completions();
            for task in woken {
                ctx.runtime.schedule(task);
            }
            ctx.runtime.run_ready();

            if let Some(err) = ctx.take_error() {
                return Err(ServiceError::TaskFailed(err));
            }
        }
    }
}
