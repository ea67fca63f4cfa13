//! Submission/completion ring driver.
//!
//! Thin wrapper around the kernel ring that the task runtime drives. It owns
//! the bookkeeping that connects completions back to suspended tasks: every
//! submitted SQE is tagged (via `user_data`) with the key of a completion
//! slot, completion slots belong to an awaitable group, and a group that
//! reaches zero outstanding completions schedules its owning task.
//!
//! Chains are pushed atomically: the whole linked sequence is reserved up
//! front so a queue flush can never be interleaved between `IOSQE_IO_LINK`
//! entries of one request.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use io_uring::{IoUring, squeue};
use log::trace;
use slab::Slab;
use smallvec::SmallVec;

/// Key of an awaitable group in the ring's group arena.
pub type GroupId = usize;
/// Key of a task frame in the runtime's task arena.
pub type TaskId = usize;

/// One submitted SQE waiting for its CQE. `res` holds the signed completion
/// value once the kernel delivers it.
struct OpSlot {
    group: GroupId,
    res: i32,
}

/// A set of SQEs awaited as a unit by a single task.
struct Group {
    tocomplete: u32,
    task: TaskId,
    /// Completion-slot keys in submission order; results are surfaced in
    /// this order regardless of CQE arrival order.
    ops: SmallVec<[usize; 3]>,
}

/// Ring driver state: the kernel ring plus the in-flight op bookkeeping.
pub struct Ring {
    uring: IoUring,
    ops: Slab<OpSlot>,
    groups: Slab<Group>,
    submit_pending: bool,
}

impl Ring {
    pub fn new(entries: u32) -> io::Result<Ring> {
        Ok(Ring::with_uring(IoUring::new(entries)?))
    }

    pub fn with_uring(uring: IoUring) -> Ring {
        Ring {
            uring,
            ops: Slab::new(),
            groups: Slab::new(),
            submit_pending: false,
        }
    }

    /// The ring fd, used to attach worker rings to the primary's work queue.
    pub fn as_raw_fd(&self) -> RawFd {
        self.uring.as_raw_fd()
    }

    pub fn register_files(&self, fds: &[RawFd]) -> io::Result<()> {
        self.uring.submitter().register_files(fds)
    }

    /// # Safety
    ///
    /// The memory described by `iovecs` must stay valid (and must not move)
    /// for the lifetime of the ring.
    pub unsafe fn register_buffers(&self, iovecs: &[libc::iovec]) -> io::Result<()> {
        unsafe { self.uring.submitter().register_buffers(iovecs) }
    }

    /// Submit `entries` as one contiguous run owned by `task`, returning the
    /// group to await. Entry link flags are the caller's business; the tag
    /// words are not: each entry is stamped with its completion-slot key
    /// plus one, so a zero `user_data` always means "no owner".
    pub fn submit_group(
        &mut self,
        task: TaskId,
        entries: impl IntoIterator<Item = squeue::Entry>,
    ) -> io::Result<GroupId> {
        let gid = self.groups.insert(Group {
            tocomplete: 0,
            task,
            ops: SmallVec::new(),
        });
        let mut tagged: SmallVec<[squeue::Entry; 3]> = SmallVec::new();
        for entry in entries {
            let key = self.ops.insert(OpSlot { group: gid, res: -1 });
            self.groups[gid].ops.push(key);
            tagged.push(entry.user_data(key as u64 + 1));
        }
        let group = &mut self.groups[gid];
        group.tocomplete = group.ops.len() as u32;
        trace!("submit group {gid}: {} sqes for task {task}", group.tocomplete);
        self.push_chain(&tagged)?;
        Ok(gid)
    }

    /// Push a full chain without letting a flush split it. When the
    /// submission queue lacks room the accumulated batch is submitted and the
    /// push retried; the kernel consuming SQEs bounds the spin.
    fn push_chain(&mut self, entries: &[squeue::Entry]) -> io::Result<()> {
        self.submit_pending = true;
        loop {
            {
                let mut sq = self.uring.submission();
                if sq.capacity() - sq.len() >= entries.len() {
                    // Room was checked above, the push cannot fail.
                    unsafe {
                        sq.push_multiple(entries)
                            .expect("submission queue capacity was reserved");
                    }
                    return Ok(());
                }
            }
            self.uring.submit()?;
        }
    }

    /// Submit anything pending. With `block`, also wait until at least one
    /// completion is available; this is the request loop's single blocking
    /// point.
    pub fn submit(&mut self, block: bool) -> io::Result<()> {
        if self.submit_pending {
            if block {
                self.uring.submit_and_wait(1)?;
            } else {
                self.uring.submit()?;
            }
            self.submit_pending = false;
        } else if block {
            self.uring.submit_and_wait(1)?;
        }
        Ok(())
    }

    /// Reap all available completions. Each CQE's tag recovers the
    /// completion slot; a group whose outstanding count hits zero yields its
    /// owning task. The returned ids are ready to be scheduled.
    pub fn drain_completions(&mut self) -> SmallVec<[TaskId; 8]> {
        let mut woken = SmallVec::new();
        let Ring {
            uring, ops, groups, ..
        } = self;
        for cqe in uring.completion() {
            let tag = cqe.user_data();
            if tag == 0 {
                continue;
            }
            let op = &mut ops[(tag - 1) as usize];
            op.res = cqe.result();
            let group = &mut groups[op.group];
            group.tocomplete -= 1;
            if group.tocomplete == 0 {
                woken.push(group.task);
            }
        }
        woken
    }

    /// True once every completion of `gid` has arrived.
    pub fn group_ready(&self, gid: GroupId) -> bool {
        self.groups[gid].tocomplete == 0
    }

    /// Consume a finished group, returning its results in submission order.
    pub fn take_group(&mut self, gid: GroupId) -> SmallVec<[i32; 3]> {
        let group = self.groups.remove(gid);
        debug_assert_eq!(group.tocomplete, 0);
        group.ops.iter().map(|&key| self.ops.remove(key).res).collect()
    }
}
