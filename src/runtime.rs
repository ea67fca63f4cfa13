//! Cooperative single-threaded task runtime.
//!
//! Tasks are plain `Future`s pinned into an arena and named by index; no
//! pointers to frames escape the runtime, so reclaiming a detached task can
//! never leave a dangling handle behind. A task suspends in exactly three
//! places: awaiting one SQE completion, awaiting a linked pair or set of
//! completions, or awaiting another task's result.
//!
//! There is no wake-by-`Waker` machinery. The ring records the owning task
//! of every awaitable group at submission time and hands ready task ids back
//! to the loop, which polls them with a no-op waker. This mirrors the
//! driver's completion dispatch being the only source of resumption.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use io_uring::squeue;
use log::trace;
use slab::Slab;
use smallvec::SmallVec;

use crate::ring::{GroupId, Ring, TaskId};

type TaskFrame = Pin<Box<dyn Future<Output = ()>>>;

/// Task arena plus the ready queue the ring feeds.
pub struct Runtime {
    /// `None` marks a frame that is currently being polled.
    tasks: RefCell<Slab<Option<TaskFrame>>>,
    ready: RefCell<VecDeque<TaskId>>,
    current: Cell<Option<TaskId>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

impl Runtime {
    pub fn new() -> Runtime {
        Runtime {
            tasks: RefCell::new(Slab::new()),
            ready: RefCell::new(VecDeque::new()),
            current: Cell::new(None),
        }
    }

    /// The task being polled right now. Submissions and child awaits are
    /// only legal from task context.
    fn current(&self) -> TaskId {
        self.current.get().expect("not inside a task")
    }

    /// Spawn a task and run it to its first suspension point before
    /// returning, so a spawned request has already claimed its I/O slot and
    /// queued its first SQEs by the time the caller looks at the pool again.
    pub fn spawn<T, F>(self: &Rc<Runtime>, fut: F) -> TaskHandle<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let state = Rc::new(RefCell::new(JoinState {
            result: None,
            awaiter: None,
            detached: false,
        }));
        let rt = Rc::clone(self);
        let task_state = Rc::clone(&state);
        let wrapper = async move {
            let value = fut.await;
            let mut s = task_state.borrow_mut();
            if s.detached {
                return;
            }
            s.result = Some(value);
            if let Some(parent) = s.awaiter.take() {
                rt.schedule(parent);
            }
        };
        let id = self.tasks.borrow_mut().insert(Some(Box::pin(wrapper)));
        trace!("spawn task {id}");
        self.poll_task(id);
        TaskHandle {
            state,
            rt: Rc::clone(self),
        }
    }

    /// Queue a task for the next `run_ready` pass.
    pub fn schedule(&self, id: TaskId) {
        self.ready.borrow_mut().push_back(id);
    }

    /// Poll scheduled tasks until the ready queue drains.
    pub fn run_ready(&self) {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some(id) => self.poll_task(id),
                None => break,
            }
        }
    }

    fn poll_task(&self, id: TaskId) {
        let frame = {
            let mut tasks = self.tasks.borrow_mut();
            match tasks.get_mut(id) {
                Some(slot) => slot.take(),
                None => None,
            }
        };
        let Some(mut frame) = frame else {
            // A stale wake-up for a task that already finished.
            return;
        };
        let prev = self.current.replace(Some(id));
        let mut cx = Context::from_waker(Waker::noop());
        let poll = frame.as_mut().poll(&mut cx);
        self.current.set(prev);
        let mut tasks = self.tasks.borrow_mut();
        match poll {
            Poll::Ready(()) => {
                trace!("task {id} finished");
                tasks.remove(id);
            }
            Poll::Pending => {
                tasks[id] = Some(frame);
            }
        }
    }
}

struct JoinState<T> {
    result: Option<T>,
    awaiter: Option<TaskId>,
    detached: bool,
}

/// Owner side of a spawned task's result.
///
/// Awaiting the handle suspends the parent until the child finishes.
/// Dropping it before completion detaches the task: the runtime discards the
/// result and reclaims the frame on final suspension instead of resuming
/// anyone.
pub struct TaskHandle<T> {
    state: Rc<RefCell<JoinState<T>>>,
    rt: Rc<Runtime>,
}

impl<T> TaskHandle<T> {
    /// Whether the task has finished and its result is still unclaimed.
    pub fn has_result(&self) -> bool {
        self.state.borrow().result.is_some()
    }
}

impl<T: 'static> Future for TaskHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let mut s = self.state.borrow_mut();
        match s.result.take() {
            Some(value) => Poll::Ready(value),
            None => {
                s.awaiter = Some(self.rt.current());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        let mut s = self.state.borrow_mut();
        if s.result.is_none() {
            s.detached = true;
        }
    }
}

/// Future for a submitted awaitable group. Resolution order follows
/// submission order, not CQE arrival order.
struct Completion {
    ring: Rc<RefCell<Ring>>,
    group: GroupId,
}

impl Completion {
    fn poll_results(&mut self) -> Poll<SmallVec<[i32; 3]>> {
        let mut ring = self.ring.borrow_mut();
        if ring.group_ready(self.group) {
            Poll::Ready(ring.take_group(self.group))
        } else {
            Poll::Pending
        }
    }
}

/// Await a single SQE's signed completion value.
pub struct CompleteOne(Completion);

impl Future for CompleteOne {
    type Output = i32;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<i32> {
        self.0.poll_results().map(|res| res[0])
    }
}

/// Await a linked pair of SQEs.
pub struct CompletePair(Completion);

impl Future for CompletePair {
    type Output = (i32, i32);

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<(i32, i32)> {
        self.0.poll_results().map(|res| (res[0], res[1]))
    }
}

/// Await an ordered set of SQEs.
pub struct CompleteSet(Completion);

impl Future for CompleteSet {
    type Output = SmallVec<[i32; 3]>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<SmallVec<[i32; 3]>> {
        self.0.poll_results()
    }
}

fn submit(
    rt: &Rc<Runtime>,
    ring: &Rc<RefCell<Ring>>,
    entries: impl IntoIterator<Item = squeue::Entry>,
) -> io::Result<Completion> {
    let task = rt.current();
    let group = ring.borrow_mut().submit_group(task, entries)?;
    Ok(Completion {
        ring: Rc::clone(ring),
        group,
    })
}

/// Queue one SQE for the current task and return its completion future.
pub fn submit_single(
    rt: &Rc<Runtime>,
    ring: &Rc<RefCell<Ring>>,
    entry: squeue::Entry,
) -> io::Result<CompleteOne> {
    submit(rt, ring, [entry]).map(CompleteOne)
}

/// Queue two SQEs (the first typically carrying a link flag) as one group.
pub fn submit_pair(
    rt: &Rc<Runtime>,
    ring: &Rc<RefCell<Ring>>,
    first: squeue::Entry,
    second: squeue::Entry,
) -> io::Result<CompletePair> {
    submit(rt, ring, [first, second]).map(CompletePair)
}

/// Queue a full chain as one group.
pub fn submit_chain(
    rt: &Rc<Runtime>,
    ring: &Rc<RefCell<Ring>>,
    entries: impl IntoIterator<Item = squeue::Entry>,
) -> io::Result<CompleteSet> {
    submit(rt, ring, entries).map(CompleteSet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn spawn_runs_to_first_suspension() {
        let rt = Rc::new(Runtime::new());
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let handle = rt.spawn(async move {
            flag.set(true);
            7
        });
        assert!(ran.get());
        assert!(handle.has_result());
    }

    #[test]
    fn parent_awaits_child_result() {
        let rt = Rc::new(Runtime::new());
        let child = rt.spawn(async { 41 });
        let seen = Rc::new(Cell::new(0));
        let out = Rc::clone(&seen);
        drop(rt.spawn(async move {
            out.set(child.await + 1);
        }));
        assert_eq!(seen.get(), 42);
    }

    /// Suspends once, then resolves.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                Poll::Pending
            }
        }
    }

    #[test]
    fn detached_task_result_is_discarded() {
        let rt = Rc::new(Runtime::new());
        let finished = Rc::new(Cell::new(false));
        let flag = Rc::clone(&finished);
        let handle = rt.spawn(async move {
            YieldOnce(false).await;
            flag.set(true);
            13
        });
        assert!(!handle.has_result());
        drop(handle);
        // First spawn in a fresh runtime lands in slot 0.
        rt.schedule(0);
        rt.run_ready();
        assert!(finished.get());
        assert!(rt.tasks.borrow().is_empty());
    }

    #[test]
    fn stale_wakeups_are_ignored() {
        let rt = Rc::new(Runtime::new());
        drop(rt.spawn(async { 1 }));
        rt.schedule(0);
        rt.run_ready();
    }
}
