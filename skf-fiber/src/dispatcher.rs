use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Waker};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::ctx;
use crate::group::{FiberGroup, GroupExtern, GroupHandle, lock_ignore_poison};

/// Longest time the dispatcher parks without timers or work.
const IDLE_PARK: Duration = Duration::from_millis(100);

pub(crate) enum ShareMsg {
    Wake { group: u64, fiber: u64 },
    External(Box<dyn FnOnce(&mut DispatcherLoop) + Send>),
}

/// Waker for one fiber: posts a wake through the share queue, from any
/// thread. Deduplication happens on the dispatcher side.
pub(crate) struct FiberWaker {
    pub(crate) tx: Sender<ShareMsg>,
    pub(crate) group: u64,
    pub(crate) fiber: u64,
}

impl std::task::Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let _ = self.tx.send(ShareMsg::Wake {
            group: self.group,
            fiber: self.fiber,
        });
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for earliest-deadline-first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn register(&mut self, deadline: Instant, waker: Waker) {
        self.seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq: self.seq,
            waker,
        });
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                entry.waker.wake();
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }
}

pub(crate) struct DispatcherLoop {
    rx: Receiver<ShareMsg>,
    groups: HashMap<u64, Rc<FiberGroup>>,
    ready_groups: VecDeque<u64>,
    timers: Rc<RefCell<TimerQueue>>,
    pub(crate) stopping: bool,
}

impl DispatcherLoop {
    pub(crate) fn group(&self, id: u64) -> Option<Rc<FiberGroup>> {
        self.groups.get(&id).map(Rc::clone)
    }

    pub(crate) fn add_group(&mut self, group: Rc<FiberGroup>) {
        self.groups.insert(group.id, group);
    }

    fn run(&mut self) {
        loop {
            self.drain();
            self.timers.borrow_mut().fire_due(Instant::now());
            self.drain();
            self.collect_finished();

            if let Some(group_id) = self.ready_groups.pop_front() {
                self.run_group(group_id);
                continue;
            }
            if self.stopping && self.groups.is_empty() {
                break;
            }
            let park = self
                .timers
                .borrow()
                .next_deadline()
                .map_or(IDLE_PARK, |d| {
                    d.saturating_duration_since(Instant::now()).min(IDLE_PARK)
                });
            match self.rx.recv_timeout(park) {
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::info!(target: "skiff::fiber", "dispatcher loop exits");
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.handle(msg);
        }
    }

    fn handle(&mut self, msg: ShareMsg) {
        match msg {
            ShareMsg::Wake { group, fiber } => self.apply_wake(group, fiber),
            ShareMsg::External(f) => f(self),
        }
    }

    fn apply_wake(&mut self, group_id: u64, fiber_id: u64) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        let mut inner = group.inner.borrow_mut();
        let Some(fiber) = inner.fibers.get(&fiber_id).map(Rc::clone) else {
            return;
        };
        if fiber.scheduled.replace(true) {
            return;
        }
        inner.ready.push_back(fiber_id);
        if !inner.in_ready_queue {
            inner.in_ready_queue = true;
            self.ready_groups.push_back(group_id);
        }
    }

    fn run_group(&mut self, group_id: u64) {
        let Some(group) = self.groups.get(&group_id).map(Rc::clone) else {
            return;
        };
        // Snapshot the current ready count so one busy fiber cannot
        // starve the rest of its group this round.
        let rounds = group.inner.borrow().ready.len();
        for _ in 0..rounds {
            let fiber_id = group.inner.borrow_mut().ready.pop_front();
            let Some(fiber_id) = fiber_id else { break };
            self.poll_fiber(&group, fiber_id);
        }
        {
            let mut inner = group.inner.borrow_mut();
            if inner.ready.is_empty() {
                inner.in_ready_queue = false;
            } else {
                self.ready_groups.push_back(group_id);
            }
        }
        if group.is_finished() {
            self.finalize_group(group_id);
        }
    }

    fn poll_fiber(&mut self, group: &Rc<FiberGroup>, fiber_id: u64) {
        let Some(fiber) = group.inner.borrow().fibers.get(&fiber_id).map(Rc::clone) else {
            return;
        };
        fiber.scheduled.set(false);
        let Some(mut body) = fiber.body.borrow_mut().take() else {
            return;
        };
        let waker = fiber.waker.borrow().clone();
        let Some(waker) = waker else { return };
        let mut cx = Context::from_waker(&waker);

        let guard = ctx::enter(Rc::clone(group), Rc::clone(&fiber));
        let poll = body.as_mut().poll(&mut cx);
        drop(guard);

        match poll {
            std::task::Poll::Pending => {
                fiber.body.borrow_mut().replace(body);
            }
            std::task::Poll::Ready(()) => {
                group.finish_fiber(&fiber);
            }
        }
    }

    fn collect_finished(&mut self) {
        let finished: Vec<u64> = self
            .groups
            .iter()
            .filter(|(_, g)| g.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            self.finalize_group(id);
        }
    }

    fn finalize_group(&mut self, group_id: u64) {
        if let Some(group) = self.groups.remove(&group_id) {
            tracing::info!(
                target: "skiff::fiber",
                group = %group.name(),
                "group removed from dispatcher"
            );
            // Drop remaining daemon bodies; their drop guards run here.
            group.inner.borrow_mut().fibers.clear();
        }
    }
}

/// Owns the dispatcher thread. All groups created through one dispatcher
/// share that thread.
pub struct Dispatcher {
    tx: Sender<ShareMsg>,
    next_group: AtomicU64,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        let thread_name = format!("skiff-dispatcher-{name}");
        let builder = std::thread::Builder::new().name(thread_name.clone());
        let handle = builder.spawn(move || {
            let timers = Rc::new(RefCell::new(TimerQueue::default()));
            ctx::install_timers(Rc::clone(&timers));
            let mut lp = DispatcherLoop {
                rx,
                groups: HashMap::new(),
                ready_groups: VecDeque::new(),
                timers,
                stopping: false,
            };
            lp.run();
            ctx::clear_timers();
        });
        let thread = match handle {
            Ok(t) => Some(t),
            Err(e) => {
                skf_core::bug("failed to spawn dispatcher thread");
                tracing::error!(target: "skiff::fiber", "spawn {thread_name}: {e}");
                None
            }
        };
        Self {
            tx,
            next_group: AtomicU64::new(1),
            thread: Mutex::new(thread),
        }
    }

    /// Create a fiber group scheduled on this dispatcher.
    #[must_use]
    pub fn create_group(&self, name: &str) -> GroupHandle {
        let group_id = self.next_group.fetch_add(1, Ordering::Relaxed);
        let ext = Arc::new(GroupExtern {
            name: name.to_string(),
            stop: std::sync::atomic::AtomicBool::new(false),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
        });
        let handle = GroupHandle {
            tx: self.tx.clone(),
            group_id,
            ext: Arc::clone(&ext),
        };
        let tx = self.tx.clone();
        let _ = self.tx.send(ShareMsg::External(Box::new(move |lp| {
            lp.add_group(FiberGroup::new(group_id, tx, ext));
        })));
        handle
    }

    /// Ask the loop to exit once every group has finished, then join the
    /// thread. Groups are shut down by their owners, not here.
    pub fn stop(&self) {
        let _ = self
            .tx
            .send(ShareMsg::External(Box::new(|lp| lp.stopping = true)));
        let handle = lock_ignore_poison(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                skf_core::bug("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
