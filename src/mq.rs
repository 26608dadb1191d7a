//! Per-service mailboxes and the global run queue.
//!
//! A mailbox is either idle (not queued anywhere), queued on the global run
//! queue, or held by the one worker currently draining it. The `in_global`
//! flag covers the latter two states: a push sets it and enqueues the
//! mailbox only on the false→true transition, and only a worker that has
//! observed the mailbox empty under its lock clears it. This is the central
//! invariant of the scheduler: no mailbox is ever drained by two workers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{handle::Handle, message::Message};

const DEFAULT_QUEUE_SIZE: usize = 64;
const OVERLOAD_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Inner {
    ring: VecDeque<Message>,
    in_global: bool,
    release: bool,
    overload: usize,
    overload_threshold: usize,
}

/// A service's message queue.
#[derive(Debug)]
pub struct Mailbox {
    handle: std::sync::atomic::AtomicU32,
    inner: Mutex<Inner>,
}

impl Mailbox {
    /// A fresh mailbox starts with `in_global` set: it is created between
    /// service create and service init, and messages arriving in that
    /// window must not schedule the half-built service. Launch pushes the
    /// mailbox onto the run queue once init succeeds.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handle: std::sync::atomic::AtomicU32::new(0),
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(DEFAULT_QUEUE_SIZE),
                in_global: true,
                release: false,
                overload: 0,
                overload_threshold: OVERLOAD_THRESHOLD,
            }),
        })
    }

    pub fn bind(&self, handle: Handle) {
        self.handle
            .store(handle, std::sync::atomic::Ordering::Release);
    }

    /// Owning service address.
    pub fn handle(&self) -> Handle {
        self.handle.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a message, scheduling the mailbox on the run queue if it was
    /// idle.
    pub fn push(mailbox: &Arc<Self>, global: &GlobalQueue, message: Message) {
        let mut inner = mailbox.inner.lock();
        inner.ring.push_back(message);
        if !inner.in_global {
            inner.in_global = true;
            global.push(mailbox.clone());
        }
    }

    /// Dequeue one message. Returns `None` when empty, which also clears
    /// `in_global`: the caller must be the worker holding this mailbox.
    ///
    /// Tracks overload on the way: whenever the remaining depth exceeds the
    /// threshold the depth is recorded and the threshold doubles; draining
    /// to empty resets the threshold.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        match inner.ring.pop_front() {
            Some(message) => {
                let length = inner.ring.len();
                while length > inner.overload_threshold {
                    inner.overload = length;
                    inner.overload_threshold *= 2;
                }
                Some(message)
            }
            None => {
                inner.overload_threshold = OVERLOAD_THRESHOLD;
                inner.in_global = false;
                None
            }
        }
    }

    /// Fetch and clear the pending overload report, if any.
    pub fn take_overload(&self) -> usize {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.overload)
    }

    /// Flag the mailbox for destruction and make sure a worker will visit
    /// it to perform the final drain.
    pub fn mark_release(mailbox: &Arc<Self>, global: &GlobalQueue) {
        let mut inner = mailbox.inner.lock();
        debug_assert!(!inner.release);
        inner.release = true;
        if !inner.in_global {
            inner.in_global = true;
            global.push(mailbox.clone());
        }
    }

    /// Destroy the mailbox if it has been marked, running `drop_message`
    /// for every queued message; otherwise put it back on the run queue.
    ///
    /// The caller must hold the mailbox off the run queue (a worker that
    /// just popped it).
    pub fn release(self: Arc<Self>, global: &GlobalQueue, mut drop_message: impl FnMut(Message)) {
        let marked = self.inner.lock().release;
        if marked {
            // pop re-locks per message; the drop handler may send.
            while let Some(message) = self.pop() {
                drop_message(message);
            }
        } else {
            global.push(self);
        }
    }

    #[cfg(test)]
    fn threshold(&self) -> usize {
        self.inner.lock().overload_threshold
    }
}

/// FIFO of runnable mailboxes, consumed by the worker threads.
#[derive(Debug, Default)]
pub struct GlobalQueue {
    queue: Mutex<VecDeque<Arc<Mailbox>>>,
}

impl GlobalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, mailbox: Arc<Mailbox>) {
        self.queue.lock().push_back(mailbox);
    }

    pub fn pop(&self) -> Option<Arc<Mailbox>> {
        self.queue.lock().pop_front()
    }
}
