//! The per-process runtime instance.
//!
//! One `Node` aggregates what the subsystems share: the environment, the
//! service registry, the global run queue, the module table, the clock and
//! wheel, the inter-node forwarder hook and the socket layer. Construction
//! follows the initialisation order the subsystems assume; teardown is the
//! reverse and driven by [`crate::runtime`].

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    env::Env,
    handle::{Handle, HandleStorage},
    harbor::Harbor,
    message::{Message, MessageKind, Payload},
    module::ModuleRegistry,
    mq::GlobalQueue,
    socket::{server::SocketServer, SocketApi},
    timer::{Timer, TimerEvent},
};

pub struct Node {
    env: Env,
    harbor: Harbor,
    handles: HandleStorage,
    queue: GlobalQueue,
    modules: ModuleRegistry,
    timer: Timer,
    socket: SocketApi,
    /// The reactor half, taken by the socket thread at startup.
    reactor: Mutex<Option<SocketServer>>,
    /// Live services; shutdown completes when this reaches zero.
    total: AtomicI32,
    /// Service notified on every exit, 0 when unset.
    monitor_exit: AtomicU32,
    /// Cached handle of the `logger` service.
    logger: AtomicU32,
}

impl Node {
    pub fn new(harbor: u32, modules: ModuleRegistry) -> crate::Result<Arc<Self>> {
        let (server, api) = SocketServer::new()?;
        Ok(Arc::new(Self {
            env: Env::new(),
            harbor: Harbor::new(harbor),
            handles: HandleStorage::new(harbor),
            queue: GlobalQueue::new(),
            modules,
            timer: Timer::new(),
            socket: api,
            reactor: Mutex::new(Some(server)),
            total: AtomicI32::new(0),
            monitor_exit: AtomicU32::new(0),
            logger: AtomicU32::new(0),
        }))
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn harbor(&self) -> &Harbor {
        &self.harbor
    }

    pub fn handles(&self) -> &HandleStorage {
        &self.handles
    }

    pub fn queue(&self) -> &GlobalQueue {
        &self.queue
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn socket(&self) -> &SocketApi {
        &self.socket
    }

    pub(crate) fn take_reactor(&self) -> Option<SocketServer> {
        self.reactor.lock().take()
    }

    /// Number of live services.
    pub fn total(&self) -> i32 {
        self.total.load(Ordering::Acquire)
    }

    pub(crate) fn context_inc(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn context_dec(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Keep a service alive past retirement without blocking shutdown:
    /// the extra reference is the caller's, the live count drops here.
    pub(crate) fn context_reserve(&self) {
        self.context_dec();
    }

    /// Deliver a message to a service's mailbox. On failure the message is
    /// dropped (its payload freed) and the destination reported.
    pub fn push_to(&self, handle: Handle, message: Message) -> crate::Result<()> {
        let Some(ctx) = self.handles.grab(handle) else {
            return Err(crate::Error::DestinationNotFound(handle));
        };
        ctx.push_message(self, message);
        Ok(())
    }

    /// Register a timeout of `ticks` 10 ms units for `(handle, session)`.
    /// Non-positive delays are delivered immediately, skipping the wheel.
    pub fn timeout(&self, handle: Handle, ticks: i32, session: i32) -> crate::Result<i32> {
        if ticks <= 0 {
            self.push_to(
                handle,
                Message {
                    source: 0,
                    session,
                    kind: MessageKind::Response,
                    payload: Payload::Empty,
                },
            )?;
        } else {
            self.timer.add(ticks as u32, TimerEvent { handle, session });
        }
        Ok(session)
    }

    /// Advance the clock and deliver expired timers. Timer thread only.
    pub fn update_time(&self) {
        self.timer.update(|event| {
            let _ = self.push_to(
                event.handle,
                Message {
                    source: 0,
                    session: event.session,
                    kind: MessageKind::Response,
                    payload: Payload::Empty,
                },
            );
        });
    }

    /// Centiseconds since node start.
    pub fn now(&self) -> u64 {
        self.timer.now()
    }

    pub fn monitor_exit(&self) -> Handle {
        self.monitor_exit.load(Ordering::Acquire)
    }

    pub fn set_monitor_exit(&self, handle: Handle) {
        self.monitor_exit.store(handle, Ordering::Release);
    }

    /// Retire every service; the runtime exits once workers drain.
    pub fn abort(&self) {
        self.handles.retire_all();
    }

    pub(crate) fn logger_handle(&self) -> Handle {
        let cached = self.logger.load(Ordering::Acquire);
        if cached != 0 {
            return cached;
        }
        let found = self.handles.find_name("logger").unwrap_or(0);
        if found != 0 {
            self.logger.store(found, Ordering::Release);
        }
        found
    }

    pub(crate) fn forget_logger(&self) {
        self.logger.store(0, Ordering::Release);
    }
}
