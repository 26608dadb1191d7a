//! Stall detection for worker threads.
//!
//! Before invoking a service callback the worker records the
//! (source, destination) pair and bumps `version`; after the callback it
//! bumps `version` again with a cleared destination. The monitor thread
//! samples every worker on a 5 s period: an unchanged version with a
//! non-zero destination means the same dispatch has been running for the
//! whole interval.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::{handle::Handle, node::Node, report};

#[derive(Debug, Default)]
pub struct WorkerMonitor {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

impl WorkerMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the start (`destination != 0`) or end (`destination == 0`)
    /// of one dispatch.
    pub fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source, Ordering::Relaxed);
        self.destination.store(destination, Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// One monitor-thread sample; flags the destination service and logs
    /// when a dispatch spans the whole interval.
    pub fn check(&self, node: &Node) {
        let version = self.version.load(Ordering::Acquire);
        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = self.destination.load(Ordering::Relaxed);
            if destination != 0 {
                if let Some(ctx) = node.handles().grab(destination) {
                    ctx.mark_endless();
                }
                report::error(
                    node,
                    0,
                    format!(
                        "A message from [ :{:08x} ] to [ :{:08x} ] maybe in an endless loop (version = {})",
                        self.source.load(Ordering::Relaxed),
                        destination,
                        version
                    ),
                );
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }
    }
}
