//! Thread bootstrap and the scheduler loops.
//!
//! Four thread classes drive a node: workers popping mailboxes off the
//! global run queue, a timer thread ticking the wheel every 2.5 ms, the
//! socket thread pumping the reactor, and a monitor thread sampling the
//! workers for stalls every 5 s. Shutdown starts when the last service
//! retires: the timer thread notices, tells the reactor to exit and
//! broadcasts the worker condvar with the quit flag set.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{
    config::Config,
    context::{self, launch, ThreadKind},
    monitor::WorkerMonitor,
    node::Node,
    report,
    socket::PollStatus,
};

/// Per-worker batch weights: the k-th worker uses entry k, extras use 0.
/// Negative weights dispatch one message per mailbox visit (low latency);
/// weight w processes `len >> w` per visit (throughput).
const WEIGHTS: [i32; 32] = [
    -1, -1, -1, -1, 0, 0, 0, 0, //
    1, 1, 1, 1, 1, 1, 1, 1, //
    2, 2, 2, 2, 2, 2, 2, 2, //
    3, 3, 3, 3, 3, 3, 3, 3,
];

#[derive(Default)]
struct SleepState {
    sleeping: usize,
    quit: bool,
}

struct Coordinator {
    monitors: Vec<Arc<WorkerMonitor>>,
    state: Mutex<SleepState>,
    cond: Condvar,
}

impl Coordinator {
    fn new(workers: usize) -> Self {
        Self {
            monitors: (0..workers).map(|_| WorkerMonitor::new()).collect(),
            state: Mutex::new(SleepState::default()),
            cond: Condvar::new(),
        }
    }

    /// Wake one sleeping worker if fewer than `busy` workers are active.
    fn wakeup(&self, busy: usize) {
        let sleeping = self.state.lock().sleeping;
        if sleeping >= self.monitors.len() - busy {
            // a spurious wakeup is harmless
            self.cond.notify_one();
        }
    }

    fn quit(&self) {
        // flip the flag under the lock so a worker cannot slip into its
        // wait between checking the flag and the broadcast
        let mut state = self.state.lock();
        state.quit = true;
        self.cond.notify_all();
    }

    fn should_quit(&self) -> bool {
        self.state.lock().quit
    }
}

fn worker_main(node: Arc<Node>, coord: Arc<Coordinator>, id: usize, weight: i32) {
    context::init_thread(ThreadKind::Worker);
    let monitor = coord.monitors[id].clone();
    let mut mailbox = None;
    loop {
        mailbox = context::message_dispatch(&node, &monitor, mailbox, weight);
        if mailbox.is_none() {
            let mut state = coord.state.lock();
            if state.quit {
                break;
            }
            state.sleeping += 1;
            coord.cond.wait(&mut state);
            state.sleeping -= 1;
            if state.quit {
                break;
            }
        } else if coord.should_quit() {
            break;
        }
    }
}

fn timer_main(node: Arc<Node>, coord: Arc<Coordinator>) {
    context::init_thread(ThreadKind::Timer);
    loop {
        node.update_time();
        if node.total() == 0 {
            break;
        }
        coord.wakeup(coord.monitors.len() - 1);
        std::thread::sleep(Duration::from_micros(2500));
    }
    // the reactor blocks in its wait; tell it to come out
    node.socket().exit();
    coord.quit();
}

fn socket_main(node: Arc<Node>, coord: Arc<Coordinator>) {
    context::init_thread(ThreadKind::Socket);
    let Some(mut server) = node.take_reactor() else {
        log::error!(target: "warren::runtime", "socket thread started twice");
        return;
    };
    loop {
        match node.socket_poll(&mut server) {
            PollStatus::Exit => break,
            PollStatus::Busy => {
                if node.total() == 0 {
                    break;
                }
            }
            PollStatus::Idle => coord.wakeup(0),
        }
    }
}

fn monitor_main(node: Arc<Node>, coord: Arc<Coordinator>) {
    context::init_thread(ThreadKind::Monitor);
    loop {
        if node.total() == 0 {
            break;
        }
        for monitor in &coord.monitors {
            monitor.check(&node);
        }
        for _ in 0..5 {
            if node.total() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

/// Run the scheduler with `threads` workers until every service retires.
pub fn start(node: &Arc<Node>, threads: usize) {
    let threads = threads.max(1);
    let coord = Arc::new(Coordinator::new(threads));

    let mut handles = Vec::with_capacity(threads + 3);
    for (name, entry) in [
        ("monitor", monitor_main as fn(Arc<Node>, Arc<Coordinator>)),
        ("timer", timer_main),
        ("socket", socket_main),
    ] {
        let node = node.clone();
        let coord = coord.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || entry(node, coord))
            .expect("spawning runtime thread");
        handles.push(handle);
    }

    for id in 0..threads {
        let weight = WEIGHTS.get(id).copied().unwrap_or(0);
        let node = node.clone();
        let coord = coord.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_main(node, coord, id, weight))
            .expect("spawning worker thread");
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
}

/// Bring a node up the way the binary does: seed the environment from the
/// config, launch the log service and the bootstrap service, then run the
/// scheduler until shutdown. Returns an error if startup fails.
pub fn run(node: &Arc<Node>, config: &Config) -> crate::Result<()> {
    context::init_thread(ThreadKind::Main);
    config.seed(node.env());

    let logservice = config.logservice.as_str();
    let logger = launch(node, logservice, config.logger.as_deref().unwrap_or(""))
        .map_err(|_| crate::Error::LaunchFailed(logservice.to_owned()))?;

    if !config.bootstrap.is_empty() {
        let mut parts = config.bootstrap.splitn(2, char::is_whitespace);
        let module = parts.next().unwrap_or_default();
        let args = parts.next().unwrap_or("");
        if let Err(err) = launch(node, module, args) {
            report::error(node, 0, format!("Bootstrap error: {}", config.bootstrap));
            // flush whatever the logger has before giving up
            logger.dispatch_all();
            return Err(err);
        }
    }

    start(node, config.threads);

    node.harbor().exit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_table_shape() {
        assert_eq!(WEIGHTS.len(), 32);
        assert_eq!(WEIGHTS.iter().filter(|w| **w < 0).count(), 4);
        assert_eq!(WEIGHTS.iter().filter(|w| **w == 0).count(), 4);
        assert_eq!(WEIGHTS.iter().filter(|w| **w == 1).count(), 8);
        assert_eq!(WEIGHTS.iter().filter(|w| **w == 2).count(), 8);
        assert_eq!(WEIGHTS.iter().filter(|w| **w == 3).count(), 8);
    }
}
