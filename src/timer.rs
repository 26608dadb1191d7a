//! Hierarchical timing wheel, 10 ms per tick.
//!
//! One near wheel of 256 slots covers the next 2.56 s; four far wheels of
//! 64 slots each extend the horizon to the full 32-bit tick range
//! (~497 days). A timer lives on the first wheel whose span contains its
//! remaining distance; crossing a wheel boundary cascades the slot back
//! through insertion, so every timer reaches the near wheel before firing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::handle::Handle;

const TIME_NEAR_SHIFT: u32 = 8;
const TIME_NEAR: usize = 1 << TIME_NEAR_SHIFT;
const TIME_LEVEL_SHIFT: u32 = 6;
const TIME_LEVEL: usize = 1 << TIME_LEVEL_SHIFT;
const TIME_NEAR_MASK: u32 = TIME_NEAR as u32 - 1;
const TIME_LEVEL_MASK: u32 = TIME_LEVEL as u32 - 1;

/// What a timer delivers: a `Response`-kind message with this session to
/// this handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub handle: Handle,
    pub session: i32,
}

#[derive(Debug)]
struct TimerNode {
    expire: u32,
    event: TimerEvent,
}

struct Wheel {
    /// Current tick; wraps after ~497 days, which the cascade handles.
    time: u32,
    near: [Vec<TimerNode>; TIME_NEAR],
    level: [[Vec<TimerNode>; TIME_LEVEL]; 4],
}

impl Wheel {
    fn new() -> Self {
        Self {
            time: 0,
            near: std::array::from_fn(|_| Vec::new()),
            level: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
        }
    }

    fn add_node(&mut self, node: TimerNode) {
        let time = node.expire;
        let current = self.time;
        if (time | TIME_NEAR_MASK) == (current | TIME_NEAR_MASK) {
            self.near[(time & TIME_NEAR_MASK) as usize].push(node);
        } else {
            // find the first level whose span covers the distance; wrapped
            // timers land in the top level's slot 0
            let mut mask: u64 = (TIME_NEAR << TIME_LEVEL_SHIFT) as u64;
            let mut i = 0;
            for _ in 0..3 {
                if u64::from(time) | (mask - 1) == u64::from(current) | (mask - 1) {
                    break;
                }
                mask <<= TIME_LEVEL_SHIFT;
                i += 1;
            }
            let shift = TIME_NEAR_SHIFT + i as u32 * TIME_LEVEL_SHIFT;
            self.level[i][((time >> shift) & TIME_LEVEL_MASK) as usize].push(node);
        }
    }

    fn add(&mut self, ticks: u32, event: TimerEvent) {
        self.add_node(TimerNode {
            expire: self.time.wrapping_add(ticks),
            event,
        });
    }

    fn move_list(&mut self, level: usize, idx: usize) {
        let pending = std::mem::take(&mut self.level[level][idx]);
        for node in pending {
            self.add_node(node);
        }
    }

    /// Advance one tick, cascading any far-wheel slot the new tick exposes.
    fn shift(&mut self) {
        self.time = self.time.wrapping_add(1);
        let ct = self.time;
        if ct == 0 {
            self.move_list(3, 0);
            return;
        }
        let mut mask: u64 = TIME_NEAR as u64;
        let mut time = ct >> TIME_NEAR_SHIFT;
        let mut i = 0;
        while u64::from(ct) & (mask - 1) == 0 {
            let idx = (time & TIME_LEVEL_MASK) as usize;
            if idx != 0 {
                self.move_list(i, idx);
                break;
            }
            mask <<= TIME_LEVEL_SHIFT;
            time >>= TIME_LEVEL_SHIFT;
            i += 1;
        }
    }

    fn drain_current(&mut self) -> Vec<TimerNode> {
        std::mem::take(&mut self.near[(self.time & TIME_NEAR_MASK) as usize])
    }
}

/// The node's clock and timer wheel.
///
/// Two clocks are tracked: the wall pair (`starttime` seconds plus a
/// centisecond offset whose sum is "now"), and a monotonic checkpoint that
/// drives the wheel and is immune to wall-clock adjustment.
pub struct Timer {
    wheel: Mutex<Wheel>,
    origin: Instant,
    starttime: u32,
    current: AtomicU64,
    current_point: AtomicU64,
}

impl Timer {
    pub fn new() -> Self {
        let (sec, cs) = wall_now();
        Self {
            wheel: Mutex::new(Wheel::new()),
            origin: Instant::now(),
            starttime: sec,
            current: AtomicU64::new(u64::from(cs)),
            current_point: AtomicU64::new(0),
        }
    }

    fn monotonic_centis(&self) -> u64 {
        (self.origin.elapsed().as_millis() / 10) as u64
    }

    /// Register a timer firing `ticks` ticks from now. Zero-delay timers
    /// never reach the wheel; the caller delivers those directly.
    pub fn add(&self, ticks: u32, event: TimerEvent) {
        self.wheel.lock().add(ticks, event);
    }

    /// Advance the clock to the current monotonic time, emitting every
    /// expired event. Called from the timer thread only, but safe against
    /// concurrent `add`.
    pub fn update(&self, mut emit: impl FnMut(TimerEvent)) {
        let cp = self.monotonic_centis();
        let prev = self.current_point.load(Ordering::Acquire);
        if cp < prev {
            log::error!(target: "warren::timer", "time diff error: change from {prev} to {cp}");
            self.current_point.store(cp, Ordering::Release);
        } else if cp != prev {
            let diff = cp - prev;
            self.current_point.store(cp, Ordering::Release);
            self.current.fetch_add(diff, Ordering::AcqRel);
            for _ in 0..diff {
                self.tick(&mut emit);
            }
        }
    }

    fn tick(&self, emit: &mut impl FnMut(TimerEvent)) {
        // deliver stragglers that landed on the current tick since the
        // last pass, then advance and deliver the new tick
        self.execute(emit);
        self.wheel.lock().shift();
        self.execute(emit);
    }

    fn execute(&self, emit: &mut impl FnMut(TimerEvent)) {
        loop {
            // the slot may refill while we dispatch unlocked
            let due = self.wheel.lock().drain_current();
            if due.is_empty() {
                return;
            }
            for node in due {
                emit(node.event);
            }
        }
    }

    /// Centiseconds since node start; `starttime + now / 100` is wall time.
    pub fn now(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Wall-clock seconds at node start.
    pub fn starttime(&self) -> u32 {
        self.starttime
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_now() -> (u32, u32) {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (
        since_epoch.as_secs() as u32,
        since_epoch.subsec_nanos() / 10_000_000,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advance(wheel: &mut Wheel, ticks: u32, fired: &mut Vec<TimerEvent>) {
        for _ in 0..ticks {
            fired.extend(wheel.drain_current().into_iter().map(|n| n.event));
            wheel.shift();
            fired.extend(wheel.drain_current().into_iter().map(|n| n.event));
        }
    }

    fn ev(session: i32) -> TimerEvent {
        TimerEvent { handle: 1, session }
    }

    #[test]
    fn same_tick_timer_fires_this_tick() {
        let mut wheel = Wheel::new();
        wheel.add(0, ev(1));
        let due: Vec<_> = wheel.drain_current().into_iter().map(|n| n.event).collect();
        assert_eq!(due, vec![ev(1)]);
    }

    #[test]
    fn near_timer_fires_exactly_on_time() {
        let mut wheel = Wheel::new();
        wheel.add(5, ev(7));

        let mut fired = Vec::new();
        advance(&mut wheel, 4, &mut fired);
        assert!(fired.is_empty());
        advance(&mut wheel, 1, &mut fired);
        assert_eq!(fired, vec![ev(7)]);
    }

    #[test]
    fn fan_out_same_expiry() {
        let mut wheel = Wheel::new();
        for session in 1..=10 {
            wheel.add(300, ev(session));
        }

        let mut fired = Vec::new();
        advance(&mut wheel, 299, &mut fired);
        assert!(fired.is_empty());
        advance(&mut wheel, 1, &mut fired);

        let mut sessions: Vec<_> = fired.iter().map(|e| e.session).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn cascade_across_every_level() {
        // one timer per wheel span boundary
        for ticks in [256u32, 300, 0x4000, 0x4000 + 77, 0x10_0000, 0x400_0000] {
            let mut wheel = Wheel::new();
            wheel.add(ticks, ev(9));
            let mut fired = Vec::new();
            advance(&mut wheel, ticks - 1, &mut fired);
            assert!(fired.is_empty(), "ticks={ticks} fired early");
            advance(&mut wheel, 1, &mut fired);
            assert_eq!(fired, vec![ev(9)], "ticks={ticks} did not fire on time");
        }
    }

    #[test]
    fn staggered_timers_fire_in_tick_order() {
        let mut wheel = Wheel::new();
        wheel.add(3, ev(3));
        wheel.add(1, ev(1));
        wheel.add(2, ev(2));

        let mut fired = Vec::new();
        advance(&mut wheel, 3, &mut fired);
        assert_eq!(fired, vec![ev(1), ev(2), ev(3)]);
    }

    #[test]
    fn wheel_starts_moving_from_nonzero_time() {
        let mut wheel = Wheel::new();
        let mut fired = Vec::new();
        advance(&mut wheel, 1000, &mut fired);

        wheel.add(256, ev(5));
        advance(&mut wheel, 255, &mut fired);
        assert!(fired.is_empty());
        advance(&mut wheel, 1, &mut fired);
        assert_eq!(fired, vec![ev(5)]);
    }
}
