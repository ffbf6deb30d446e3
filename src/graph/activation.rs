//! Per-node activation records.
//!
//! One [`ActivationRecord`] lives in a shared memory block per node so that
//! peers in other processes can decrement and signal it too. The layout is
//! bit-exact and all mutation goes through atomics; the record is the only
//! structure touched by both the main thread and the realtime thread.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Scheduling status of a node within the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeStatus {
    NotTriggered = 0,
    Triggered = 1,
    Awake = 2,
    Finished = 3,
}

impl NodeStatus {
    pub fn from_u32(v: u32) -> NodeStatus {
        match v {
            1 => NodeStatus::Triggered,
            2 => NodeStatus::Awake,
            3 => NodeStatus::Finished,
            _ => NodeStatus::NotTriggered,
        }
    }
}

/// One (pending, required) counter pair plus the process status slot of the
/// owning node for that cycle generation.
#[repr(C)]
#[derive(Debug)]
pub struct ActivationState {
    pending: AtomicI32,
    required: AtomicI32,
    status: AtomicI32,
}

impl ActivationState {
    /// Re-arm for a new cycle: `pending := required`.
    pub fn reset(&self) {
        self.pending
            .store(self.required.load(Ordering::Relaxed), Ordering::Release);
    }

    pub fn increment_required(&self) {
        self.required.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_required(&self) {
        self.required.fetch_sub(1, Ordering::Relaxed);
    }

    /// Atomically decrement `pending`.
    ///
    /// Returns true exactly once per cycle, for the caller that observes the
    /// transition to zero; that caller must signal the target. Acquire /
    /// release ordering makes every write done by upstream nodes before their
    /// decrement visible to the signalling caller.
    pub fn dec_pending(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn required(&self) -> i32 {
        self.required.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }
}

/// Clock snapshot written by the driver backend each cycle.
#[repr(C)]
#[derive(Debug)]
pub struct ClockInfo {
    rate_num: AtomicU32,
    rate_den: AtomicU32,
    position: AtomicU64,
    duration: AtomicU64,
    id: AtomicU32,
    _padding: u32,
}

impl ClockInfo {
    pub fn set_rate(&self, num: u32, den: u32) {
        self.rate_num.store(num, Ordering::Relaxed);
        self.rate_den.store(den, Ordering::Relaxed);
    }

    pub fn rate(&self) -> (u32, u32) {
        (
            self.rate_num.load(Ordering::Relaxed),
            self.rate_den.load(Ordering::Relaxed),
        )
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Advance the clock by `duration` frames. Called by the driver backend
    /// from the realtime context.
    pub fn advance(&self, duration: u64) {
        self.duration.store(duration, Ordering::Relaxed);
        self.position.fetch_add(duration, Ordering::Release);
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> u64 {
        self.duration.load(Ordering::Relaxed)
    }
}

/// Position block embedded in the activation record; `size` is the cycle
/// quantum in frames.
#[repr(C)]
#[derive(Debug)]
pub struct Position {
    pub clock: ClockInfo,
    size: AtomicU32,
    _padding: u32,
}

impl Position {
    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Relaxed);
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Relaxed)
    }
}

/// Fixed-layout activation record, one per node, placed in shared memory.
///
/// Field order matters: two state generations, the cycle timestamps, the
/// node status and the driver-owned running flag, then the embedded position
/// block. Everything is 8-byte aligned, native endianness.
#[repr(C)]
#[derive(Debug)]
pub struct ActivationRecord {
    state: [ActivationState; 2],
    signal_time: AtomicU64,
    awake_time: AtomicU64,
    finish_time: AtomicU64,
    status: AtomicU32,
    running: AtomicU32,
    pub position: Position,
}

impl ActivationRecord {
    /// In-place initialization of freshly mapped zeroed memory.
    ///
    /// Zeroed memory is already a valid record (all counters zero, status
    /// not-triggered); this only seeds the clock defaults.
    pub fn init(&self, default_quantum: u32) {
        self.position.clock.set_rate(1, 48000);
        self.position.set_size(default_quantum);
    }

    /// Counter pair of the current cycle generation.
    pub fn state(&self) -> &ActivationState {
        &self.state[0]
    }

    /// Counter pair of the next cycle generation, reserved for drivers that
    /// pipeline two cycles.
    pub fn next_state(&self) -> &ActivationState {
        &self.state[1]
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running as u32, Ordering::Release);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire) != 0
    }

    pub fn set_signal_time(&self, nsec: u64) {
        self.signal_time.store(nsec, Ordering::Relaxed);
    }

    pub fn signal_time(&self) -> u64 {
        self.signal_time.load(Ordering::Relaxed)
    }

    pub fn set_awake_time(&self, nsec: u64) {
        self.awake_time.store(nsec, Ordering::Relaxed);
    }

    pub fn awake_time(&self) -> u64 {
        self.awake_time.load(Ordering::Relaxed)
    }

    pub fn set_finish_time(&self, nsec: u64) {
        self.finish_time.store(nsec, Ordering::Relaxed);
    }

    pub fn finish_time(&self) -> u64 {
        self.finish_time.load(Ordering::Relaxed)
    }
}

/// Monotonic timestamp in nanoseconds, comparable across processes on the
/// same machine.
pub fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
