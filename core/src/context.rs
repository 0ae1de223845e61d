//! Process-local identity: cached pid/ppid, thread sequence, and RNG
//!
//! A process must know its own identity cheaply after fork, and stale
//! cached thread identity must never leak across the fork boundary. This
//! module models that as explicit state owned by a [`ProcessContext`]
//! value, repaired by [`ProcessContext::refresh_after_fork`], instead of
//! ambient mutable globals.

use nix::unistd::{getpid, getppid, Pid};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Counter for generating process-unique thread sequence numbers
static THREAD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-local identity owned by the main thread of a process.
///
/// One instance exists per process; a forked child inherits the parent's
/// copy and must call [`refresh_after_fork`](Self::refresh_after_fork)
/// before relying on any field.
#[derive(Debug)]
pub struct ProcessContext {
    pid: Pid,
    ppid: Pid,
    /// Cached thread sequence number; `None` means "not yet assigned in
    /// this process" and is the state a fresh fork child starts from.
    thread_seq: Option<u64>,
    rng_state: u64,
}

impl ProcessContext {
    /// Capture the identity of the calling process.
    pub fn capture() -> Self {
        let mut ctx = Self {
            pid: getpid(),
            ppid: getppid(),
            thread_seq: None,
            rng_state: 0,
        };
        ctx.reseed_rng();
        ctx
    }

    /// The cached process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The pid of the process that created this one.
    pub fn ppid(&self) -> Pid {
        self.ppid
    }

    /// The cached thread sequence number, assigned on first use.
    ///
    /// The number identifies the calling thread within this process only;
    /// it is discarded across fork so a child never reuses its parent's
    /// value.
    pub fn thread_seq(&mut self) -> u64 {
        match self.thread_seq {
            Some(seq) => seq,
            None => {
                let seq = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
                self.thread_seq = Some(seq);
                seq
            }
        }
    }

    /// Post-fork repair: re-read the process id, record the parent, and
    /// drop the inherited thread sequence.
    pub fn refresh_after_fork(&mut self) {
        let old = self.pid;
        self.pid = getpid();
        self.ppid = old;
        self.thread_seq = None;
        debug!("process context refreshed after fork: pid {}", self.pid);
    }

    /// Seed the process-local random generator from the process identity
    /// and the current clock, so parent and child diverge immediately.
    pub fn reseed_rng(&mut self) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let seed = (self.pid.as_raw() as u64)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(u64::from(nanos));
        // xorshift state must be nonzero
        self.rng_state = if seed == 0 { 0x2545_f491_4f6c_dd1d } else { seed };
    }

    /// Next value of the process-local generator (xorshift64*).
    pub fn random(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_matches_current_process() {
        let ctx = ProcessContext::capture();
        assert_eq!(ctx.pid(), getpid());
        assert_eq!(ctx.ppid(), getppid());
    }

    #[test]
    fn test_thread_seq_is_cached_until_refreshed() {
        let mut ctx = ProcessContext::capture();
        let first = ctx.thread_seq();
        assert_eq!(ctx.thread_seq(), first);

        ctx.refresh_after_fork();
        // A refreshed context must not reuse the inherited sequence.
        assert_ne!(ctx.thread_seq(), first);
    }

    #[test]
    fn test_refresh_records_previous_pid_as_parent() {
        let mut ctx = ProcessContext::capture();
        let before = ctx.pid();
        ctx.refresh_after_fork();
        // Without an actual fork the pid is unchanged, but the parent slot
        // must hold the pre-refresh pid.
        assert_eq!(ctx.ppid(), before);
    }

    #[test]
    fn test_rng_sequence_is_deterministic_for_a_seed() {
        let mut a = ProcessContext::capture();
        let mut b = ProcessContext::capture();
        a.rng_state = 42;
        b.rng_state = 42;
        let sa: Vec<u64> = (0..8).map(|_| a.random()).collect();
        let sb: Vec<u64> = (0..8).map(|_| b.random()).collect();
        assert_eq!(sa, sb);
    }

    #[test]
    fn test_reseed_never_zeroes_the_state() {
        let mut ctx = ProcessContext::capture();
        for _ in 0..16 {
            ctx.reseed_rng();
            assert_ne!(ctx.rng_state, 0);
        }
    }
}
