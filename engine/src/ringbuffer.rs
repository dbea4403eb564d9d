//! C1 — the lock-free ring buffer that carries the command/telemetry
//! protocol (C2) between the audio thread and the service thread.
//!
//! One reader, one writer, by default. `MULTI_WRITER` adds a mutex around
//! the write path only — the reader side never takes it, so the audio
//! thread can stay the reader of `commands_in` while several service-side
//! callers submit from different threads. `SEMAPHORE_READER` adds a
//! condvar-backed wait so a non-realtime reader can block instead of
//! spinning; the audio thread never sets it.
//!
//! Parameterized with const generics instead of runtime flags so the two
//! ring shapes used in this crate (see DESIGN.md) monomorphize to
//! different code paths at compile time, and `AtomicUsize` cursors with
//! acquire/release ordering for the read/write positions.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    Timeout,
    Closed,
}

/// Condvar-gated counting semaphore used by the reader side when
/// `SEMAPHORE_READER` is set. `post` is called by writers after a
/// successful write; `close` wakes every waiter permanently.
struct Semaphore {
    state: Mutex<(u64, bool)>, // (permits, closed)
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.0 += 1;
        self.cv.notify_one();
    }

    fn close(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.1 = true;
        self.cv.notify_all();
    }

    fn wait_until(&self, deadline: Option<Instant>) -> WaitResult {
        let mut guard = self.state.lock().unwrap();
        loop {
            if guard.0 > 0 {
                guard.0 -= 1;
                return WaitResult::Ready;
            }
            if guard.1 {
                return WaitResult::Closed;
            }
            match deadline {
                None => guard = self.cv.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::Timeout;
                    }
                    let (next, timed_out) =
                        self.cv.wait_timeout(guard, deadline - now).unwrap();
                    guard = next;
                    if timed_out.timed_out() && guard.0 == 0 && !guard.1 {
                        return WaitResult::Timeout;
                    }
                }
            }
        }
    }
}

fn next_power_of_two(n: usize) -> usize {
    n.next_power_of_two().max(2)
}

/// A byte queue with a power-of-two capacity. `MULTI_WRITER` guards the
/// write path with a mutex; `SEMAPHORE_READER` gives the reader a blocking
/// wait. The audio thread is always the reader for `events_out` and always
/// the (single, lock-free) writer for... no, wait: it is the *reader* of
/// `commands_in` and the *writer* of `events_out`. Either way the audio
/// thread never touches `write_mutex` or `Semaphore`.
pub struct RingBuffer<const MULTI_WRITER: bool, const SEMAPHORE_READER: bool> {
    buffer: UnsafeCell<Box<[u8]>>,
    mask: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    write_mutex: Mutex<()>,
    semaphore: Option<Semaphore>,
    overflow_count: AtomicUsize,
    mlocked: bool,
}

// SAFETY: all access to `buffer` is mediated by the read_pos/write_pos
// atomics (acquire/release) plus, for MULTI_WRITER, `write_mutex`. A reader
// never observes bytes a writer hasn't released, and writers never observe
// bytes the reader hasn't yet claimed back as free space.
unsafe impl<const W: bool, const S: bool> Send for RingBuffer<W, S> {}
unsafe impl<const W: bool, const S: bool> Sync for RingBuffer<W, S> {}

impl<const MULTI_WRITER: bool, const SEMAPHORE_READER: bool> RingBuffer<MULTI_WRITER, SEMAPHORE_READER> {
    pub fn new(capacity: usize, mlock: bool) -> Self {
        let capacity = next_power_of_two(capacity);
        let buffer = vec![0u8; capacity].into_boxed_slice();

        let mut mlocked = false;
        if mlock {
            #[cfg(unix)]
            {
                let ptr = buffer.as_ptr() as *const libc::c_void;
                let rc = unsafe { libc::mlock(ptr, buffer.len()) };
                if rc == 0 {
                    mlocked = true;
                } else {
                    log::warn!("mlock failed for ring buffer of {} bytes", buffer.len());
                }
            }
        }

        Self {
            buffer: UnsafeCell::new(buffer),
            mask: capacity - 1,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            write_mutex: Mutex::new(()),
            semaphore: if SEMAPHORE_READER { Some(Semaphore::new()) } else { None },
            overflow_count: AtomicUsize::new(0),
            mlocked,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn is_mlocked(&self) -> bool {
        self.mlocked
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Bytes available to write, reserving one byte so full and empty are
    /// distinguishable.
    pub fn write_space(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        self.capacity() - 1 - write.wrapping_sub(read).min(self.capacity())
    }

    pub fn read_space(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    fn copy_in(&self, start: usize, data: &[u8]) {
        let buf = unsafe { &mut *self.buffer.get() };
        for (i, b) in data.iter().enumerate() {
            buf[(start.wrapping_add(i)) & self.mask] = *b;
        }
    }

    fn copy_out(&self, start: usize, out: &mut [u8]) {
        let buf = unsafe { &*self.buffer.get() };
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = buf[(start.wrapping_add(i)) & self.mask];
        }
    }

    /// Writes `data` as a single, atomically-visible run, or writes nothing.
    /// Never blocks: on insufficient space, bumps the overflow counter and
    /// returns `false`.
    pub fn write(&self, data: &[u8]) -> bool {
        self.write_two(data, &[])
    }

    /// Writes two disjoint slices back to back as one atomic frame — used
    /// to append a header and a payload without an intermediate copy.
    pub fn write_two(&self, a: &[u8], b: &[u8]) -> bool {
        let _guard = if MULTI_WRITER {
            Some(self.write_mutex.lock().unwrap())
        } else {
            None
        };

        let total = a.len() + b.len();
        if self.write_space() < total {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let start = self.write_pos.load(Ordering::Relaxed);
        self.copy_in(start, a);
        self.copy_in(start.wrapping_add(a.len()), b);
        self.write_pos.store(start.wrapping_add(total), Ordering::Release);

        if let Some(sem) = &self.semaphore {
            sem.post();
        }
        true
    }

    /// Reads exactly `out.len()` bytes if available, or leaves the ring
    /// untouched and returns `false`. The sole reader never blocks here;
    /// `wait_for`/`wait_until` are the blocking counterparts for
    /// `SEMAPHORE_READER` rings.
    pub fn try_read(&self, out: &mut [u8]) -> bool {
        if self.read_space() < out.len() {
            return false;
        }
        let start = self.read_pos.load(Ordering::Relaxed);
        self.copy_out(start, out);
        self.read_pos.store(start.wrapping_add(out.len()), Ordering::Release);
        true
    }

    /// Marks the ring closed: wakes any blocked reader with
    /// [`WaitResult::Closed`] forever after.
    pub fn close(&self) {
        if let Some(sem) = &self.semaphore {
            sem.close();
        }
    }

    pub fn wait_for(&self, timeout: Duration) -> WaitResult {
        self.wait_until(Instant::now() + timeout)
    }

    pub fn wait_until(&self, deadline: Instant) -> WaitResult {
        match &self.semaphore {
            Some(sem) => sem.wait_until(Some(deadline)),
            None => panic!("wait_until called on a ring without SEMAPHORE_READER"),
        }
    }
}

/// `commands_in`: service (and possibly multiple GUI-adjacent callers) write,
/// the audio thread reads without ever blocking.
pub type CommandRing = RingBuffer<true, false>;

/// `events_out`: the audio thread writes, the service thread reads with a
/// blocking semaphore wait bounded by a poll interval.
pub type EventRing = RingBuffer<false, true>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes_and_order() {
        let ring: RingBuffer<false, false> = RingBuffer::new(64, false);
        assert!(ring.write(b"hello"));
        assert!(ring.write(b"world"));

        let mut buf = [0u8; 5];
        assert!(ring.try_read(&mut buf));
        assert_eq!(&buf, b"hello");
        assert!(ring.try_read(&mut buf));
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn write_fails_without_blocking_when_full() {
        let ring: RingBuffer<false, false> = RingBuffer::new(8, false);
        assert!(ring.write(&[0u8; 7]));
        assert!(!ring.write(&[1u8; 1]));
        assert_eq!(ring.overflow_count(), 1);
    }

    #[test]
    fn partial_frames_never_surface() {
        let ring: RingBuffer<false, false> = RingBuffer::new(16, false);
        // A write that doesn't fit must leave read_space unchanged — no
        // half-written frame becomes visible.
        let before = ring.read_space();
        assert!(!ring.write(&[0u8; 64]));
        assert_eq!(ring.read_space(), before);
    }

    #[test]
    fn two_part_write_is_one_atomic_frame() {
        let ring: RingBuffer<false, false> = RingBuffer::new(32, false);
        assert!(ring.write_two(&[1, 2], &[3, 4, 5]));
        let mut buf = [0u8; 5];
        assert!(ring.try_read(&mut buf));
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn semaphore_reader_wakes_on_write() {
        let ring: EventRing = RingBuffer::new(64, false);
        assert!(ring.write(b"x"));
        assert_eq!(ring.wait_for(Duration::from_millis(50)), WaitResult::Ready);
    }

    #[test]
    fn semaphore_reader_times_out_when_empty() {
        let ring: EventRing = RingBuffer::new(64, false);
        assert_eq!(ring.wait_for(Duration::from_millis(10)), WaitResult::Timeout);
    }

    #[test]
    fn closed_ring_reports_closed() {
        let ring: EventRing = RingBuffer::new(64, false);
        ring.close();
        assert_eq!(ring.wait_for(Duration::from_millis(10)), WaitResult::Closed);
    }
}
