//! Exit notification between the kernel and the monitor.
//!
//! The kernel side holds an [`ExitNotifier`] and signals it each time the virtual CPU exits; the
//! monitor blocks on the matching [`ExitReceiver`], spinning or through a caller-supplied wait
//! strategy. Neither end is `Clone`, so there is exactly one producer and one consumer. Signals
//! that arrive while nobody waits are counted, not lost.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct ExitSignal {
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// Creates a connected notifier/receiver pair.
pub fn exit_channel() -> (ExitNotifier, ExitReceiver) {
    let signal = Arc::new(ExitSignal {
        pending: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });
    (
        ExitNotifier {
            signal: signal.clone(),
        },
        ExitReceiver { signal },
    )
}

/// The producing end, owned by whatever reports guest exits.
pub struct ExitNotifier {
    signal: Arc<ExitSignal>,
}

impl ExitNotifier {
    /// Reports one exit.
    pub fn notify(&self) {
        self.signal.pending.fetch_add(1, Ordering::Release);
    }
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        self.signal.closed.store(true, Ordering::Release);
    }
}

/// The consuming end, owned by the monitor.
pub struct ExitReceiver {
    signal: Arc<ExitSignal>,
}

impl ExitReceiver {
    /// Consumes all pending exit signals without blocking, returning how many there were.
    pub fn try_recv(&self) -> usize {
        self.signal.pending.swap(0, Ordering::Acquire)
    }

    /// Blocks until at least one exit is pending and consumes it, busy-waiting in between.
    ///
    /// Returns `None` once the notifier is gone and nothing is pending.
    pub fn recv(&self) -> Option<usize> {
        self.recv_with(core::hint::spin_loop)
    }

    /// Like [`ExitReceiver::recv`], but calls `wait` each time nothing is pending, so the caller
    /// can block on a kernel event or yield instead of spinning.
    pub fn recv_with(&self, mut wait: impl FnMut()) -> Option<usize> {
        loop {
            match self.try_recv() {
                0 if self.signal.closed.load(Ordering::Acquire) => {
                    return match self.try_recv() {
                        0 => None,
                        n => Some(n),
                    };
                }
                0 => wait(),
                n => return Some(n),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn signals_are_counted() {
        let (tx, rx) = exit_channel();
        assert_eq!(rx.try_recv(), 0);
        tx.notify();
        tx.notify();
        assert_eq!(rx.recv(), Some(2));
        assert_eq!(rx.try_recv(), 0);
    }

    #[test]
    fn recv_blocks_until_notified_from_another_thread() {
        let (tx, rx) = exit_channel();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            tx.notify();
            tx
        });
        assert_eq!(rx.recv(), Some(1));
        drop(producer.join().unwrap());
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn recv_with_waits_until_notified() {
        let (tx, rx) = exit_channel();
        let mut waits = 0;
        let received = rx.recv_with(|| {
            waits += 1;
            if waits == 3 {
                tx.notify();
            }
        });
        assert_eq!(received, Some(1));
        assert_eq!(waits, 3);

        // Pending signals are taken without waiting.
        tx.notify();
        assert_eq!(rx.recv_with(|| panic!("nothing to wait for")), Some(1));
    }
}
