//! Single-slot, first-write-wins result cell.
//!
//! The RPC task, the HTTP task and the signal watcher all race to decide how
//! `Service::start` ends. Only the first report is delivered; later reports
//! are dropped without blocking the reporter.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Reporting half of a first-outcome cell. Cheap to clone.
#[derive(Debug)]
pub struct FirstOutcome<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for FirstOutcome<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

/// Receiving half: resolves with the first reported value.
pub type OutcomeReceiver<T> = oneshot::Receiver<T>;

/// Create a new cell.
pub fn first_outcome<T>() -> (FirstOutcome<T>, OutcomeReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (
        FirstOutcome {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

impl<T> FirstOutcome<T> {
    /// Report a value. Returns `true` if this report won the race.
    pub fn report(&self, value: T) -> bool {
        let sender = self.slot.lock().take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Whether a value has already been reported.
    pub fn is_decided(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_report_wins() {
        let (cell, rx) = first_outcome::<&'static str>();
        let other = cell.clone();

        assert!(!cell.is_decided());
        assert!(cell.report("rpc failed"));
        assert!(!other.report("http failed"));
        assert!(other.is_decided());

        assert_eq!(rx.await.unwrap(), "rpc failed");
    }

    #[tokio::test]
    async fn test_concurrent_reports_deliver_exactly_one() {
        let (cell, rx) = first_outcome::<usize>();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.report(i) })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(rx.await.unwrap() < 16);
    }

    #[test]
    fn test_report_after_receiver_dropped() {
        let (cell, rx) = first_outcome::<u8>();
        drop(rx);
        assert!(!cell.report(1));
        assert!(cell.is_decided());
    }
}
