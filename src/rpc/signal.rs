//! One-shot "done" signal observable by any number of tasks.

use tokio::sync::watch;

/// Fires at most once; every waiter, present or future, observes it.
#[derive(Debug)]
pub struct DoneSignal {
    tx: watch::Sender<bool>,
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DoneSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on fire.
        let _ = rx.wait_for(|done| *done).await;
    }
}
