//! Outstanding native work per run loop.
//!
//! Every bridged call adds a job before its native work starts and marks it
//! done exactly once when its completion is delivered back to the loop.
//! While any job is outstanding the loop holds a keep-alive and never idles
//! out.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct Job {
    outstanding: AtomicUsize,
    keep_alive: AtomicBool,
}

impl Job {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one outstanding native call.
    pub fn add(&self) {
        if self.outstanding.fetch_add(1, Ordering::SeqCst) == 0 {
            self.keep_alive.store(true, Ordering::SeqCst);
            tracing::trace!("keep-alive installed");
        }
    }

    /// Mark one native call as settled.
    pub fn done(&self) {
        let previous = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.keep_alive.store(false, Ordering::SeqCst);
                tracing::trace!("keep-alive released");
            }
            Ok(_) => {}
            Err(_) => tracing::warn!("job counter underflow ignored"),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_kept_alive(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }
}
