use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::storage::options::ProgressCallback;
use crate::types::{FtError, Result};

/// Shared progress counter for the merge and write phases.
///
/// Work is counted in row moves: every row emitted by a merge pass or placed
/// in a leaf is one unit. The callback runs whenever the completed fraction
/// crosses another thousandth, and returning false cancels the load. Calls
/// are serialized so the callback sees non-decreasing fractions.
pub(crate) struct Progress {
    cb: Option<ProgressCallback>,
    total: u64,
    done: AtomicU64,
    reported: Mutex<u64>,
}

impl Progress {
    pub(crate) fn new(cb: Option<ProgressCallback>, total: u64) -> Self {
        Self {
            cb,
            total: total.max(1),
            done: AtomicU64::new(0),
            reported: Mutex::new(0),
        }
    }

    /// Adds `units` of completed work.
    pub(crate) fn advance(&self, units: u64) -> Result<()> {
        let Some(cb) = &self.cb else {
            return Ok(());
        };
        let done = self.done.fetch_add(units, Ordering::Relaxed) + units;
        let permille = (done.min(self.total) * 1000) / self.total;
        let mut reported = self.reported.lock();
        if *reported >= permille {
            return Ok(());
        }
        *reported = permille;
        if cb(permille as f64 / 1000.0) {
            Ok(())
        } else {
            debug!(permille, "loader.progress.cancelled");
            Err(FtError::Cancelled)
        }
    }

    /// Reports completion.
    pub(crate) fn finish(&self) -> Result<()> {
        let _reported = self.reported.lock();
        match &self.cb {
            Some(cb) if !cb(1.0) => Err(FtError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reports_monotonic_fractions_and_cancels() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |f| {
            sink.lock().push(f);
            f < 0.5
        });
        let p = Progress::new(Some(cb), 10);
        p.advance(1).unwrap();
        p.advance(0).unwrap();
        p.advance(3).unwrap();
        assert!(matches!(p.advance(1), Err(FtError::Cancelled)));
        assert_eq!(*seen.lock(), vec![0.1, 0.4, 0.5]);
    }

    #[test]
    fn no_callback_never_cancels() {
        let p = Progress::new(None, 0);
        p.advance(100).unwrap();
        p.finish().unwrap();
    }
}
