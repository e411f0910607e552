//! Codec state shared by every tree of a process.

use parking_lot::Mutex;
use rayon::ThreadPool;
use tracing::debug;

use crate::types::{FtError, Msn, Result};

/// State shared by every node encode/decode in a process: the worker pool used
/// to compress partitions in parallel and the watermark that hands out
/// message sequence numbers while upgrading old nodes.
pub struct FtContext {
    pool: Option<ThreadPool>,
    upgrade_msn: Mutex<Msn>,
}

impl Default for FtContext {
    fn default() -> Self {
        Self::serial()
    }
}

impl FtContext {
    /// Context without a worker pool.
    pub fn serial() -> Self {
        Self {
            pool: None,
            upgrade_msn: Mutex::new(Msn::UPGRADE_START),
        }
    }

    /// Context with a pool of `threads` workers (one per CPU when zero).
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ft-serialize-{i}"))
            .build()
            .map_err(|err| FtError::Resource(format!("serialize pool: {err}")))?;
        debug!(threads = pool.current_num_threads(), "ft.context.pool");
        Ok(Self {
            pool: Some(pool),
            upgrade_msn: Mutex::new(Msn::UPGRADE_START),
        })
    }

    /// The worker pool, if any.
    pub fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_ref()
    }

    /// Current upgrade watermark.
    pub fn upgrade_watermark(&self) -> Msn {
        *self.upgrade_msn.lock()
    }

    /// Resets the upgrade watermark, e.g. from a file header.
    pub fn set_upgrade_watermark(&self, msn: Msn) {
        *self.upgrade_msn.lock() = msn;
    }

    /// Reserves `count` sequence numbers below the watermark and moves the
    /// watermark down past them. Returns the lowest reserved msn and the
    /// watermark before the call; the reserved range is `low.0 + 1 ..= high.0`.
    pub fn reserve_upgrade_msns(&self, count: u64) -> Result<(Msn, Msn)> {
        let mut guard = self.upgrade_msn.lock();
        let high = *guard;
        let low = high
            .0
            .checked_sub(count)
            .ok_or(FtError::Invalid("upgrade msn watermark exhausted"))?;
        *guard = Msn(low);
        Ok((Msn(low), high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_count_down() {
        let ctx = FtContext::serial();
        let (low, high) = ctx.reserve_upgrade_msns(3).unwrap();
        assert_eq!(high, Msn::UPGRADE_START);
        assert_eq!(low.0, Msn::UPGRADE_START.0 - 3);
        let (low2, high2) = ctx.reserve_upgrade_msns(2).unwrap();
        assert_eq!(high2, low);
        assert_eq!(low2.0, low.0 - 2);
        assert_eq!(ctx.upgrade_watermark(), low2);
    }

    #[test]
    fn pool_builds() {
        let ctx = FtContext::with_threads(2).unwrap();
        assert_eq!(ctx.pool().map(|p| p.current_num_threads()), Some(2));
    }
}
