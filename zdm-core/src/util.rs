// vim: tw=80
//! Common utility functions used throughout ZDM

use std::{
    future::Future,
    ops::{Add, Div, Sub},
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle};

/// LBAs always use 4K LBAs, even if the underlying device supports smaller.
pub const BYTES_PER_LBA: usize = 4096;

/// Zone reports always use 512-byte sectors, even if the underlying device's
/// logical blocks are larger.
pub const BYTES_PER_SECTOR: usize = 512;

/// Number of sectors in one LBA
pub const SECTORS_PER_LBA: u64 = (BYTES_PER_LBA / BYTES_PER_SECTOR) as u64;

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T> {
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Run `f` every `period` on `handle`, until the returned task is aborted.
///
/// The first invocation happens one full period after spawning.
pub fn schedule_periodic<F, Fut>(handle: &Handle, period: Duration, mut f: F)
    -> JoinHandle<()>
    where F: FnMut() -> Fut + Send + 'static,
          Fut: Future<Output=()> + Send + 'static
{
    handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            f().await;
        }
    })
}

// LCOV_EXCL_START
#[cfg(test)]
/// Helper to generate the runtime used by most unit tests
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
