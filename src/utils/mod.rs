use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Pools built so far, one per requested thread count.
static POOLS: Mutex<Vec<(usize, Arc<ThreadPool>)>> = parking_lot::const_mutex(Vec::new());

fn thread_pool(threads: usize) -> anyhow::Result<Arc<ThreadPool>> {
    let mut pools = POOLS.lock();
    if let Some((_, pool)) = pools.iter().find(|(n, _)| *n == threads) {
        return Ok(Arc::clone(pool));
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("components-{}", i))
        .build()
        .map_err(|e| anyhow!("Failed to build a thread pool with {} threads: {}", threads, e))?;
    debug!("Built a thread pool with {} threads", threads);

    let pool = Arc::new(pool);
    pools.push((threads, Arc::clone(&pool)));
    Ok(pool)
}

/// Runs `op` on a pool of `threads` workers, or on the global rayon pool for `None`.
pub(crate) fn install<T: Send>(
    threads: Option<usize>,
    op: impl FnOnce() -> T + Send,
) -> anyhow::Result<T> {
    match threads {
        None => Ok(op()),
        Some(threads) => Ok(thread_pool(threads)?.install(op)),
    }
}
