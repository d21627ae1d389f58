// LibertAI gateway — primary-worker election & control loops
//
// Every process races for a non-blocking exclusive lock on a fixed file
// at startup. The winner is the primary: it owns the refresh and alert
// loops for its lifetime. The other workers serve requests against their
// initial config-derived state and run nothing in the background.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use fs2::FileExt;
use tokio::task::JoinHandle;

use crate::state::AppState;
use crate::{alerts, api_keys, pricing};

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const ALERT_INTERVAL: Duration = Duration::from_secs(600);

/// Holds the advisory lock for the process lifetime. Dropping the guard
/// (process exit) releases it.
pub struct PrimaryLock {
    _file: File,
}

/// Try to become the primary worker. `None` means another process
/// already holds the lock.
pub fn try_acquire_primary(lock_path: &Path) -> Option<PrimaryLock> {
    let file = match File::create(lock_path) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!("worker: cannot open lock file {}: {e}", lock_path.display());
            return None;
        }
    };

    match file.try_lock_exclusive() {
        Ok(()) => {
            tracing::info!("worker: acquired primary lock, this worker runs background tasks");
            Some(PrimaryLock { _file: file })
        }
        Err(_) => {
            tracing::info!("worker: another worker is already running background tasks");
            None
        }
    }
}

/// Start the primary's long-running loops. Each iteration is fallible on
/// its own; failures log and retain the previous view, the loops never
/// exit.
pub fn spawn_background_tasks(state: AppState) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_refresh_loop(state.clone())),
        tokio::spawn(run_alert_loop(state)),
    ]
}

/// Key set → health sweep → price catalogue, sequentially, then sleep.
async fn run_refresh_loop(state: AppState) {
    tracing::info!("worker: refresh loop started (interval={}s)", REFRESH_INTERVAL.as_secs());
    loop {
        api_keys::refresh_keys(&state).await;
        state.health.check_all_servers(&state.control_client).await;
        pricing::refresh_prices(&state).await;
        tokio::time::sleep(REFRESH_INTERVAL).await;
    }
}

async fn run_alert_loop(state: AppState) {
    tracing::info!("worker: alert loop started (interval={}s)", ALERT_INTERVAL.as_secs());
    loop {
        alerts::send_health_alert(&state).await;
        tokio::time::sleep(ALERT_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("primary.lock");

        let first = try_acquire_primary(&lock_path);
        assert!(first.is_some(), "first process wins the lock");

        let second = try_acquire_primary(&lock_path);
        assert!(second.is_none(), "second process must lose the race");

        drop(first);
        let third = try_acquire_primary(&lock_path);
        assert!(third.is_some(), "lock is released when the holder exits");
    }
}
