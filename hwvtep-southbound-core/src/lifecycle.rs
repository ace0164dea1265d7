//! Start policy shared by everything that brings a device connection up in
//! two phases (start, then wait until usable).

use std::future::Future;
use tokio_util::task::TaskTracker;

/// How a caller of `on_connected` waits for the new connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPolicy {
    /// Run the lifecycle in a tracked background task and return at once.
    AsyncFireAndForget,
    /// Run the lifecycle inline, then wait until the connection is `Steady`
    /// (or the timeout elapses, or it closes).
    SyncWaitSteady { timeout_ms: u64 },
}

impl Default for StartPolicy {
    fn default() -> Self {
        StartPolicy::AsyncFireAndForget
    }
}

/// Apply a start policy to a pair of async operations provided by the caller.
///
/// `start_fn` must be `'static` because the fire-and-forget branch spawns it
/// on `tracker`; `wait_fn` may borrow since it only runs inline.
pub async fn start_with_policy<E, SFut, WFut, SFn, WFn>(
    policy: StartPolicy,
    tracker: &TaskTracker,
    start_fn: SFn,
    wait_fn: WFn,
) -> Result<(), E>
where
    E: Send + 'static,
    SFn: FnOnce() -> SFut + Send + 'static,
    SFut: Future<Output = Result<(), E>> + Send + 'static,
    WFn: FnOnce(u64) -> WFut,
    WFut: Future<Output = Result<(), E>>,
{
    match policy {
        StartPolicy::AsyncFireAndForget => {
            tracker.spawn(async move {
                let _ = start_fn().await;
            });
            Ok(())
        }
        StartPolicy::SyncWaitSteady { timeout_ms } => {
            start_fn().await?;
            wait_fn(timeout_ms).await
        }
    }
}
