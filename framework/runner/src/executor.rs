use std::future::Future;

use graph_tunnel_core::prelude::{CancelHandle, CancelledError};
use tokio::runtime::Handle;

/// Owns the async runtime the sweep drives external processes and the store driver on.
#[derive(Debug)]
pub struct Executor {
    runtime: tokio::runtime::Runtime,
    cancel_handle: CancelHandle,
}

impl Executor {
    pub fn new(runtime: tokio::runtime::Runtime, cancel_handle: CancelHandle) -> Self {
        Self {
            runtime,
            cancel_handle,
        }
    }

    /// Run async code in place, blocking until it completes.
    ///
    /// The future is dropped if the sweep is cancelled first. Child processes spawned with
    /// `kill_on_drop` are killed along with it.
    pub fn execute_in_place<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let mut cancel_listener = self.cancel_handle.new_listener();
        self.runtime.block_on(async move {
            tokio::select! {
                result = fut => result,
                _ = cancel_listener.cancelled() => {
                    Err(anyhow::anyhow!(CancelledError::default()))
                },
            }
        })
    }

    /// Handle for clients that drive their own futures on this runtime.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel_handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn executor() -> Executor {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        Executor::new(runtime, CancelHandle::new())
    }

    #[test]
    fn completes_futures_in_place() {
        let executor = executor();

        let value = executor.execute_in_place(async { Ok(21 * 2) }).unwrap();

        assert_eq!(value, 42);
    }

    #[test]
    fn cancelled_sweep_interrupts_the_future() {
        let executor = executor();
        executor.cancel_handle().cancel();

        let err = executor
            .execute_in_place(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap_err();

        assert!(err.downcast_ref::<CancelledError>().is_some());
    }
}
