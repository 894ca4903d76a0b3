use graph_tunnel_core::prelude::CancelHandle;
use tokio::signal;

pub(crate) fn start_cancel_listener(runtime: &tokio::runtime::Runtime) -> CancelHandle {
    let handle = CancelHandle::new();

    let listener_handle = handle.clone();
    runtime.spawn(async move {
        signal::ctrl_c()
            .await
            .expect("Failed to receive Ctrl-C signal");
        listener_handle.cancel();
        println!("Received shutdown signal, stopping the sweep at the next stage boundary...");
    });

    handle
}
