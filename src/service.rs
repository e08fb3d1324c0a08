//! Recorder service loop
//!
//! Runs the device monitor as its own task and feeds the matched events, one
//! at a time and in arrival order, to the recording controller.

use crate::device::{DeviceMonitor, HotplugSource};
use crate::port::PortLister;
use crate::recorder::RecordingController;
use crate::utils::AppResult;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Run until `shutdown` fires or the monitor stops.
///
/// Any recording still in progress is finished before returning. A monitor
/// failure is returned after that cleanup.
pub async fn run<S, L>(
    monitor: DeviceMonitor<S>,
    controller: &mut RecordingController<L>,
    shutdown: CancellationToken,
) -> AppResult<()>
where
    S: HotplugSource + 'static,
    L: PortLister,
{
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let monitor_shutdown = shutdown.clone();
    let monitor_task = tokio::spawn(async move {
        monitor
            .start(
                move |event| {
                    let _ = event_tx.send(event);
                },
                monitor_shutdown,
            )
            .await
    });

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                // Monitor ended; its result says why
                None => break,
            },
        };
        controller.handle_event(&event).await;
    }

    shutdown.cancel();

    if let Err(e) = controller.shutdown().await {
        tracing::error!("Failed to finish recording on shutdown: {}", e);
    }

    let monitor_result = monitor_task.await?;
    if let Err(e) = &monitor_result {
        tracing::error!("Device monitor stopped: {}", e);
    }
    monitor_result?;

    tracing::info!("Shutdown complete");
    Ok(())
}
