// flush_timer.rs: optional periodic due-check for a quiescent buffer.
//
// Flushing is ingestion-triggered; without new fixes a partially filled
// buffer would wait indefinitely. When `flush_tick_ms` is configured this
// task re-evaluates the same flush condition on a fixed period.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::uploader::{BufferedUploader, FlushOutcome};

pub struct FlushTimer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    pub fn spawn(uploader: Arc<BufferedUploader>, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }

                match uploader.flush_if_due().await {
                    Ok(None) | Ok(Some(FlushOutcome::InFlight)) => {}
                    Ok(Some(outcome)) => log::debug!("Periodic flush: {:?}", outcome),
                    Err(e) => log::warn!("Periodic flush failed: {}", e),
                }
            }
        });

        FlushTimer {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            log::warn!("Flush timer ended abnormally: {}", e);
        }
    }
}
