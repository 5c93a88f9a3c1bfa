//! Shared card-detect poller and power-management ticks.
//!
//! Controllers whose hardware signals card detect by interrupt never show
//! up here: their worker routes the detect event straight into
//! [`SdmmcController::card_event`]. The poller covers the rest, sampling
//! the detect line on a timer. Edge filtering lives in `card_event`, so
//! sampling a stable slot many times per state produces no duplicate
//! notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{trace, warn};

use super::registry::SdmmcRegistry;

pub struct CardDetectPoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CardDetectPoller {
    /// Start the process-wide detect worker. One of these serves every
    /// polled controller in the registry.
    pub fn spawn(registry: Arc<SdmmcRegistry>, interval: Duration) -> CardDetectPoller {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("sdmmc-detect".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    for controller in registry.controllers() {
                        if controller.needs_poll() {
                            match controller.poll_card_detect() {
                                Ok(present) => controller.card_event(present),
                                Err(e) => {
                                    trace!(target: "sdmmc", "card detect poll failed: {:?}", e)
                                }
                            }
                        }
                        controller.pm_tick();
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(|e| warn!(target: "sdmmc", "detect worker not started: {}", e))
            .ok();

        CardDetectPoller {
            stop,
            handle,
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CardDetectPoller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
