//! Background task bookkeeping shared by every component.

use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The cancellation token and join handles of a started component.
#[derive(Default)]
pub struct Tasks {
    running: Mutex<Option<Running>>,
}

impl Tasks {
    pub fn is_running(&self) -> bool {
        match self.running.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    pub fn install(&self, cancel: CancellationToken, handles: Vec<JoinHandle<()>>) {
        let mut guard = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Running { cancel, handles });
    }

    /// Cancel and wait for every task. Stopping an idle component is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(running) = running else {
            return Ok(());
        };

        running.cancel.cancel();
        let mut result = Ok(());
        for handle in running.handles {
            if let Err(e) = handle.await {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        result
    }
}

/// Run `tick` every `period` (first run one period after start) until
/// `cancel` fires.
pub fn spawn_periodic<F>(cancel: CancellationToken, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => tick(),
            }
        }
    })
}
