use std::time::Duration;

use dbfetch_protocol::TransferFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{TransferError, emit};

pub const DEFAULT_STAGE_STEPS: u32 = 10;
pub const DEFAULT_STAGE_DELAY: Duration = Duration::from_secs(1);

/// Coarse "preparing" checkpoints emitted before any data is streamed.
///
/// With `steps = 10` the checkpoints are 0, 10, ..., 100, separated by
/// `delay`. Zero steps disables the phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagedProgress {
    pub steps: u32,
    pub delay: Duration,
}

impl Default for StagedProgress {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STAGE_STEPS,
            delay: DEFAULT_STAGE_DELAY,
        }
    }
}

impl StagedProgress {
    pub fn disabled() -> Self {
        Self {
            steps: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.steps > 0
    }

    /// Emits every checkpoint, waiting `delay` between consecutive ones.
    pub async fn run(
        &self,
        sink: &mpsc::Sender<TransferFrame>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if !self.is_enabled() {
            return Ok(());
        }

        for step in 0..=self.steps {
            let percent = percent_at(step, self.steps);
            debug!(percent, "staged progress");
            emit(
                sink,
                cancel,
                TransferFrame::status(format!("Preparing backup: {percent}%"), percent),
            )
            .await?;

            if step < self.steps {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
        }
        Ok(())
    }
}

fn percent_at(step: u32, steps: u32) -> i32 {
    (u64::from(step) * 100 / u64::from(steps)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_does_not_overflow_for_huge_step_counts() {
        assert_eq!(percent_at(0, u32::MAX), 0);
        assert_eq!(percent_at(u32::MAX / 2, u32::MAX), 49);
        assert_eq!(percent_at(u32::MAX, u32::MAX), 100);
        assert_eq!(percent_at(3, 10), 30);
    }

    fn progress_values(rx: &mut mpsc::Receiver<TransferFrame>) -> Vec<i32> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame.as_status().unwrap().progress);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn emits_eleven_checkpoints() {
        let (tx, mut rx) = mpsc::channel(32);
        let started = tokio::time::Instant::now();

        StagedProgress::default()
            .run(&tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            progress_values(&mut rx),
            vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100]
        );
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn disabled_emits_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        StagedProgress::disabled()
            .run(&tx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(progress_values(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_between_checkpoints() {
        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            c.cancel();
        });

        let result = StagedProgress::default().run(&tx, &cancel).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(progress_values(&mut rx), vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn four_steps() {
        let (tx, mut rx) = mpsc::channel(32);
        let staged = StagedProgress {
            steps: 4,
            delay: Duration::ZERO,
        };
        staged.run(&tx, &CancellationToken::new()).await.unwrap();
        assert_eq!(progress_values(&mut rx), vec![0, 25, 50, 75, 100]);
    }
}
