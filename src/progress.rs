//! Progress aggregation across workers.
//!
//! Workers emit one delta per finished task. An aggregator thread folds the
//! deltas into a monotonic completed count plus a backlog count
//! (submitted − completed) and publishes the pair to a display sink at a
//! bounded rate, never per delta. Delivery is best effort: a full channel
//! drops deltas, and a floor counter bumped on every chunk completion keeps
//! the published count exact anyway.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Minimum interval between two publishes to the sink.
pub(crate) const REFRESH_INTERVAL: Duration = Duration::from_millis(80);

/// Capacity of the delta channel; overflow is dropped.
pub(crate) const PROGRESS_QUEUE: usize = 1024;

/// Display endpoint consuming numeric progress updates.
pub trait ProgressSink: Send + 'static {
    /// Total number of tasks, once known.
    fn set_total(&self, total: u64);
    /// Publish the current completed and backlog counts.
    fn publish(&self, completed: u64, backlog: u64);
    /// The operation finished; render the final state.
    fn finish(&self);
}

/// Terminal progress display: a main bar plus an optional backlog meter.
pub struct MeterSink {
    bar: ProgressBar,
    backlog: Option<ProgressBar>,
    // Keeps the bars tied to one draw target.
    _multi: MultiProgress,
}

impl MeterSink {
    /// Build a sink with the main bar labelled `desc`.
    ///
    /// Disabled indicators are created hidden so the sink always accepts
    /// updates.
    pub fn new(
        desc: Option<&str>,
        total: Option<u64>,
        show_bar: bool,
        show_backlog: bool,
    ) -> Self {
        let multi = MultiProgress::new();

        let bar = if show_bar {
            ProgressBar::new(total.unwrap_or(0))
        } else {
            ProgressBar::hidden()
        };
        let bar = multi.add(bar);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("progress template is valid")
                .progress_chars("█▓▒░  "),
        );
        if let Some(desc) = desc {
            bar.set_message(desc.to_string());
        }

        let backlog = if show_backlog {
            let meter = multi.add(ProgressBar::new(total.unwrap_or(0)));
            meter.set_style(
                ProgressStyle::default_bar()
                    .template("  {prefix}: {pos}/{len}")
                    .expect("backlog template is valid"),
            );
            meter.set_prefix("buffer");
            Some(meter)
        } else {
            None
        };

        Self {
            bar,
            backlog,
            _multi: multi,
        }
    }
}

impl ProgressSink for MeterSink {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        if let Some(meter) = &self.backlog {
            meter.set_length(total);
        }
    }

    fn publish(&self, completed: u64, backlog: u64) {
        self.bar.set_position(completed);
        if let Some(meter) = &self.backlog {
            meter.set_position(backlog);
        }
    }

    fn finish(&self) {
        self.bar.finish();
        // The buffer meter is transient, like a queue gauge.
        if let Some(meter) = &self.backlog {
            meter.finish_and_clear();
        }
    }
}

/// Spawn the aggregator thread.
///
/// Ends when every delta sender is gone; publishes a final exact update
/// before finishing the sink.
pub(crate) fn spawn_aggregator(
    deltas: Receiver<u32>,
    sink: Box<dyn ProgressSink>,
    submitted: Arc<AtomicU64>,
    completed_floor: Arc<AtomicU64>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("parfor-progress".to_string())
        .spawn(move || {
            let mut delta_sum = 0u64;
            let mut last_publish = Instant::now() - REFRESH_INTERVAL;

            loop {
                match deltas.recv_timeout(REFRESH_INTERVAL) {
                    Ok(n) => delta_sum += u64::from(n),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                // Fold in whatever else is queued before considering a redraw.
                while let Ok(n) = deltas.try_recv() {
                    delta_sum += u64::from(n);
                }

                if last_publish.elapsed() >= REFRESH_INTERVAL {
                    let completed = delta_sum.max(completed_floor.load(Ordering::Relaxed));
                    let submitted = submitted.load(Ordering::Relaxed);
                    sink.publish(completed, submitted.saturating_sub(completed));
                    last_publish = Instant::now();
                }
            }

            let completed = delta_sum.max(completed_floor.load(Ordering::Relaxed));
            let submitted = submitted.load(Ordering::Relaxed);
            sink.publish(completed, submitted.saturating_sub(completed));
            sink.finish();
        })
        .expect("failed to spawn progress thread")
}
