use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// How transfer progress is rendered. Picked once at startup: interactive
/// when stdout is a terminal, silent otherwise (piped/captured output gets
/// no percentage spam).
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProgressMode {
    Interactive,
    Silent,
}

impl ProgressMode {
    pub fn for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            ProgressMode::Interactive
        } else {
            ProgressMode::Silent
        }
    }

    /// Start a percentage display labelled `label`, fed through
    /// [ProgressSink::report].
    pub fn start(self, label: &str) -> ProgressSink {
        let bar = match self {
            ProgressMode::Interactive => {
                let bar = ProgressBar::with_draw_target(Some(100), ProgressDrawTarget::stdout());
                bar.set_style(
                    ProgressStyle::with_template("{msg}: {pos}[%]").expect("static template"),
                );
                bar.set_message(label.to_owned());
                bar
            }
            ProgressMode::Silent => ProgressBar::hidden(),
        };
        ProgressSink { bar }
    }
}

/// Sink for the device layer's progress callbacks: a fraction in `[0, 1]`
/// per call, rendered as a percentage or swallowed.
pub struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    pub fn report(&self, fraction: f32) {
        self.bar
            .set_position((fraction.clamp(0.0, 1.0) * 100.0) as u64);
    }

    /// Leave the final percentage on screen.
    pub fn finish(&self) {
        self.bar.finish();
    }

    /// Erase the display, for renderings that were only ever an estimate.
    fn clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Cosmetic percentage ticker for the MIPI write, which has no real progress
/// signal. Steps 1% per second against an assumed two-minute write on its
/// own thread; the estimate is unrelated to actual transfer progress and is
/// erased once the write returns.
pub struct ProgressTicker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn start(mode: ProgressMode, label: &str) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let sink = mode.start(label);

        // The flag is only ever flipped false -> true and polled, so relaxed
        // ordering is enough.
        let watched = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            for percent in 0..=100u32 {
                if watched.load(Ordering::Relaxed) {
                    break;
                }
                sink.report(percent as f32 / 100.0);
                std::thread::sleep(Duration::from_secs(1));
            }
            sink.clear();
        });

        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Stop the ticker and wait for its thread to exit. Called before the
    /// write result is inspected so the estimate never outlives the write.
    pub fn finish(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn silent_sink_swallows_reports() {
        let sink = ProgressMode::Silent.start("Firmware update progress");
        sink.report(0.0);
        sink.report(0.5);
        sink.report(1.0);
        sink.finish();
    }

    #[test]
    fn report_clamps_out_of_range_fractions() {
        let sink = ProgressMode::Silent.start("Firmware update progress");
        sink.report(-1.0);
        sink.report(7.5);
        sink.finish();
    }

    #[test]
    fn ticker_stops_promptly_when_finished() {
        let ticker = ProgressTicker::start(ProgressMode::Silent, "progress");
        let start = Instant::now();
        ticker.finish();
        // Joining must not wait out the full two-minute estimate.
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
