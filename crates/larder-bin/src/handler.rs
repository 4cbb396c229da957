use std::time::Duration;

use console::{style, Term};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use larder_build::{CancellationToken, TaskHandler, TaskProgress};

/// Shows tasks as progress bars and asks questions on the terminal.
pub struct ConsoleTaskHandler {
    cancellation: CancellationToken,
    multi_progress: MultiProgress,
}

impl ConsoleTaskHandler {
    pub fn new(multi_progress: MultiProgress, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            multi_progress,
        }
    }
}

/// Cancels `cancellation` on the first interrupt so running operations can clean up, and exits on
/// the second.
#[cfg(unix)]
pub fn cancel_on_interrupt(cancellation: CancellationToken) -> std::io::Result<()> {
    use signal_hook::{
        consts::{SIGINT, SIGTERM},
        iterator::Signals,
    };

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            if cancellation.is_cancelled() {
                std::process::exit(128 + signal);
            }
            tracing::warn!("interrupted, cleaning up (interrupt again to exit immediately)");
            cancellation.cancel();
        }
    });
    Ok(())
}

struct BarProgress(ProgressBar);

impl TaskProgress for BarProgress {
    fn set_position(&self, position: u64) {
        self.0.set_position(position);
    }

    fn inc(&self, delta: u64) {
        self.0.inc(delta);
    }

    fn finish(&self) {
        self.0.finish_and_clear();
    }
}

impl TaskHandler for ConsoleTaskHandler {
    fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    fn start_task(&self, name: &str, total: Option<u64>) -> Box<dyn TaskProgress> {
        let bar = match total {
            Some(total) => ProgressBar::new(total).with_style(bar_style()),
            None => ProgressBar::new_spinner().with_style(spinner_style()),
        };
        let bar = self.multi_progress.add(bar.with_prefix(name.to_string()));
        bar.enable_steady_tick(Duration::from_millis(100));
        Box::new(BarProgress(bar))
    }

    fn ask(&self, question: &str) -> bool {
        self.multi_progress.suspend(|| {
            let term = Term::stderr();
            if !term.is_term() {
                return false;
            }
            if term
                .write_str(&format!("{} [y/N] ", style(question).bold()))
                .is_err()
            {
                return false;
            }
            term.read_line()
                .map(|answer| matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
                .unwrap_or(false)
        })
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:30!} [{elapsed_precise}] [{bar:.bright.yellow/dim.white}] {pos:>5}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╾─")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {prefix:30!} [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
