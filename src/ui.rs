//! Startup stage reporting for the agent binaries.
//!
//! Each startup step (load config, open sensor, spawn producer, connect hub)
//! runs inside a `StageGuard`. On a terminal the stage shows a spinner;
//! otherwise it prints plain `==>` lines so journald output stays readable.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    #[default]
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    /// Pick up terminal state from stderr/stdout.
    pub fn detect(mode: UiMode) -> Self {
        let is_tty = std::io::stderr().is_terminal();
        let stdout_is_tty = std::io::stdout().is_terminal();
        Self::new(mode, is_tty, !stdout_is_tty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Run `op` as a named stage; a failed step is marked as such.
    pub fn run_stage<T>(&self, name: &str, op: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut guard = self.stage(name);
        let result = op();
        if result.is_err() {
            guard.fail();
        }
        result
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failed: false,
        }
    }

    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.failed { "✖" } else { "✔" };
        let message = format!("{} {} ({})", mark, self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) if self.failed => spinner.abandon_with_message(message),
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_needs_a_terminal() {
        assert!(!Ui::new(UiMode::Pretty, false, false).use_pretty());
        assert!(Ui::new(UiMode::Pretty, true, true).use_pretty());
        assert!(!Ui::new(UiMode::Auto, true, true).use_pretty());
        assert!(!Ui::new(UiMode::Plain, true, false).use_pretty());
    }

    #[test]
    fn run_stage_passes_result_through() {
        let ui = Ui::new(UiMode::Plain, false, true);
        assert_eq!(ui.run_stage("ok", || Ok(3)).unwrap(), 3);
        assert!(ui
            .run_stage("fails", || -> anyhow::Result<()> { anyhow::bail!("nope") })
            .is_err());
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
