use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn from_flag(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "plain" => UiMode::Plain,
            "pretty" => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

/// Startup and shutdown reporting on stderr. Log output stays with env_logger.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    stderr_tty: bool,
}

impl Ui {
    pub fn detect(flag: &str) -> Self {
        Self {
            mode: UiMode::from_flag(flag),
            stderr_tty: std::io::stderr().is_terminal(),
        }
    }

    fn pretty(&self) -> bool {
        match self.mode {
            UiMode::Plain => false,
            UiMode::Pretty => self.stderr_tty,
            // A piped stdout usually means a supervisor is collecting output.
            UiMode::Auto => self.stderr_tty && std::io::stdout().is_terminal(),
        }
    }

    pub fn stage(&self, name: &str) -> Stage {
        if self.pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            Stage::new(name, Some(spinner))
        } else {
            eprintln!("==> {}", name);
            Stage::new(name, None)
        }
    }

    /// Prints a labelled block of `key: value` lines, e.g. per-worker totals.
    pub fn report(&self, title: &str, rows: &[(&str, String)]) {
        if self.pretty() {
            eprintln!("▸ {}", title);
        } else {
            eprintln!("==> {}", title);
        }
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            eprintln!("    {:<width$}  {}", key, value, width = width);
        }
    }
}

pub struct Stage {
    name: String,
    started: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl Stage {
    fn new(name: &str, spinner: Option<ProgressBar>) -> Self {
        Self {
            name: name.to_string(),
            started: Instant::now(),
            spinner,
            failed: false,
        }
    }

    /// Marks the stage as failed so the closing line does not report success.
    pub fn fail(mut self, reason: &str) {
        self.failed = true;
        let message = format!("✘ {} ({})", self.name, reason);
        match self.spinner.take() {
            Some(spinner) => spinner.abandon_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        if self.failed {
            return;
        }
        let message = format!("✔ {} ({})", self.name, format_elapsed(self.started.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}
