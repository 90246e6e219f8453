//! Logging and progress output for a conversion.
//!
//! [`Notifier`] puts `env_logger` (text logs) and `indicatif` (spinner and
//! layer bar) behind one verbosity switch:
//! - [`VerbosityLevel::Quiet`]: no text logs, a live spinner carries the current
//!   step and [`Notifier::create_progress_bar`] hands out bars.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`]:
//!   plain log lines, no bars.
//!
//! Library code logs through the `log` macros; [`init_logging`] installs the
//! global logger those go to.

use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner and bars, warnings only
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Installs the global `env_logger` for `verbosity`, honoring `RUST_LOG`.
/// Later calls are ignored.
pub fn init_logging(verbosity: u8) {
    let _ = env_logger::Builder::from_env(Env::default())
        .filter_level(VerbosityLevel::from(verbosity).to_log_level())
        .try_init();
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    logger: env_logger::Logger,
    multi_progress: Option<MultiProgress>,
    spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        let logger = env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .build();

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(MultiProgress::new())
        } else {
            None
        };

        Self {
            verbosity,
            logger,
            multi_progress,
            spinner: RefCell::new(None),
        }
    }

    fn emit(&self, level: Level, message: &str) {
        let metadata = Metadata::builder()
            .level(level)
            .target(module_path!())
            .build();
        if !self.logger.enabled(&metadata) {
            return;
        }
        self.logger.log(
            &Record::builder()
                .args(format_args!("{}", message))
                .metadata(metadata)
                .build(),
        );
    }

    /// Reports the current step; updates the spinner in quiet mode.
    pub fn info(&self, message: &str) {
        let multi_progress = match &self.multi_progress {
            Some(mp) => mp,
            None => return self.emit(Level::Info, message),
        };

        let mut spinner = self.spinner.borrow_mut();
        let spinner = spinner.get_or_insert_with(|| {
            let bar = multi_progress.add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        spinner.set_message(message.to_string());
    }

    pub fn debug(&self, message: &str) {
        self.emit(Level::Debug, message);
    }

    pub fn trace(&self, message: &str) {
        self.emit(Level::Trace, message);
    }

    /// Warnings are printed at every verbosity, above the bars in quiet mode.
    pub fn warn(&self, message: &str) {
        match &self.multi_progress {
            Some(mp) => {
                let _ = mp.println(format!("warning: {}", message));
            }
            None => self.emit(Level::Warn, message),
        }
    }

    /// Bar over `length` steps; only in quiet mode.
    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        let multi_progress = self.multi_progress.as_ref()?;
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len:4} {msg}")
            .ok()?
            .progress_chars("=> ");

        let bar = multi_progress.add(ProgressBar::new(length));
        bar.set_style(style);
        bar.set_message(message.to_string());
        Some(bar)
    }

    /// Textual progress for the non-quiet modes.
    pub fn progress(&self, current: u64, total: u64, message: &str) {
        if self.multi_progress.is_none() {
            self.emit(Level::Info, &format!("{}: {}/{}", message, current, total));
        }
    }

    /// Stops the spinner, leaving `message` as its last line.
    pub fn finish(&self, message: &str) {
        match self.spinner.borrow_mut().take() {
            Some(spinner) => spinner.finish_with_message(message.to_string()),
            None => self.emit(Level::Info, message),
        }
    }

    pub fn use_beautiful_progress(&self) -> bool {
        self.verbosity == VerbosityLevel::Quiet
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }
}
