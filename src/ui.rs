//! Terminal UI: progress bars, plus a stderr writer that plays nicely with
//! them.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Application UI state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI which never draws anything.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::with_draw_target(
                ProgressDrawTarget::hidden(),
            )),
        }
    }

    /// Hide all progress bars, for when real output is going to stdout.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A writer for `tracing` which won't scribble over our progress bars.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Print a one-line message to stderr, above any progress bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        self.multi_progress.suspend(|| eprintln!("{emoji} {msg}"));
    }

    /// A progress bar for `len` items.
    pub fn new_progress_bar(&self, config: &ProgressConfig<'_>, len: u64) -> ProgressBar {
        let pb = self
            .multi_progress
            .add(ProgressBar::new(len).with_style(progress_style()));
        Self::configure(pb, config)
    }

    /// A spinner, for when we don't know how many items there are.
    pub fn new_spinner(&self, config: &ProgressConfig<'_>) -> ProgressBar {
        let sp = self
            .multi_progress
            .add(ProgressBar::new_spinner().with_style(spinner_style()));
        Self::configure(sp, config)
    }

    /// A progress bar if we know how many items to expect, or a spinner if
    /// we don't.
    pub fn new_from_count(&self, config: &ProgressConfig<'_>, count: Option<usize>) -> ProgressBar {
        match count.and_then(|c| u64::try_from(c).ok()) {
            Some(len) if len > 0 => self.new_progress_bar(config, len),
            _ => self.new_spinner(config),
        }
    }

    fn configure(pb: ProgressBar, config: &ProgressConfig<'_>) -> ProgressBar {
        #[cfg(test)]
        pb.set_draw_target(ProgressDrawTarget::hidden());
        pb.set_prefix(config.emoji.to_owned());
        pb.set_message(config.msg.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }
}

/// Labels for a progress bar.
pub struct ProgressConfig<'a> {
    pub emoji: &'a str,
    /// Shown while running.
    pub msg: &'a str,
    /// Shown when finished.
    pub done_msg: &'a str,
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg} {pos}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Writes to stderr, suspending progress bars while it does so.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
