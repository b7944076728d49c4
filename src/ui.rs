use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::segment::SegmentProgress;

#[derive(Clone, Copy, Debug)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty)
    }

    fn pretty(&self) -> bool {
        self.is_tty && !matches!(self.mode, UiMode::Plain)
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty() {
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

    /// Frame progress display fed with sampler events.
    pub fn frames(&self) -> FrameProgress {
        FrameProgress {
            pretty: self.pretty(),
            bar: None,
            segment: None,
            last_decile: None,
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

/// One bar per segment in TTY mode; a line every 10% otherwise.
pub struct FrameProgress {
    pretty: bool,
    bar: Option<ProgressBar>,
    segment: Option<usize>,
    last_decile: Option<u32>,
}

impl FrameProgress {
    pub fn update(&mut self, progress: &SegmentProgress) {
        if self.segment != Some(progress.segment) {
            self.start_segment(progress);
        }
        let event = &progress.event;
        if let Some(bar) = &self.bar {
            bar.set_position(event.frames_done);
            bar.set_message(format!("total {}", event.running_total));
            return;
        }
        if let Some(fraction) = event.fraction {
            let decile = (fraction * 10.0).floor() as u32;
            if self.last_decile != Some(decile) {
                self.last_decile = Some(decile);
                eprintln!(
                    "    {:>3}% ({} frames, total {})",
                    decile * 10,
                    event.frames_done,
                    event.running_total
                );
            }
        }
    }

    fn start_segment(&mut self, progress: &SegmentProgress) {
        self.finish_bar();
        self.segment = Some(progress.segment);
        self.last_decile = None;
        if progress.segments > 1 {
            eprintln!("    segment {}/{}", progress.segment + 1, progress.segments);
        }
        if !self.pretty {
            return;
        }
        let bar = match progress.event.expected_total {
            Some(total) if total > 0 => {
                let bar = ProgressBar::new(total);
                let style = ProgressStyle::with_template(
                    "{bar:40.cyan/blue} {pos}/{len} frames {msg} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar());
                bar.set_style(style);
                bar
            }
            _ => {
                let bar = ProgressBar::new_spinner();
                let style = ProgressStyle::with_template("{spinner} {pos} frames {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                bar.set_style(style);
                bar
            }
        };
        bar.set_draw_target(ProgressDrawTarget::stderr());
        self.bar = Some(bar);
    }

    fn finish_bar(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

impl Drop for FrameProgress {
    fn drop(&mut self) {
        self.finish_bar();
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
