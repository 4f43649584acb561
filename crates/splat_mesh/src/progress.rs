//! Progress reporting for long-running passes.

use indicatif::{ProgressBar, ProgressStyle};

/// A labelled progress bar over a known amount of work, or a hidden bar when
/// quiet operation was requested.
pub fn bar(label: &str, total: u64, quiet: bool) -> ProgressBar {
  if quiet {
    return ProgressBar::hidden();
  }
  let bar = ProgressBar::new(total);
  bar.set_style(
    ProgressStyle::with_template("{msg:20} [{bar:40}] {human_pos}/{human_len} ({eta})")
      .expect("static progress template")
      .progress_chars("=> "),
  );
  bar.set_message(label.to_string());
  bar
}
