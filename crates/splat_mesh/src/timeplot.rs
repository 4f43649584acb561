//! Event timing for offline pipeline analysis.
//!
//! When recording is enabled every [`Worker`] logs its timed actions into a
//! single FIFO queue guarded by one mutex; the queue is flushed to a plain
//! text file (`worker action start duration` per line) when recording stops.
//! With recording disabled the guards compile down to a pair of `Instant`
//! reads and a branch.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::error::Result;

struct Event {
  worker: String,
  action: &'static str,
  start_secs: f64,
  duration_secs: f64,
}

struct Recorder {
  origin: Instant,
  events: Vec<Event>,
}

static RECORDER: OnceLock<Mutex<Option<Recorder>>> = OnceLock::new();

fn recorder() -> &'static Mutex<Option<Recorder>> {
  RECORDER.get_or_init(|| Mutex::new(None))
}

/// Start recording events. Called once by the driver before any pipeline
/// worker starts.
pub fn start_recording() {
  let mut slot = recorder().lock().unwrap();
  *slot = Some(Recorder {
    origin: Instant::now(),
    events: Vec::new(),
  });
}

/// Stop recording and write all events, in completion order, to `path`.
pub fn write(path: &Path) -> Result<()> {
  let recorder = recorder().lock().unwrap().take();
  let Some(recorder) = recorder else {
    return Ok(());
  };
  let mut out = BufWriter::new(File::create(path)?);
  for event in &recorder.events {
    writeln!(
      out,
      "{} {} {:.6} {:.6}",
      event.worker, event.action, event.start_secs, event.duration_secs
    )?;
  }
  out.flush()?;
  Ok(())
}

/// A named worker producing timed actions.
#[derive(Clone, Debug)]
pub struct Worker {
  name: String,
}

impl Worker {
  pub fn new(name: impl Into<String>) -> Self {
    Worker { name: name.into() }
  }

  /// Time one action; the event is queued when the guard drops.
  pub fn action(&self, action: &'static str) -> ActionGuard<'_> {
    ActionGuard {
      worker: self,
      action,
      start: Instant::now(),
    }
  }
}

/// Guard measuring one action's wall time.
pub struct ActionGuard<'a> {
  worker: &'a Worker,
  action: &'static str,
  start: Instant,
}

impl<'a> Drop for ActionGuard<'a> {
  fn drop(&mut self) {
    let end = Instant::now();
    let mut slot = recorder().lock().unwrap();
    if let Some(recorder) = slot.as_mut() {
      recorder.events.push(Event {
        worker: self.worker.name.clone(),
        action: self.action,
        start_secs: self.start.duration_since(recorder.origin).as_secs_f64(),
        duration_secs: end.duration_since(self.start).as_secs_f64(),
      });
    }
  }
}
