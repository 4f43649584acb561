//! Process-wide statistics registry.
//!
//! Counters accumulate totals (splats loaded, blobs built, components
//! pruned); variables accumulate samples with mean and standard deviation.
//! Everything lives behind a single mutex and is cheap enough to update from
//! any worker. The registry is created by the process on first use and
//! reported once every worker has joined.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, OnceLock};

#[derive(Clone, Debug, Default)]
struct Variable {
  sum: f64,
  sum2: f64,
  n: u64,
}

impl Variable {
  fn add(&mut self, value: f64) {
    self.sum += value;
    self.sum2 += value * value;
    self.n += 1;
  }

  fn mean(&self) -> f64 {
    assert!(self.n >= 1, "cannot compute mean without at least 1 sample");
    self.sum / self.n as f64
  }

  fn stddev(&self) -> f64 {
    assert!(self.n >= 2, "cannot compute stddev without at least 2 samples");
    let n = self.n as f64;
    // Rounding can push the variance fractionally below zero.
    (((self.sum2 - self.sum * self.sum / n) / (n - 1.0)).max(0.0)).sqrt()
  }
}

#[derive(Default)]
struct Inner {
  counters: BTreeMap<String, u64>,
  variables: BTreeMap<String, Variable>,
}

/// Registry of named statistics.
#[derive(Default)]
pub struct Registry {
  inner: Mutex<Inner>,
}

impl Registry {
  pub fn new() -> Self {
    Registry::default()
  }

  /// Add `value` to the named counter.
  pub fn add_counter(&self, name: &str, value: u64) {
    let mut inner = self.inner.lock().unwrap();
    *inner.counters.entry(name.to_string()).or_insert(0) += value;
  }

  /// Add one sample to the named variable.
  pub fn add_sample(&self, name: &str, value: f64) {
    let mut inner = self.inner.lock().unwrap();
    inner.variables.entry(name.to_string()).or_default().add(value);
  }

  pub fn counter(&self, name: &str) -> u64 {
    let inner = self.inner.lock().unwrap();
    inner.counters.get(name).copied().unwrap_or(0)
  }

  pub fn sample_mean(&self, name: &str) -> Option<f64> {
    let inner = self.inner.lock().unwrap();
    inner.variables.get(name).filter(|v| v.n >= 1).map(Variable::mean)
  }

  /// Human-readable dump of every statistic, sorted by name.
  pub fn report(&self) -> String {
    let inner = self.inner.lock().unwrap();
    let mut out = String::new();
    for (name, total) in &inner.counters {
      let _ = writeln!(out, "{name}: {total}");
    }
    for (name, variable) in &inner.variables {
      match variable.n {
        0 => {}
        1 => {
          let _ = writeln!(out, "{name}: {} : {} [1]", variable.sum, variable.mean());
        }
        _ => {
          let _ = writeln!(
            out,
            "{name}: {} : {} +/- {} [{}]",
            variable.sum,
            variable.mean(),
            variable.stddev(),
            variable.n
          );
        }
      }
    }
    out
  }

  /// Drop all recorded values. Tests use this to isolate themselves.
  pub fn reset(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.counters.clear();
    inner.variables.clear();
  }
}

/// The process-wide registry.
pub fn global() -> &'static Registry {
  static REGISTRY: OnceLock<Registry> = OnceLock::new();
  REGISTRY.get_or_init(Registry::new)
}
