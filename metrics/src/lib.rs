/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use once_cell::sync::Lazy;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

#[doc(hidden)]
pub use once_cell::sync::OnceCell;

#[derive(Debug, Default, Clone)]
struct Metric {
    name: &'static str,
    count: usize,
    sum: u128,
}

impl Metric {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.sum += elapsed.as_micros();
    }
}

pub struct ScopedMetric {
    metric_index: usize,
    start: Instant,
}

impl ScopedMetric {
    pub fn new(metric_index: usize) -> Self {
        ScopedMetric {
            metric_index,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedMetric {
    fn drop(&mut self) {
        // A poisoned registry only loses samples.
        if let Ok(mut metrics) = METRICS.lock() {
            metrics.record(self.metric_index, self.start.elapsed());
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    metrics: Vec<Metric>,
}

impl Metrics {
    pub fn new_metric(&mut self, name: &'static str) -> usize {
        // Call sites in different modules may share a name.
        if let Some(existing) = self.metrics.iter().position(|m| m.name == name) {
            return existing;
        }
        let len = self.metrics.len();
        self.metrics.push(Metric {
            name,
            ..Default::default()
        });
        len
    }

    fn record(&mut self, i: usize, elapsed: Duration) {
        self.metrics[i].record(elapsed);
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = &self.metrics;

        let mut name_width = 7; // To fit "metric ".
        for metric in metrics {
            name_width = std::cmp::max(name_width, metric.name.len());
        }
        writeln!(
            f,
            "{:name_width$} {:>6} {:>9} {:>11}",
            "metric ",
            "count",
            "avg (us)",
            "total (us)",
            name_width = name_width
        )?;
        writeln!(
            f,
            "{:-<name_width$} {:-^6} {:-^9} {:-^11}",
            "",
            "",
            "",
            "",
            name_width = name_width
        )?;
        for metric in metrics.iter().filter(|m| m.count > 0) {
            writeln!(
                f,
                "{:name_width$} {: >6} {:>9.3} {:>11}",
                metric.name,
                metric.count,
                metric.sum as f64 / metric.count as f64,
                metric.sum,
                name_width = name_width
            )?;
        }
        Ok(())
    }
}

/// Times the rest of the enclosing scope under `$name` when metrics are enabled.
#[macro_export]
macro_rules! scoped_metric {
    ($name:literal) => {
        let _scoped_metric = if $crate::is_enabled() {
            static _METRIC: $crate::OnceCell<usize> = $crate::OnceCell::new();
            ::core::option::Option::Some($crate::ScopedMetric::new(
                *_METRIC.get_or_init(|| $crate::new_metric($name)),
            ))
        } else {
            ::core::option::Option::None
        };
    };
}

static METRICS: Lazy<Mutex<Metrics>> = Lazy::new(|| Mutex::new(Metrics::default()));
static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// The metrics table as printed by `dump`.
pub fn report() -> String {
    match METRICS.lock() {
        Ok(m) => m.to_string(),
        Err(_) => String::new(),
    }
}

pub fn dump() {
    eprintln!("{}", report());
}

pub fn new_metric(name: &'static str) -> usize {
    match METRICS.lock() {
        Ok(mut m) => m.new_metric(name),
        Err(poisoned) => poisoned.into_inner().new_metric(name),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shared_names_share_a_slot() {
        let mut metrics = Metrics::default();
        let a = metrics.new_metric("stat");
        let b = metrics.new_metric("launch");
        assert_ne!(a, b);
        assert_eq!(metrics.new_metric("stat"), a);
    }

    #[test]
    fn test_display_skips_unused() {
        let mut metrics = Metrics::default();
        let used = metrics.new_metric("materialize");
        metrics.new_metric("never");
        metrics.record(used, Duration::from_micros(10));
        metrics.record(used, Duration::from_micros(30));
        let table = metrics.to_string();
        assert!(table.contains("materialize"));
        assert!(table.contains("     2"));
        assert!(!table.contains("never"));
    }

    #[test]
    fn test_macro_records_from_threads() {
        enable();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    scoped_metric!("metrics_test_thread");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(report().contains("metrics_test_thread"));
    }
}
