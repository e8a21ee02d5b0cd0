// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Time-windowed sample log
//!
//! Keeps `(timestamp, value)` pairs for a trailing window of wall-clock seconds
//! and derives the statistics used by operator displays and routines:
//! mean, population standard deviation and the split-half gradient.

use std::collections::VecDeque;

/// Rolling log of `(timestamp, value)` samples
///
/// A window of `0` disables logging; pushes are ignored and the log stays empty.
#[derive(Debug, Clone, Default)]
pub struct RollingLog {
    window: f64,
    samples: VecDeque<(f64, f64)>,
}

impl RollingLog {
    pub fn new(window: f64) -> Self {
        Self {
            window: window.max(0.0),
            samples: VecDeque::new(),
        }
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    /// Change the window; disabling the log drops every retained sample
    pub fn set_window(&mut self, window: f64) {
        self.window = window.max(0.0);
        if !self.is_enabled() {
            self.samples.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.window > 0.0
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample and prune everything older than `timestamp - window`
    ///
    /// Timestamps never go backwards: a sample older than the newest one is
    /// recorded at the newest timestamp.
    pub fn push(&mut self, timestamp: f64, value: f64) {
        if !self.is_enabled() {
            return;
        }
        let timestamp = match self.samples.back() {
            Some(&(last, _)) if timestamp < last => last,
            _ => timestamp,
        };
        self.samples.push_back((timestamp, value));
        self.prune(timestamp);
    }

    /// Drop samples older than `now - window`
    pub fn prune(&mut self, now: f64) {
        let oldest = now - self.window;
        while matches!(self.samples.front(), Some(&(t, _)) if t < oldest) {
            self.samples.pop_front();
        }
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|&(_, v)| v)
    }

    /// Mean of the retained samples, `current` when fewer than two are retained
    pub fn average(&self, current: f64) -> f64 {
        if self.samples.len() < 2 {
            return current;
        }
        mean(self.values())
    }

    /// Population standard deviation, `0` when fewer than two samples are retained
    pub fn stddev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let centre = mean(self.values());
        let ss: f64 = self.values().map(|x| (x - centre).powi(2)).sum();
        (ss / n as f64).sqrt()
    }

    /// Mean of the newer half minus mean of the older half
    ///
    /// With an odd count the extra sample belongs to the newer half.
    pub fn gradient(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let midpoint = n / 2;
        let older = mean(self.values().take(midpoint));
        let newer = mean(self.values().skip(midpoint));
        newer - older
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
