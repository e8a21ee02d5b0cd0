// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-rig-controller project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Linear scaling between register values and engineering units
//!
//! Every scaled point carries a [`Scaling`]: a raw domain, an engineering
//! domain and a full-scale value used by simulation and display code.
//!
//! ```text
//! val = to.lo + (raw - from.lo) / from.span * to.span
//! raw = from.lo + (val - to.lo) / to.span * from.span
//! ```
//!
//! The register helpers at the bottom of this module are the only place
//! where 16-bit register words are turned into numbers and back.

use serde::{Deserialize, Serialize};

/// A closed numeric interval `[lo, hi]`, written `[lo, hi]` in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct ScaleRange {
    pub lo: f64,
    pub hi: f64,
}

impl ScaleRange {
    pub const fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    /// Signed width of the interval
    pub fn span(&self) -> f64 {
        self.hi - self.lo
    }
}

impl From<[f64; 2]> for ScaleRange {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<ScaleRange> for [f64; 2] {
    fn from(value: ScaleRange) -> Self {
        [value.lo, value.hi]
    }
}

/// Scaling law of a single point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    /// Raw (register) domain
    pub from: ScaleRange,
    /// Engineering domain
    pub to: ScaleRange,
    /// Full-scale engineering value of the instrument
    pub full_scale: f64,
}

impl Default for Scaling {
    /// 15-bit unsigned register mapped onto a 4-20 mA loop
    fn default() -> Self {
        Self::new(Self::DEFAULT_FROM, Self::DEFAULT_TO, None)
    }
}

impl Scaling {
    pub const DEFAULT_FROM: ScaleRange = ScaleRange::new(0.0, 0x7FFF as f64);
    pub const DEFAULT_TO: ScaleRange = ScaleRange::new(4.0, 20.0);

    /// Create a scaling law; `full_scale` defaults to the top of the engineering domain
    pub fn new(from: ScaleRange, to: ScaleRange, full_scale: Option<f64>) -> Self {
        Self {
            from,
            to,
            full_scale: full_scale.unwrap_or(to.hi),
        }
    }

    /// Identity mapping over `[lo, hi]`
    pub fn identity(lo: f64, hi: f64) -> Self {
        let range = ScaleRange::new(lo, hi);
        Self::new(range, range, None)
    }

    /// Raw value to engineering value
    pub fn scale(&self, raw: f64) -> f64 {
        self.to.lo + (raw - self.from.lo) / self.from.span() * self.to.span()
    }

    /// Engineering value to raw value, without quantisation
    pub fn unscale(&self, val: f64) -> f64 {
        self.from.lo + (val - self.to.lo) / self.to.span() * self.from.span()
    }

    /// Both spans are finite and non-zero
    pub fn is_valid(&self) -> bool {
        let spans = [self.from.span(), self.to.span()];
        spans.iter().all(|s| s.is_finite() && *s != 0.0)
    }
}

/// Wrap a raw value into the two's-complement 16-bit range
///
/// `0xFFFF` becomes `-1`, `40000` becomes `-25536`, fractional parts are dropped.
pub fn wrap_i16(raw: f64) -> f64 {
    ((raw as i64) as u16 as i16) as f64
}

/// Interpret a register pair as an IEEE-754 single, high word first
pub fn decode_float(words: [u16; 2]) -> f32 {
    f32::from_bits(((words[0] as u32) << 16) | words[1] as u32)
}

/// Pack an IEEE-754 single into a register pair, high word first
pub fn encode_float(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, (bits & 0xFFFF) as u16]
}

/// Clamp a raw value into an unsigned register word, keeping the bit
/// pattern of negative values produced by signed points
pub fn to_register(raw: f64) -> u16 {
    if raw < 0.0 {
        (raw as i64 as i16) as u16
    } else {
        raw.min(u16::MAX as f64) as u16
    }
}
