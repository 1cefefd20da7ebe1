//! Rational time values, half-open time ranges, and the loop math used by the
//! play head and the cache window.
//!
//! A [`RationalTime`] is a `(value, rate)` pair. Comparisons always happen at a
//! common rate, so `12@24 == 0.5@1`. A non-positive rate marks the
//! "no time" sentinel ([`RationalTime::INVALID`]).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::{Add, Neg, Sub};

/// Position or duration expressed as `value / rate` seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RationalTime {
    pub value: f64,
    pub rate: f64,
}

impl RationalTime {
    /// Sentinel for "no time".
    pub const INVALID: Self = Self { value: -1.0, rate: -1.0 };

    pub const fn new(value: f64, rate: f64) -> Self {
        Self { value, rate }
    }

    pub const fn from_seconds(seconds: f64) -> Self {
        Self { value: seconds, rate: 1.0 }
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0.0
    }

    pub fn to_seconds(&self) -> f64 {
        if self.rate > 0.0 { self.value / self.rate } else { 0.0 }
    }

    pub fn rescaled_to(&self, rate: f64) -> Self {
        if !self.is_valid() {
            return *self;
        }
        if rate == self.rate {
            return Self::new(self.value, rate);
        }
        Self::new(self.value * rate / self.rate, rate)
    }

    pub fn floor(&self) -> Self {
        Self::new(self.value.floor(), self.rate)
    }

    pub fn ceil(&self) -> Self {
        Self::new(self.value.ceil(), self.rate)
    }

    /// Integer frame index at `rate`, rounding down.
    pub fn frame_at(&self, rate: f64) -> i64 {
        self.rescaled_to(rate).value.floor() as i64
    }

    /// Whole-second bucket containing this instant.
    pub fn whole_seconds(&self) -> i64 {
        self.to_seconds().floor() as i64
    }

    fn common_rate(&self, other: &Self) -> f64 {
        self.rate.max(other.rate)
    }

    pub fn min(self, other: Self) -> Self {
        if other < self { other } else { self }
    }

    pub fn max(self, other: Self) -> Self {
        if other > self { other } else { self }
    }
}

impl Default for RationalTime {
    fn default() -> Self {
        Self::INVALID
    }
}

impl PartialEq for RationalTime {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_valid(), other.is_valid()) {
            (false, false) => true,
            (true, true) => {
                let rate = self.common_rate(other);
                self.rescaled_to(rate).value == other.rescaled_to(rate).value
            }
            _ => false,
        }
    }
}

impl PartialOrd for RationalTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let rate = self.common_rate(other);
        self.rescaled_to(rate)
            .value
            .partial_cmp(&other.rescaled_to(rate).value)
    }
}

impl Add for RationalTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let rate = self.common_rate(&rhs);
        Self::new(self.rescaled_to(rate).value + rhs.rescaled_to(rate).value, rate)
    }
}

impl Sub for RationalTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        let rate = self.common_rate(&rhs);
        Self::new(self.rescaled_to(rate).value - rhs.rescaled_to(rate).value, rate)
    }
}

impl Neg for RationalTime {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.value, self.rate)
    }
}

/// Half-open interval `[start, start + duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: RationalTime,
    pub duration: RationalTime,
}

impl TimeRange {
    pub const fn new(start: RationalTime, duration: RationalTime) -> Self {
        Self { start, duration }
    }

    /// Range covering `start..=end_inclusive` in whole units of `start.rate`.
    pub fn from_start_end_inclusive(start: RationalTime, end_inclusive: RationalTime) -> Self {
        let rate = start.rate;
        let end = end_inclusive.rescaled_to(rate);
        Self::new(start, RationalTime::new(end.value - start.value + 1.0, rate))
    }

    pub fn from_start_end_exclusive(start: RationalTime, end_exclusive: RationalTime) -> Self {
        Self::new(start, end_exclusive - start)
    }

    pub fn is_valid(&self) -> bool {
        self.start.is_valid() && self.duration.is_valid()
    }

    pub fn rate(&self) -> f64 {
        self.duration.rate
    }

    pub fn end_exclusive(&self) -> RationalTime {
        self.start + self.duration
    }

    /// Last whole unit inside the range, or `start` for ranges of a unit or less.
    pub fn end_inclusive(&self) -> RationalTime {
        let rate = self.duration.rate;
        let end = self.end_exclusive().rescaled_to(rate);
        if (end - self.start).rescaled_to(rate).value > 1.0 {
            if self.duration.value != self.duration.value.floor() {
                RationalTime::new(end.value.floor(), rate)
            } else {
                RationalTime::new(end.value - 1.0, rate)
            }
        } else {
            self.start
        }
    }

    pub fn contains(&self, time: RationalTime) -> bool {
        self.start <= time && time < self.end_exclusive()
    }

    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end_exclusive() <= self.end_exclusive()
    }

    pub fn intersects(&self, other: &TimeRange) -> bool {
        self.start < other.end_exclusive() && other.start < self.end_exclusive()
    }

    /// Overlapping part of two ranges, `None` when they are disjoint.
    pub fn clamped(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.intersects(other) {
            return None;
        }
        let start = self.start.max(other.start);
        let end = self.end_exclusive().min(other.end_exclusive());
        Some(TimeRange::from_start_end_exclusive(start, end))
    }

    pub fn rescaled_to(&self, rate: f64) -> Self {
        Self::new(self.start.rescaled_to(rate), self.duration.rescaled_to(rate))
    }
}

/// Wraps `time` into `range`: below the start jumps to the inclusive end,
/// past the inclusive end jumps to the start. Returns whether a wrap happened.
pub fn loop_time(time: RationalTime, range: &TimeRange) -> (RationalTime, bool) {
    if time < range.start {
        (range.end_inclusive(), true)
    } else if time > range.end_inclusive() {
        (range.start, true)
    } else {
        (time, false)
    }
}

/// Splits `value` against `range` so that every returned piece lies inside
/// `range`. A value at least as long as the range yields the whole range; a
/// value straddling an edge yields the wrapped pieces in playback order, and the
/// pieces always sum to `min(value.duration, range.duration)`.
pub fn loop_range(value: &TimeRange, range: &TimeRange) -> Vec<TimeRange> {
    if value.duration >= range.duration {
        return vec![*range];
    }
    if range.contains_range(value) {
        return vec![*value];
    }

    let rate = range.rate();
    let range_start = range.start.rescaled_to(rate).value;
    let range_len = range.duration.rescaled_to(rate).value;
    let length = value.duration.rescaled_to(rate).value;
    let offset = (value.start.rescaled_to(rate).value - range_start).rem_euclid(range_len);

    let mut out = Vec::with_capacity(2);
    let first = length.min(range_len - offset);
    if first > 0.0 {
        out.push(TimeRange::new(
            RationalTime::new(range_start + offset, rate),
            RationalTime::new(first, rate),
        ));
    }
    let rest = length - first;
    if rest > 0.0 {
        out.push(TimeRange::new(
            RationalTime::new(range_start, rate),
            RationalTime::new(rest, rate),
        ));
    }
    out
}

/// Coalesces sorted whole-unit times into contiguous ranges.
pub fn to_ranges(times: &[RationalTime]) -> Vec<TimeRange> {
    let mut out: Vec<TimeRange> = Vec::new();
    for time in times {
        let unit = RationalTime::new(1.0, time.rate);
        match out.last_mut() {
            Some(last) if last.end_exclusive() == *time => {
                last.duration = last.duration + unit;
            }
            _ => out.push(TimeRange::new(*time, unit)),
        }
    }
    out
}

/// Maps `time` from one timeline onto another by aligning their starts and
/// flooring at the destination rate.
pub fn external_time(time: RationalTime, source: &TimeRange, destination: &TimeRange) -> RationalTime {
    let rate = destination.rate();
    (time - source.start + destination.start).rescaled_to(rate).floor()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(value: f64) -> RationalTime {
        RationalTime::new(value, 24.0)
    }

    fn range(start: f64, duration: f64) -> TimeRange {
        TimeRange::new(t(start), t(duration))
    }

    fn total(pieces: &[TimeRange]) -> f64 {
        pieces.iter().map(|r| r.duration.value).sum()
    }

    #[test]
    fn test_compare_across_rates() {
        assert_eq!(RationalTime::new(12.0, 24.0), RationalTime::from_seconds(0.5));
        assert!(RationalTime::new(11.0, 24.0) < RationalTime::from_seconds(0.5));
        assert_eq!(RationalTime::INVALID, RationalTime::default());
        assert_ne!(RationalTime::INVALID, t(0.0));
    }

    #[test]
    fn test_end_inclusive() {
        let r = range(48.0, 144.0);
        assert_eq!(r.end_exclusive(), t(192.0));
        assert_eq!(r.end_inclusive(), t(191.0));
        assert_eq!(range(10.0, 1.0).end_inclusive(), t(10.0));
        assert_eq!(
            TimeRange::from_start_end_inclusive(t(48.0), t(191.0)),
            range(48.0, 144.0)
        );
    }

    #[test]
    fn test_loop_time_inside_is_unchanged() {
        let r = range(48.0, 144.0);
        for v in [48.0, 100.0, 191.0] {
            assert_eq!(loop_time(t(v), &r), (t(v), false));
        }
    }

    #[test]
    fn test_loop_time_wraps_both_edges() {
        let r = range(48.0, 144.0);
        assert_eq!(loop_time(t(47.0), &r), (t(191.0), true));
        assert_eq!(loop_time(t(192.0), &r), (t(48.0), true));
        assert_eq!(loop_time(t(500.0), &r), (t(48.0), true));
    }

    #[test]
    fn test_loop_range_longer_than_range() {
        let r = range(0.0, 100.0);
        assert_eq!(loop_range(&range(-20.0, 150.0), &r), vec![r]);
        assert_eq!(loop_range(&range(0.0, 100.0), &r), vec![r]);
    }

    #[test]
    fn test_loop_range_contained() {
        let r = range(0.0, 100.0);
        let v = range(10.0, 20.0);
        assert_eq!(loop_range(&v, &r), vec![v]);
    }

    #[test]
    fn test_loop_range_straddles_start() {
        let r = range(0.0, 100.0);
        let pieces = loop_range(&range(-10.0, 30.0), &r);
        assert_eq!(pieces, vec![range(90.0, 10.0), range(0.0, 20.0)]);
    }

    #[test]
    fn test_loop_range_straddles_end() {
        let r = range(0.0, 100.0);
        let pieces = loop_range(&range(90.0, 30.0), &r);
        assert_eq!(pieces, vec![range(90.0, 10.0), range(0.0, 20.0)]);
    }

    #[test]
    fn test_loop_range_pieces_stay_inside() {
        let r = range(48.0, 144.0);
        for start in (-200..400).step_by(7) {
            for duration in [1.0, 13.0, 96.0, 143.0, 144.0, 300.0] {
                let v = range(start as f64, duration);
                let pieces = loop_range(&v, &r);
                assert_eq!(total(&pieces), duration.min(144.0), "value {:?}", v);
                for piece in &pieces {
                    assert!(r.contains_range(piece), "{:?} escapes {:?}", piece, r);
                }
            }
        }
    }

    #[test]
    fn test_to_ranges_coalesces() {
        let times: Vec<_> = [0.0, 1.0, 2.0, 5.0, 6.0, 9.0].into_iter().map(t).collect();
        assert_eq!(
            to_ranges(&times),
            vec![range(0.0, 3.0), range(5.0, 2.0), range(9.0, 1.0)]
        );
        assert!(to_ranges(&[]).is_empty());
    }

    #[test]
    fn test_external_time_aligns_starts() {
        let source = range(0.0, 240.0);
        let destination = TimeRange::new(RationalTime::new(86400.0, 30.0), RationalTime::new(300.0, 30.0));
        let mapped = external_time(t(24.0), &source, &destination);
        assert_eq!(mapped, RationalTime::new(86430.0, 30.0));
    }

    #[test]
    fn test_clamped_intersection() {
        let a = range(0.0, 100.0);
        assert_eq!(a.clamped(&range(50.0, 100.0)), Some(range(50.0, 50.0)));
        assert_eq!(a.clamped(&range(200.0, 10.0)), None);
    }
}
