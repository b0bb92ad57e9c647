//! The time coordinate attached to every packet.
//!
//! A [`Timestamp`] is a signed 64 bit value with a handful of distinguished
//! sentinels at both ends of the range. Streams only accept timestamps for
//! which [`Timestamp::is_allowed_in_stream`] holds, and packets on a stream
//! must have strictly increasing timestamps.

use std::fmt;

use crate::error::{GraphError, GraphResult};

/// A totally ordered time coordinate.
///
/// Ordinary values live in `[Timestamp::MIN, Timestamp::MAX]`. The sentinels
/// outside that range have dedicated meanings:
///
/// * [`Timestamp::UNSET`] — no timestamp has been assigned yet.
/// * [`Timestamp::UNSTARTED`] — a stream or node that has not started.
/// * [`Timestamp::PRE_STREAM`] — a single packet before all stream data.
/// * [`Timestamp::POST_STREAM`] — a single packet after all stream data.
/// * [`Timestamp::ONE_OVER_POST_STREAM`] — the bound just past `POST_STREAM`.
/// * [`Timestamp::DONE`] — the terminal bound: nothing will ever follow.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const UNSET: Timestamp = Timestamp(i64::MIN);
    pub const UNSTARTED: Timestamp = Timestamp(i64::MIN + 1);
    pub const PRE_STREAM: Timestamp = Timestamp(i64::MIN + 2);
    pub const MIN: Timestamp = Timestamp(i64::MIN + 3);
    pub const MAX: Timestamp = Timestamp(i64::MAX - 3);
    pub const POST_STREAM: Timestamp = Timestamp(i64::MAX - 2);
    pub const ONE_OVER_POST_STREAM: Timestamp = Timestamp(i64::MAX - 1);
    pub const DONE: Timestamp = Timestamp(i64::MAX);

    /// Creates an ordinary timestamp.
    ///
    /// Panics if `value` collides with one of the sentinels.
    pub fn new(value: i64) -> Timestamp {
        let ts = Timestamp(value);
        assert!(
            ts.is_range_value(),
            "timestamp value {value} is outside the ordinary range"
        );
        ts
    }

    /// The raw inner value.
    pub fn value(&self) -> i64 {
        self.0
    }

    /// True for ordinary values, i.e. everything except the sentinels.
    pub fn is_range_value(&self) -> bool {
        *self >= Timestamp::MIN && *self <= Timestamp::MAX
    }

    /// True if a packet with this timestamp may appear on a stream.
    pub fn is_allowed_in_stream(&self) -> bool {
        self.is_range_value() || *self == Timestamp::PRE_STREAM || *self == Timestamp::POST_STREAM
    }

    /// Adds an offset, saturating into the ordinary range.
    ///
    /// Sentinels are returned unchanged: an offset applied to `DONE` is still
    /// `DONE`.
    pub fn saturating_add(&self, offset: i64) -> Timestamp {
        if !self.is_range_value() {
            return *self;
        }
        let sum = self.0.saturating_add(offset);
        Timestamp(sum.clamp(Timestamp::MIN.0, Timestamp::MAX.0))
    }

    /// The smallest timestamp strictly greater than `self` that is still
    /// valid for a stream, following the sentinel chain
    /// `PRE_STREAM → MIN`, `MAX → POST_STREAM → ONE_OVER_POST_STREAM → DONE`.
    ///
    /// Fails with `InvalidArgument` when there is nothing to advance to.
    pub fn next_allowed_in_stream(&self) -> GraphResult<Timestamp> {
        match *self {
            Timestamp::PRE_STREAM => Ok(Timestamp::MIN),
            Timestamp::MAX => Ok(Timestamp::POST_STREAM),
            Timestamp::POST_STREAM => Ok(Timestamp::ONE_OVER_POST_STREAM),
            Timestamp::ONE_OVER_POST_STREAM => Ok(Timestamp::DONE),
            ts if ts.is_range_value() => Ok(Timestamp(ts.0 + 1)),
            ts => Err(GraphError::InvalidArgument(format!(
                "cannot advance timestamp {ts} within a stream"
            ))),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::UNSET => write!(f, "Timestamp::Unset"),
            Timestamp::UNSTARTED => write!(f, "Timestamp::Unstarted"),
            Timestamp::PRE_STREAM => write!(f, "Timestamp::PreStream"),
            Timestamp::MIN => write!(f, "Timestamp::Min"),
            Timestamp::MAX => write!(f, "Timestamp::Max"),
            Timestamp::POST_STREAM => write!(f, "Timestamp::PostStream"),
            Timestamp::ONE_OVER_POST_STREAM => write!(f, "Timestamp::OneOverPostStream"),
            Timestamp::DONE => write!(f, "Timestamp::Done"),
            Timestamp(v) => write!(f, "Timestamp({v})"),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_ordering() {
        assert!(Timestamp::UNSET < Timestamp::UNSTARTED);
        assert!(Timestamp::UNSTARTED < Timestamp::PRE_STREAM);
        assert!(Timestamp::PRE_STREAM < Timestamp::MIN);
        assert!(Timestamp::MIN < Timestamp::MAX);
        assert!(Timestamp::MAX < Timestamp::POST_STREAM);
        assert!(Timestamp::POST_STREAM < Timestamp::ONE_OVER_POST_STREAM);
        assert!(Timestamp::ONE_OVER_POST_STREAM < Timestamp::DONE);
    }

    #[test]
    fn stream_validity() {
        assert!(Timestamp::new(0).is_allowed_in_stream());
        assert!(Timestamp::PRE_STREAM.is_allowed_in_stream());
        assert!(Timestamp::POST_STREAM.is_allowed_in_stream());
        assert!(!Timestamp::UNSET.is_allowed_in_stream());
        assert!(!Timestamp::UNSTARTED.is_allowed_in_stream());
        assert!(!Timestamp::DONE.is_allowed_in_stream());
    }

    #[test]
    fn next_allowed_chain() {
        assert_eq!(
            Timestamp::PRE_STREAM.next_allowed_in_stream().unwrap(),
            Timestamp::MIN
        );
        assert_eq!(
            Timestamp::new(41).next_allowed_in_stream().unwrap(),
            Timestamp::new(42)
        );
        assert_eq!(
            Timestamp::MAX.next_allowed_in_stream().unwrap(),
            Timestamp::POST_STREAM
        );
        assert_eq!(
            Timestamp::POST_STREAM.next_allowed_in_stream().unwrap(),
            Timestamp::ONE_OVER_POST_STREAM
        );
        assert_eq!(
            Timestamp::ONE_OVER_POST_STREAM
                .next_allowed_in_stream()
                .unwrap(),
            Timestamp::DONE
        );
        assert!(Timestamp::DONE.next_allowed_in_stream().is_err());
        assert!(Timestamp::UNSET.next_allowed_in_stream().is_err());
        assert!(Timestamp::UNSTARTED.next_allowed_in_stream().is_err());
    }

    #[test]
    fn saturating_add_clamps() {
        assert_eq!(Timestamp::new(10).saturating_add(5), Timestamp::new(15));
        assert_eq!(Timestamp::MAX.saturating_add(100), Timestamp::MAX);
        assert_eq!(Timestamp::DONE.saturating_add(1), Timestamp::DONE);
    }

    #[test]
    #[should_panic]
    fn new_rejects_sentinel_values() {
        Timestamp::new(i64::MAX);
    }
}
