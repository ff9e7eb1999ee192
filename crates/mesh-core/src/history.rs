//! Clock-indexed history of a single value.
//!
//! A [`TimestampedHistory`] records one value per integer clock, from
//! `back_clock()` (oldest still retained) to `front_clock()` (newest).
//! Recording is append-only: a clock can only be written once, and only
//! after the current front. Skipped clocks carry the previous front value
//! forward ("no news means the previous value persisted"). The prefix that
//! every participant has acknowledged can be dropped with [`forget`].
//!
//! Only the clocks where a value is recorded are stored, so a jump of any
//! size costs one entry.
//!
//! [`forget`]: TimestampedHistory::forget

use std::collections::BTreeMap;
use thiserror::Error;

/// Logical clock shared by histories and the sync protocol.
pub type Clock = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Can't rewrite history: clock {clock} is not after front clock {front}")]
    Rewrite { clock: Clock, front: Clock },

    #[error("Can't forget clock {clock}: the front clock {front} must stay recorded")]
    ForgetFront { clock: Clock, front: Clock },

    #[error("Clock overflow after {front}")]
    ClockOverflow { front: Clock },
}

/// Append-only, clock-indexed value history.
///
/// A fresh history sits at clock 0 with no value recorded. Clocks that hold
/// no value (the initial clock, or gaps carried forward from it) read as
/// absent, exactly like clocks outside `back_clock()..=front_clock()`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedHistory<T> {
    back: Clock,
    front: Clock,
    /// Value from each key up to the next key; the first key is `back`
    changes: BTreeMap<Clock, Option<T>>,
}

impl<T> Default for TimestampedHistory<T> {
    fn default() -> Self {
        Self {
            back: 0,
            front: 0,
            changes: BTreeMap::from([(0, None)]),
        }
    }
}

impl<T: Clone> TimestampedHistory<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest clock still retained.
    pub fn back_clock(&self) -> Clock {
        self.back
    }

    /// Newest recorded clock.
    pub fn front_clock(&self) -> Clock {
        self.front
    }

    /// Value recorded at `clock`, or `None` if the clock is outside the
    /// retained range or nothing was ever recorded there.
    pub fn get(&self, clock: Clock) -> Option<&T> {
        if clock < self.back || clock > self.front {
            return None;
        }
        self.changes.range(..=clock).next_back()?.1.as_ref()
    }

    /// Value at the front clock.
    pub fn front_value(&self) -> Option<&T> {
        self.changes.last_key_value()?.1.as_ref()
    }

    /// Record `value` at `clock`.
    ///
    /// Fails if `clock` is not strictly after the front clock. Clocks between
    /// the old front and `clock` read as the old front value.
    pub fn set(&mut self, clock: Clock, value: T) -> Result<(), HistoryError> {
        if clock <= self.front {
            return Err(HistoryError::Rewrite {
                clock,
                front: self.front,
            });
        }
        self.changes.insert(clock, Some(value));
        self.front = clock;
        Ok(())
    }

    /// Record `value` at the clock right after the front. Returns that clock.
    pub fn push(&mut self, value: T) -> Result<Clock, HistoryError> {
        let clock = self
            .front
            .checked_add(1)
            .ok_or(HistoryError::ClockOverflow { front: self.front })?;
        self.set(clock, value)?;
        Ok(clock)
    }

    /// Discard every clock at or below `clock`; `back_clock()` becomes
    /// `clock + 1`.
    ///
    /// Forgetting below the back clock is a no-op. The front clock can never
    /// be forgotten.
    pub fn forget(&mut self, clock: Clock) -> Result<(), HistoryError> {
        if clock >= self.front {
            return Err(HistoryError::ForgetFront {
                clock,
                front: self.front,
            });
        }
        if clock < self.back {
            return Ok(());
        }

        let back = clock + 1;
        let carried = self
            .changes
            .range(..=back)
            .next_back()
            .and_then(|(_, value)| value.clone());
        self.changes = self.changes.split_off(&back);
        self.changes.entry(back).or_insert(carried);
        self.back = back;
        Ok(())
    }

    /// Number of retained clocks, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        usize::try_from(self.front - self.back)
            .map_or(usize::MAX, |span| span.saturating_add(1))
    }

    pub fn is_empty(&self) -> bool {
        self.front_value().is_none() && self.front == self.back
    }

    /// Retained clocks where a new value starts, back to front.
    pub fn change_clocks(&self) -> impl Iterator<Item = Clock> + '_ {
        self.changes.keys().copied()
    }

    /// Retained `(clock, value)` pairs from back to front.
    pub fn iter(&self) -> impl Iterator<Item = (Clock, Option<&T>)> {
        (self.back..=self.front).map(move |clock| (clock, self.get(clock)))
    }
}
