//! Block timestamps, with a user adjustable offset.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::TimeIncrement;

fn wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs())
        .unwrap_or_default()
}

/// The offset and virtual clock at one point, restored on revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    offset: i64,
    clock: u64,
}

/// Tracks the offset applied to the time source.
///
/// With [`TimeIncrement::Clock`] the source is the wall clock. With
/// [`TimeIncrement::Fixed`] it is a virtual clock started at the genesis
/// timestamp and advanced by the increment for every block.
#[derive(Debug)]
pub struct TimeManager {
    increment: TimeIncrement,
    offset: Mutex<i64>,
    clock: Mutex<u64>,
}

impl TimeManager {
    pub fn new(increment: TimeIncrement) -> Self {
        Self {
            increment,
            offset: Mutex::new(0),
            clock: Mutex::new(wall_clock()),
        }
    }

    /// Starts the virtual clock. No effect on the wall clock source.
    pub fn start(&self, genesis_timestamp: u64) {
        *self.clock.lock() = genesis_timestamp;
    }

    fn source(&self) -> u64 {
        match self.increment {
            TimeIncrement::Clock => wall_clock(),
            TimeIncrement::Fixed(_) => *self.clock.lock(),
        }
    }

    pub fn offset(&self) -> i64 {
        *self.offset.lock()
    }

    pub fn set_offset(&self, offset: i64) {
        *self.offset.lock() = offset;
    }

    pub fn moment(&self) -> Moment {
        Moment {
            offset: self.offset(),
            clock: *self.clock.lock(),
        }
    }

    /// Winds time back or forward to `moment`.
    pub fn restore(&self, moment: Moment) {
        self.set_offset(moment.offset);
        *self.clock.lock() = moment.clock;
    }

    /// The current time as the chain sees it.
    pub fn adjusted(&self) -> u64 {
        self.source().saturating_add_signed(self.offset())
    }

    /// Moves time forward. Returns the new offset.
    pub fn increase(&self, seconds: u64) -> i64 {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_add(i64::try_from(seconds).unwrap_or(i64::MAX));
        *offset
    }

    /// Makes `timestamp` the current time. Returns the new offset.
    pub fn set_time(&self, timestamp: u64) -> i64 {
        let offset = i128::from(timestamp) - i128::from(self.source());
        let offset = i64::try_from(offset).unwrap_or(if offset < 0 { i64::MIN } else { i64::MAX });
        self.set_offset(offset);
        offset
    }

    /// Timestamp of a block built on a parent with `parent_timestamp`. An
    /// explicit timestamp becomes the current time.
    pub fn next_timestamp(&self, parent_timestamp: u64, explicit: Option<u64>) -> u64 {
        if let Some(timestamp) = explicit {
            self.set_time(timestamp);
            return timestamp;
        }
        if let TimeIncrement::Fixed(step) = self.increment {
            let mut clock = self.clock.lock();
            *clock = clock.saturating_add(step);
        }
        self.adjusted().max(parent_timestamp)
    }
}
