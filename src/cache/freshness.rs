//! Freshness Module
//!
//! Classifies entries as VALID, STALE, REFRESHING or EXPIRED and drives the
//! single-flight refresh transitions.
//!
//! ```text
//! VALID --(now >= expires - stale_time, swr on)--> STALE
//! VALID/STALE --(now >= expires)--> EXPIRED
//! STALE --(first read)--> REFRESHING --(success)--> VALID
//!                                    --(failure)--> STALE | EXPIRED
//! ```

use std::time::Duration;

use crate::cache::{CacheEntry, EntryState};

// == Read Outcome ==
/// What a read should do with an entry after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Serve the value.
    Fresh,
    /// Serve the old value; `revalidate` is true for the one reader that
    /// owns the refresh.
    Stale { revalidate: bool },
    /// Treat as a miss and remove the entry.
    Expired,
}

// == Freshness Policy ==
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    stale_while_revalidate: bool,
    stale_time_ms: u64,
}

impl FreshnessPolicy {
    pub fn new(stale_while_revalidate: bool, stale_time: Duration) -> Self {
        Self {
            stale_while_revalidate,
            stale_time_ms: stale_time.as_millis() as u64,
        }
    }

    /// Current state of `entry` at `now`. Does not mutate the entry.
    pub fn classify<T>(&self, entry: &CacheEntry<T>, now: u64) -> EntryState {
        if entry.is_expired(now) {
            return EntryState::Expired;
        }
        if entry.state == EntryState::Refreshing {
            return EntryState::Refreshing;
        }
        if self.stale_while_revalidate && now >= entry.expires.saturating_sub(self.stale_time_ms) {
            return EntryState::Stale;
        }
        EntryState::Valid
    }

    /// Classifies `entry` for a read and applies the resulting transition.
    ///
    /// The first read of a STALE entry moves it to REFRESHING and is the only
    /// one told to revalidate; later reads see REFRESHING and just get the
    /// stale value.
    pub fn on_read<T>(&self, entry: &mut CacheEntry<T>, now: u64) -> ReadOutcome {
        let state = self.classify(entry, now);
        match state {
            EntryState::Expired => {
                entry.state = EntryState::Expired;
                ReadOutcome::Expired
            }
            EntryState::Valid => {
                entry.state = EntryState::Valid;
                ReadOutcome::Fresh
            }
            EntryState::Stale => {
                entry.state = EntryState::Refreshing;
                ReadOutcome::Stale { revalidate: true }
            }
            EntryState::Refreshing => ReadOutcome::Stale { revalidate: false },
        }
    }

    /// Applies a failed refresh. The old data is kept unless the TTL ran out
    /// while the refresh was in flight.
    pub fn on_refresh_failure<T>(&self, entry: &mut CacheEntry<T>, now: u64) -> EntryState {
        entry.state = if entry.is_expired(now) {
            EntryState::Expired
        } else {
            EntryState::Stale
        };
        entry.state
    }
}
