use std::cmp;
use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "rkyv-support")]
use rkyv::{Archive, Deserialize, Serialize};

use crate::CrdtFunction;

/// The current unix timestamp in milliseconds.
pub fn get_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "rkyv-support", derive(Serialize, Deserialize, Archive))]
#[cfg_attr(feature = "rkyv-support", archive(check_bytes))]
/// A state paired with the time it was last changed.
///
/// Useful for states which carry no notion of time themselves, the
/// container's [CrdtFunction] lets downloads skip anything older
/// than the requested horizon.
pub struct TimestampContainer<S> {
    timestamp: u64,
    state: S,
}

impl<S> TimestampContainer<S> {
    pub fn new(timestamp: u64, state: S) -> Self {
        Self { timestamp, state }
    }

    /// Wraps the state with the current unix timestamp.
    pub fn now(state: S) -> Self {
        Self::new(get_unix_timestamp_ms(), state)
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn state(&self) -> &S {
        &self.state
    }

    #[inline]
    pub fn into_state(self) -> S {
        self.state
    }

    /// Creates the [CrdtFunction] for containers whose inner states
    /// are combined with `combiner`.
    pub fn crdt_function<F>(combiner: F) -> TimestampFunction<S, F>
    where
        F: Fn(S, S) -> S + Send + Sync + 'static,
    {
        TimestampFunction {
            combiner,
            _state: PhantomData,
        }
    }
}

/// The [CrdtFunction] of a [TimestampContainer].
pub struct TimestampFunction<S, F> {
    combiner: F,
    _state: PhantomData<fn() -> S>,
}

impl<S, F> CrdtFunction<TimestampContainer<S>> for TimestampFunction<S, F>
where
    S: 'static,
    F: Fn(S, S) -> S + Send + Sync + 'static,
{
    fn merge(
        &self,
        first: TimestampContainer<S>,
        second: TimestampContainer<S>,
    ) -> TimestampContainer<S> {
        TimestampContainer {
            timestamp: cmp::max(first.timestamp, second.timestamp),
            state: (self.combiner)(first.state, second.state),
        }
    }

    fn extract(
        &self,
        state: TimestampContainer<S>,
        timestamp: u64,
    ) -> Option<TimestampContainer<S>> {
        if state.timestamp >= timestamp {
            Some(state)
        } else {
            None
        }
    }
}
