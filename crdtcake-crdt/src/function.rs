/// The merge operator of a CRDT state.
///
/// Implementations must be commutative, associative and idempotent, the cluster
/// assumes this holds and reconciles replicas purely by merging whatever copies it sees.
pub trait CrdtFunction<S>: Send + Sync + 'static {
    /// Combines two states of the same key into one.
    fn merge(&self, first: S, second: S) -> S;

    /// Strips the state down to what changed at or after the given timestamp.
    ///
    /// Returning `None` means nothing of the state is newer than the horizon
    /// and the entry should be skipped entirely.
    fn extract(&self, state: S, timestamp: u64) -> Option<S>;
}

/// A [CrdtFunction] built from a plain combiner which keeps no history.
#[derive(Debug, Clone, Copy)]
pub struct IgnoringTimestamp<F>(F);

/// Creates a [CrdtFunction] where `extract` always returns the state untouched.
pub fn ignoring_timestamp<S, F>(combiner: F) -> IgnoringTimestamp<F>
where
    F: Fn(S, S) -> S + Send + Sync + 'static,
{
    IgnoringTimestamp(combiner)
}

impl<S, F> CrdtFunction<S> for IgnoringTimestamp<F>
where
    F: Fn(S, S) -> S + Send + Sync + 'static,
{
    #[inline]
    fn merge(&self, first: S, second: S) -> S {
        (self.0)(first, second)
    }

    #[inline]
    fn extract(&self, state: S, _timestamp: u64) -> Option<S> {
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_ignoring_timestamp_extract() {
        let max = ignoring_timestamp(|a: u64, b: u64| a.max(b));
        assert_eq!(max.extract(5, u64::MAX), Some(5));
        assert_eq!(max.extract(5, 0), Some(5));
    }

    #[test]
    fn test_merge_order_independent() {
        let union = ignoring_timestamp(|mut a: BTreeSet<u8>, b: BTreeSet<u8>| {
            a.extend(b);
            a
        });

        let a = BTreeSet::from([1, 2, 3]);
        let b = BTreeSet::from([2, 3, 7]);
        let c = BTreeSet::from([9]);

        let left = union.merge(union.merge(a.clone(), b.clone()), c.clone());
        let right = union.merge(c, union.merge(b.clone(), a.clone()));
        assert_eq!(left, right, "Merge order should not change the result.");

        let repeated = union.merge(left.clone(), a);
        assert_eq!(repeated, left, "Merging a subset again should be a no-op.");
    }
}
