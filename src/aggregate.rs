//! Aggregate payloads carried by clusters.
//!
//! Two independent attachments are supported. The map/reduce pair folds
//! per-point properties into per-cluster aggregates in place; the
//! [`ClusterData`] trait offers an immutable-combine style for callers who
//! prefer a monoid. An engine may carry both, either, or neither.

/// Map/reduce hooks folding per-point properties into per-cluster aggregates.
///
/// `map` is called once per leaf and must return a fresh, independently owned
/// value per call; the engine may mutate it. `reduce` merges `other` into the
/// accumulator in place, must not mutate `other`, and must be associative and
/// commutative: clusters merge children in implementation-defined order, and
/// during mutable updates sub-aggregates recombine.
pub struct MapReduce<P, A> {
    map: Box<dyn Fn(&P) -> A>,
    reduce: Box<dyn Fn(&mut A, &A)>,
}

impl<P, A> MapReduce<P, A> {
    pub fn new(
        map: impl Fn(&P) -> A + 'static,
        reduce: impl Fn(&mut A, &A) + 'static,
    ) -> Self {
        Self {
            map: Box::new(map),
            reduce: Box::new(reduce),
        }
    }

    pub(crate) fn map(&self, point: &P) -> A {
        (self.map)(point)
    }

    pub(crate) fn reduce(&self, accumulator: &mut A, other: &A) {
        (self.reduce)(accumulator, other)
    }
}

/// Monoid-style cluster aggregate.
///
/// `combine` must be associative and commutative; the engine folds children
/// in implementation-defined order.
pub trait ClusterData: Clone {
    fn combine(&self, other: &Self) -> Self;
}

/// Engines without a configured extractor carry no data.
impl ClusterData for () {
    fn combine(&self, _other: &Self) -> Self {}
}
