//! Layer elements and the public query views.
//!
//! Layers hold a tagged sum of two element variants: leaves (original input
//! points) and clusters (aggregations of nearby elements). Queries surface
//! them through the borrowed [`ClusterEntry`] views.

use std::fmt;

use geo::Point;
use uuid::Uuid;

/// Stable identifier for a cluster within one engine instance.
///
/// Identifiers are stable while the cluster exists and distinct clusters have
/// distinct identifiers. The static engine derives dense deterministic ids
/// packed with the zoom of formation; the dynamic engine draws opaque tokens
/// from its configured identifier source, so identity survives restructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterId(Uuid);

impl ClusterId {
    /// Dense identifier packing the zoom of formation with an arena index.
    /// Reproducible across identical loads of the static engine.
    pub(crate) fn dense(zoom: u8, index: u64) -> Self {
        ClusterId(Uuid::from_u64_pair(zoom as u64, index))
    }

    /// Opaque identifier from a generated token.
    pub(crate) fn token(uuid: Uuid) -> Self {
        ClusterId(uuid)
    }

    pub(crate) fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Arena element used by the static engine.
///
/// An element exists in every layer from its first appearance up to (and
/// including) the coarsest layer at which it has not been absorbed into a
/// cluster; layers reference arena slots rather than copying.
#[derive(Debug, Clone)]
pub(crate) struct Element<A, D> {
    /// Projected centroid (the point itself for leaves).
    pub x: f64,
    pub y: f64,
    /// Leaves transitively represented; 1 for leaves.
    pub count: usize,
    /// Cluster that absorbed this element, if any.
    pub parent: Option<ClusterId>,
    pub kind: ElementKind,
    pub properties: Option<A>,
    pub data: Option<D>,
}

#[derive(Debug, Clone)]
pub(crate) enum ElementKind {
    /// Original input point, referenced by its stable index into the loaded
    /// sequence.
    Leaf { source: usize },
    /// Aggregate of nearby elements. `origin` keeps the seeding element's
    /// coordinates for stable identity and child lookup.
    Cluster {
        id: ClusterId,
        origin_x: f64,
        origin_y: f64,
        formed_zoom: u8,
    },
}

impl<A, D> Element<A, D> {
    pub fn cluster_id(&self) -> Option<ClusterId> {
        match self.kind {
            ElementKind::Cluster { id, .. } => Some(id),
            ElementKind::Leaf { .. } => None,
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.kind, ElementKind::Cluster { .. })
    }
}

/// One result of a viewport or drill-down query.
pub enum ClusterEntry<'a, P, A, D> {
    Cluster(ClusterView<'a, A, D>),
    Point(PointView<'a, P>),
}

impl<'a, P, A, D> ClusterEntry<'a, P, A, D> {
    /// Unprojected position of the element.
    pub fn position(&self) -> Point {
        match self {
            ClusterEntry::Cluster(c) => c.position,
            ClusterEntry::Point(p) => p.position,
        }
    }

    /// Leaves transitively represented; 1 for leaves.
    pub fn count(&self) -> usize {
        match self {
            ClusterEntry::Cluster(c) => c.count,
            ClusterEntry::Point(_) => 1,
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, ClusterEntry::Cluster(_))
    }

    pub fn as_cluster(&self) -> Option<&ClusterView<'a, A, D>> {
        match self {
            ClusterEntry::Cluster(c) => Some(c),
            ClusterEntry::Point(_) => None,
        }
    }

    pub fn as_point(&self) -> Option<&PointView<'a, P>> {
        match self {
            ClusterEntry::Point(p) => Some(p),
            ClusterEntry::Cluster(_) => None,
        }
    }
}

/// Borrowed view of a cluster element.
pub struct ClusterView<'a, A, D> {
    pub id: ClusterId,
    /// Unprojected centroid.
    pub position: Point,
    /// Leaves transitively represented, `>= 2`.
    pub count: usize,
    /// Map/reduce aggregate, if configured.
    pub properties: Option<&'a A>,
    /// Monoid aggregate, if configured.
    pub data: Option<&'a D>,
}

/// Borrowed view of a leaf element.
pub struct PointView<'a, P> {
    /// The original caller-owned point.
    pub point: &'a P,
    /// Unprojected position.
    pub position: Point,
}
