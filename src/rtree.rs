//! Dynamic per-layer spatial index backed by `rstar`.
//!
//! Each layer of the dynamic engine indexes lightweight entries carrying the
//! element id; element records themselves live in the layer's map so they can
//! be updated without disturbing the tree. Bulk loads use rstar's packing
//! loader; incremental edits go through `insert`/`remove`.

use rstar::{Point as RstarPoint, RTree, AABB};
use uuid::Uuid;

/// Entry stored in a layer tree: projected position plus the element id.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexedEntry {
    pub x: f64,
    pub y: f64,
    pub id: Uuid,
}

impl IndexedEntry {
    pub fn new(x: f64, y: f64, id: Uuid) -> Self {
        Self { x, y, id }
    }
}

impl RstarPoint for IndexedEntry {
    type Scalar = f64;
    const DIMENSIONS: usize = 2;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        Self {
            x: generator(0),
            y: generator(1),
            id: Uuid::nil(),
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        match index {
            0 => self.x,
            1 => self.y,
            _ => unreachable!(),
        }
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        match index {
            0 => &mut self.x,
            1 => &mut self.y,
            _ => unreachable!(),
        }
    }
}

/// Axis-aligned query boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Boundary {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Boundary {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Square boundary of half-width `r` around a point.
    pub fn around(x: f64, y: f64, r: f64) -> Self {
        Self::new(x - r, y - r, x + r, y + r)
    }

    /// The same box inflated by `pad` on each side. Used for the merge probe
    /// on edits: an insert at a position can restructure anything within twice
    /// the layer radius.
    pub fn expand_by(&self, pad: f64) -> Self {
        Self::new(
            self.min_x - pad,
            self.min_y - pad,
            self.max_x + pad,
            self.max_y + pad,
        )
    }
}

/// Mutable 2-D index over [`IndexedEntry`] values.
pub(crate) struct DynamicTree {
    tree: RTree<IndexedEntry>,
}

impl DynamicTree {
    pub fn new() -> Self {
        Self { tree: RTree::new() }
    }

    /// Bulk load, used for `load` so per-layer trees start well packed.
    pub fn bulk(entries: Vec<IndexedEntry>) -> Self {
        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    pub fn insert(&mut self, entry: IndexedEntry) {
        self.tree.insert(entry);
    }

    pub fn remove(&mut self, entry: &IndexedEntry) -> bool {
        self.tree.remove(entry).is_some()
    }

    /// Entries inside the closed boundary.
    pub fn range(&self, boundary: Boundary) -> Vec<IndexedEntry> {
        let envelope = AABB::from_corners(
            IndexedEntry::new(boundary.min_x, boundary.min_y, Uuid::nil()),
            IndexedEntry::new(boundary.max_x, boundary.max_y, Uuid::nil()),
        );
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .cloned()
            .collect()
    }

    /// Entries whose distance to `(x, y)` is `<= r`.
    pub fn within(&self, x: f64, y: f64, r: f64) -> Vec<IndexedEntry> {
        let boundary = Boundary::around(x, y, r);
        let envelope = AABB::from_corners(
            IndexedEntry::new(boundary.min_x, boundary.min_y, Uuid::nil()),
            IndexedEntry::new(boundary.max_x, boundary.max_y, Uuid::nil()),
        );
        let r2 = r * r;
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|e| {
                let dx = e.x - x;
                let dy = e.y - y;
                dx * dx + dy * dy <= r2
            })
            .cloned()
            .collect()
    }
}
