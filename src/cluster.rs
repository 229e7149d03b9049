//! Static clustering engine over flat KD-tree layers.
//!
//! Points are supplied once at [`load`](ClusterIndex::load); the full zoom
//! hierarchy is precomputed bottom-up, one layer per zoom from the leaf layer
//! at `max_zoom + 1` down to `min_zoom`. Each layer is indexed by a packed
//! KD-tree, so the load cost is amortized over many viewport queries.

use geo::Point;
use rustc_hash::FxHashMap;

use crate::aggregate::ClusterData;
use crate::builder::EngineHooks;
use crate::element::{ClusterEntry, ClusterId, ClusterView, Element, ElementKind, PointView};
use crate::error::{ClustioError, Result};
use crate::kdtree::FlatKdTree;

/// One per-zoom layer: element references in stable order plus the spatial
/// index over their centroids.
struct StaticLayer {
    ids: Vec<u32>,
    tree: FlatKdTree,
    /// Inclusion radius used to build this layer, in unit-square coordinates.
    r: f64,
}

/// Immutable hierarchical clustering index.
///
/// Built through [`ClusterBuilder`](crate::ClusterBuilder). Not thread-safe
/// for mutation; concurrent read-only queries after `load` are safe provided
/// the caller guarantees no in-flight mutation.
///
/// # Example
///
/// ```rust
/// use clustio::ClusterBuilder;
///
/// struct City { lng: f64, lat: f64 }
///
/// let mut index = ClusterBuilder::new()
///     .get_x(|c: &City| c.lng)
///     .get_y(|c: &City| c.lat)
///     .build_static()
///     .unwrap();
///
/// index.load(vec![
///     City { lng: 1.5, lat: 46.0 },
///     City { lng: 0.9, lat: 46.4 },
///     City { lng: 19.0, lat: 45.0 },
/// ]).unwrap();
///
/// let visible = index.search(0.0, 40.0, 20.0, 50.0, 5).unwrap();
/// assert_eq!(visible.len(), 2); // one cluster, one standalone point
/// ```
pub struct ClusterIndex<P, A = (), D = ()> {
    hooks: EngineHooks<P, A, D>,
    points: Vec<P>,
    arena: Vec<Element<A, D>>,
    layers: Vec<StaticLayer>,
    clusters: FxHashMap<ClusterId, usize>,
    loaded: bool,
}

impl<P, A, D> ClusterIndex<P, A, D> {
    pub(crate) fn from_hooks(hooks: EngineHooks<P, A, D>) -> Self {
        Self {
            hooks,
            points: Vec::new(),
            arena: Vec::new(),
            layers: Vec::new(),
            clusters: FxHashMap::default(),
            loaded: false,
        }
    }

    /// Total number of loaded points.
    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(ClustioError::NotLoaded)
        }
    }
}

impl<P, A: Clone, D: ClusterData> ClusterIndex<P, A, D> {
    /// Load the point set and precompute the layer stack.
    ///
    /// One-shot: a second call is rejected. Iteration order during clustering
    /// derives from the caller's input order, so identical inputs yield
    /// identical layer stacks and identical query outputs.
    pub fn load(&mut self, points: Vec<P>) -> Result<()> {
        if self.loaded {
            return Err(ClustioError::InvalidInput(
                "index is already loaded; the static engine is one-shot".to_string(),
            ));
        }

        // Validate every coordinate before touching any state.
        let mut projected = Vec::with_capacity(points.len());
        for point in &points {
            projected.push(self.hooks.project_point(point)?);
        }

        let min_zoom = self.hooks.config.min_zoom;
        for (i, (point, &(x, y))) in points.iter().zip(projected.iter()).enumerate() {
            let (properties, data) = self.hooks.leaf_payloads(point);
            self.arena.push(Element {
                x,
                y,
                count: 1,
                parent: None,
                kind: ElementKind::Leaf { source: i },
                properties,
                data,
            });
        }

        let leaf_ids: Vec<u32> = (0..self.arena.len() as u32).collect();
        let mut stack = Vec::with_capacity(self.hooks.config.layer_count());
        stack.push(self.build_layer(leaf_ids, self.hooks.config.leaf_zoom()));

        for zoom in (min_zoom..=self.hooks.config.max_zoom).rev() {
            let prev = stack.last().expect("layer stack is never empty here");
            let next_ids = self.cluster_into(prev, zoom);
            stack.push(self.build_layer(next_ids, zoom));
        }

        stack.reverse();
        self.layers = stack;
        self.points = points;
        self.loaded = true;
        log::debug!(
            "built {} layers over {} points ({} clusters)",
            self.layers.len(),
            self.points.len(),
            self.clusters.len()
        );
        Ok(())
    }

    /// Greedy absorption pass: derive the element set of `zoom` from the
    /// layer one zoom finer.
    ///
    /// Elements are processed in the stable order they entered the finer
    /// layer. An element absorbs its still-unprocessed, unabsorbed neighbors
    /// within the layer radius; a cluster forms only when at least one
    /// neighbor is absorbed and the combined count reaches `min_points`,
    /// otherwise the element is promoted unchanged.
    fn cluster_into(&mut self, prev: &StaticLayer, zoom: u8) -> Vec<u32> {
        let r = self.hooks.config.radius_at(zoom);
        let min_points = self.hooks.config.min_points;
        let mut next_ids = Vec::with_capacity(prev.ids.len());
        let mut visited = vec![false; prev.ids.len()];

        for i in 0..prev.ids.len() {
            let eid = prev.ids[i] as usize;
            visited[i] = true;
            if self.arena[eid].parent.is_some() {
                continue;
            }

            let (ex, ey) = (self.arena[eid].x, self.arena[eid].y);

            let mut members: Vec<usize> = Vec::new();
            let mut total = self.arena[eid].count;
            for pos in prev.tree.within(ex, ey, r) {
                let pos = pos as usize;
                if visited[pos] {
                    continue;
                }
                let nid = prev.ids[pos] as usize;
                if self.arena[nid].parent.is_some() {
                    continue;
                }
                members.push(nid);
                total += self.arena[nid].count;
            }

            if members.is_empty() || total < min_points {
                next_ids.push(eid as u32);
                continue;
            }

            let new_idx = self.arena.len();
            let id = ClusterId::dense(zoom, new_idx as u64);

            let mut wx = ex * self.arena[eid].count as f64;
            let mut wy = ey * self.arena[eid].count as f64;
            let mut properties = self.arena[eid].properties.clone();
            let mut data = self.arena[eid].data.clone();

            for &m in &members {
                wx += self.arena[m].x * self.arena[m].count as f64;
                wy += self.arena[m].y * self.arena[m].count as f64;

                if let Some(mr) = self.hooks.map_reduce.as_ref() {
                    if let (Some(acc), Some(other)) =
                        (properties.as_mut(), self.arena[m].properties.as_ref())
                    {
                        mr.reduce(acc, other);
                    }
                }
                data = match (data.take(), self.arena[m].data.as_ref()) {
                    (Some(acc), Some(other)) => Some(acc.combine(other)),
                    (acc, _) => acc,
                };

                self.arena[m].parent = Some(id);
            }
            self.arena[eid].parent = Some(id);

            let total_f = total as f64;
            self.arena.push(Element {
                x: wx / total_f,
                y: wy / total_f,
                count: total,
                parent: None,
                kind: ElementKind::Cluster {
                    id,
                    origin_x: ex,
                    origin_y: ey,
                    formed_zoom: zoom,
                },
                properties,
                data,
            });
            self.clusters.insert(id, new_idx);
            next_ids.push(new_idx as u32);
        }

        next_ids
    }

    fn build_layer(&self, ids: Vec<u32>, zoom: u8) -> StaticLayer {
        let xs: Vec<f64> = ids.iter().map(|&i| self.arena[i as usize].x).collect();
        let ys: Vec<f64> = ids.iter().map(|&i| self.arena[i as usize].y).collect();
        StaticLayer {
            tree: FlatKdTree::build(xs, ys, self.hooks.config.node_size),
            ids,
            r: self.hooks.config.radius_at(zoom),
        }
    }

    /// Elements visible in the geographic viewport at the given zoom.
    ///
    /// The zoom is clamped to `[min_zoom, max_zoom + 1]`. Viewports crossing
    /// the antimeridian are handled by issuing two range queries and
    /// unioning the results.
    pub fn search(
        &self,
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        zoom: u8,
    ) -> Result<Vec<ClusterEntry<'_, P, A, D>>> {
        self.ensure_loaded()?;
        if ![west, south, east, north].iter().all(|v| v.is_finite()) {
            log::warn!("rejecting viewport query with non-finite bounds");
            return Ok(Vec::new());
        }

        let layer = self.layer_for(zoom);
        let mut out = Vec::new();
        for [min_x, min_y, max_x, max_y] in
            self.hooks.projection.viewport_boxes(west, south, east, north)
        {
            for pos in layer.tree.range(min_x, min_y, max_x, max_y) {
                out.push(self.entry(layer.ids[pos as usize] as usize));
            }
        }
        Ok(out)
    }

    /// Direct children of a cluster, at the zoom one finer than its
    /// formation zoom.
    pub fn get_children(&self, id: ClusterId) -> Result<Vec<ClusterEntry<'_, P, A, D>>> {
        self.ensure_loaded()?;
        let idx = self.cluster_index(id)?;
        Ok(self
            .children_indices(idx)
            .into_iter()
            .map(|i| self.entry(i))
            .collect())
    }

    /// Original points under a cluster, in depth-first traversal order,
    /// paginated by `limit` and `offset`.
    pub fn get_leaves(&self, id: ClusterId, limit: usize, offset: usize) -> Result<Vec<&P>> {
        self.ensure_loaded()?;
        let idx = self.cluster_index(id)?;
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        let mut skipped = 0;
        self.collect_leaves(idx, limit, offset, &mut skipped, &mut out);
        Ok(out)
    }

    /// Smallest zoom at which the cluster's contents stop rendering as a
    /// single cluster.
    pub fn get_cluster_expansion_zoom(&self, id: ClusterId) -> Result<u8> {
        self.ensure_loaded()?;
        let mut idx = self.cluster_index(id)?;
        loop {
            let formed_zoom = match self.arena[idx].kind {
                ElementKind::Cluster { formed_zoom, .. } => formed_zoom,
                ElementKind::Leaf { .. } => unreachable!("cluster lookup returned a leaf"),
            };

            let kids = self.children_indices(idx);
            if kids.len() == 1 && self.arena[kids[0]].is_cluster() {
                idx = kids[0];
                continue;
            }
            return Ok(formed_zoom + 1);
        }
    }

    /// Number of elements (clusters plus standalone points) at the given
    /// zoom.
    pub fn points_at_zoom(&self, zoom: u8) -> Result<usize> {
        self.ensure_loaded()?;
        Ok(self.layer_for(zoom).ids.len())
    }

    fn layer_for(&self, zoom: u8) -> &StaticLayer {
        let z = zoom.clamp(self.hooks.config.min_zoom, self.hooks.config.leaf_zoom());
        &self.layers[self.hooks.config.layer_slot(z)]
    }

    fn cluster_index(&self, id: ClusterId) -> Result<usize> {
        self.clusters
            .get(&id)
            .copied()
            .ok_or(ClustioError::ClusterNotFound(id))
    }

    /// Arena indices of a cluster's direct children, in stable layer order.
    ///
    /// Children were absorbed within the formation radius of the cluster's
    /// origin, so one radius query on the finer layer finds them all.
    fn children_indices(&self, cluster_idx: usize) -> Vec<usize> {
        let (id, origin_x, origin_y, formed_zoom) = match self.arena[cluster_idx].kind {
            ElementKind::Cluster {
                id,
                origin_x,
                origin_y,
                formed_zoom,
            } => (id, origin_x, origin_y, formed_zoom),
            ElementKind::Leaf { .. } => return Vec::new(),
        };

        let child_layer = &self.layers[self.hooks.config.layer_slot(formed_zoom + 1)];
        let r = self.layers[self.hooks.config.layer_slot(formed_zoom)].r;
        let mut positions = child_layer.tree.within(origin_x, origin_y, r);
        positions.sort_unstable();
        positions
            .into_iter()
            .map(|p| child_layer.ids[p as usize] as usize)
            .filter(|&i| self.arena[i].parent == Some(id))
            .collect()
    }

    fn collect_leaves<'a>(
        &'a self,
        idx: usize,
        limit: usize,
        offset: usize,
        skipped: &mut usize,
        out: &mut Vec<&'a P>,
    ) -> bool {
        for child in self.children_indices(idx) {
            match self.arena[child].kind {
                ElementKind::Leaf { source } => {
                    if *skipped < offset {
                        *skipped += 1;
                    } else {
                        out.push(&self.points[source]);
                        if out.len() >= limit {
                            return true;
                        }
                    }
                }
                ElementKind::Cluster { .. } => {
                    if self.collect_leaves(child, limit, offset, skipped, out) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn entry(&self, idx: usize) -> ClusterEntry<'_, P, A, D> {
        let element = &self.arena[idx];
        let (x, y) = self.hooks.projection.unproject(element.x, element.y);
        let position = Point::new(x, y);
        match element.kind {
            ElementKind::Leaf { source } => ClusterEntry::Point(PointView {
                point: &self.points[source],
                position,
            }),
            ElementKind::Cluster { id, .. } => ClusterEntry::Cluster(ClusterView {
                id,
                position,
                count: element.count,
                properties: element.properties.as_ref(),
                data: element.data.as_ref(),
            }),
        }
    }
}
