//! Dynamic clustering engine over per-zoom R-trees.
//!
//! The layer stack mirrors the static engine's, but every layer is an R-tree
//! plus an id-keyed element map so edits can restructure it in place. An edit
//! cascades from the leaf layer downward: at each zoom the engine probes the
//! finer layer within a padded boundary of every changed position, dissolves
//! the affected derivations at this zoom, and re-runs the greedy absorption
//! step over the affected elements in stable creation order. Everything
//! untouched by the probe keeps its clustering and its identity.

use geo::Point;
use rustc_hash::{FxHashMap, FxHashSet};
use uuid::Uuid;

use crate::aggregate::ClusterData;
use crate::builder::EngineHooks;
use crate::element::{ClusterEntry, ClusterId, ClusterView, PointView};
use crate::error::{ClustioError, Result};
use crate::rtree::{Boundary, DynamicTree, IndexedEntry};

/// One per-zoom layer of the dynamic engine.
struct DynLayer<A, D> {
    elements: FxHashMap<Uuid, DynElement<A, D>>,
    tree: DynamicTree,
    /// Inclusion radius used to build this layer, in unit-square coordinates.
    r: f64,
}

/// Per-layer element instance. An element appears in every layer from its
/// first appearance down to the coarsest zoom at which it has not been
/// absorbed; the instance at that coarsest layer carries the `parent` link to
/// the cluster that absorbed it.
#[derive(Clone)]
struct DynElement<A, D> {
    x: f64,
    y: f64,
    count: usize,
    /// Stamp recording the order instances entered this layer; the stable
    /// processing order for greedy absorption. Re-created instances keep
    /// their stamp so edits restore the original ordering.
    seq: u64,
    parent: Option<ClusterId>,
    kind: DynKind,
    properties: Option<A>,
    data: Option<D>,
}

#[derive(Clone)]
enum DynKind {
    Leaf {
        slot: usize,
    },
    Cluster {
        origin_x: f64,
        origin_y: f64,
        /// Element that seeded the cluster; a re-formed cluster with the same
        /// seed keeps its identifier.
        seed: Uuid,
        formed_zoom: u8,
    },
}

/// Element removed from a layer during restructuring; drives the cascade at
/// the next coarser zoom.
struct VanishRec {
    id: Uuid,
    x: f64,
    y: f64,
    parent: Option<ClusterId>,
}

/// Mutable hierarchical clustering index.
///
/// Usable immediately after construction; [`load`](Self::load) is an
/// idempotent bulk rebuild, and `add`/`remove` maintain the hierarchy
/// incrementally. Cluster identifiers are stable while a cluster exists, but
/// are not stable across differing edit orders.
pub struct DynamicClusterIndex<P, A = (), D = ()> {
    hooks: EngineHooks<P, A, D>,
    uuid_source: Box<dyn FnMut() -> Uuid>,
    points: Vec<Option<P>>,
    free_slots: Vec<usize>,
    active_points: usize,
    layers: Vec<DynLayer<A, D>>,
    /// Formation zoom per live cluster.
    cluster_zooms: FxHashMap<ClusterId, u8>,
    next_seq: u64,
}

impl<P, A, D> DynamicClusterIndex<P, A, D> {
    pub(crate) fn from_hooks(
        hooks: EngineHooks<P, A, D>,
        uuid_source: Box<dyn FnMut() -> Uuid>,
    ) -> Self {
        let layers = (hooks.config.min_zoom..=hooks.config.leaf_zoom())
            .map(|zoom| DynLayer {
                elements: FxHashMap::default(),
                tree: DynamicTree::new(),
                r: hooks.config.radius_at(zoom),
            })
            .collect();
        Self {
            hooks,
            uuid_source,
            points: Vec::new(),
            free_slots: Vec::new(),
            active_points: 0,
            layers,
            cluster_zooms: FxHashMap::default(),
            next_seq: 0,
        }
    }

    /// Number of points currently in the index.
    pub fn num_points(&self) -> usize {
        self.active_points
    }

    pub fn is_empty(&self) -> bool {
        self.active_points == 0
    }

    /// Number of elements (clusters plus standalone points) at the given
    /// zoom.
    pub fn points_at_zoom(&self, zoom: u8) -> usize {
        self.layer_for(zoom).elements.len()
    }

    fn slot(&self, zoom: u8) -> usize {
        self.hooks.config.layer_slot(zoom)
    }

    fn leaf_slot(&self) -> usize {
        self.layers.len() - 1
    }

    fn layer_for(&self, zoom: u8) -> &DynLayer<A, D> {
        let z = zoom.clamp(self.hooks.config.min_zoom, self.hooks.config.leaf_zoom());
        &self.layers[self.slot(z)]
    }
}

impl<P, A: Clone, D: ClusterData> DynamicClusterIndex<P, A, D> {
    /// Bulk (re)build from a point set, replacing any existing contents.
    pub fn load(&mut self, points: Vec<P>) -> Result<()> {
        // Validate every coordinate before touching any state.
        let mut projected = Vec::with_capacity(points.len());
        for point in &points {
            projected.push(self.hooks.project_point(point)?);
        }

        self.points.clear();
        self.free_slots.clear();
        self.active_points = 0;
        self.cluster_zooms.clear();
        self.next_seq = 0;
        for layer in &mut self.layers {
            layer.elements.clear();
            layer.tree = DynamicTree::new();
        }

        let leaf_slot = self.leaf_slot();
        let mut entries = Vec::with_capacity(points.len());
        for (point, (x, y)) in points.into_iter().zip(projected) {
            let (properties, data) = self.hooks.leaf_payloads(&point);
            let slot = self.points.len();
            self.points.push(Some(point));
            self.active_points += 1;

            let id = (self.uuid_source)();
            let seq = self.next_seq;
            self.next_seq += 1;
            self.layers[leaf_slot].elements.insert(
                id,
                DynElement {
                    x,
                    y,
                    count: 1,
                    seq,
                    parent: None,
                    kind: DynKind::Leaf { slot },
                    properties,
                    data,
                },
            );
            entries.push(IndexedEntry::new(x, y, id));
        }
        self.layers[leaf_slot].tree = DynamicTree::bulk(entries);

        for zoom in (self.hooks.config.min_zoom..=self.hooks.config.max_zoom).rev() {
            self.cluster_layer_full(zoom);
        }
        log::debug!(
            "rebuilt {} layers over {} points ({} clusters)",
            self.layers.len(),
            self.active_points,
            self.cluster_zooms.len()
        );
        Ok(())
    }

    /// Insert a single point, incrementally maintaining every layer.
    pub fn add(&mut self, point: P) -> Result<()> {
        let (x, y) = self.hooks.project_point(&point)?;
        let (properties, data) = self.hooks.leaf_payloads(&point);

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.points[slot] = Some(point);
                slot
            }
            None => {
                self.points.push(Some(point));
                self.points.len() - 1
            }
        };
        self.active_points += 1;

        let id = (self.uuid_source)();
        let seq = self.next_seq;
        self.next_seq += 1;
        let leaf_slot = self.leaf_slot();
        self.layers[leaf_slot].elements.insert(
            id,
            DynElement {
                x,
                y,
                count: 1,
                seq,
                parent: None,
                kind: DynKind::Leaf { slot },
                properties,
                data,
            },
        );
        self.layers[leaf_slot].tree.insert(IndexedEntry::new(x, y, id));

        self.restructure(vec![(x, y)], vec![id], Vec::new());
        Ok(())
    }

    /// Remove a point, located by projected position and the caller's
    /// equality. Returns the removed value.
    pub fn remove(&mut self, point: &P) -> Result<P>
    where
        P: PartialEq,
    {
        let (x, y) = self.hooks.project_point(point)?;
        let leaf_slot = self.leaf_slot();

        let mut found = None;
        for entry in self.layers[leaf_slot].tree.within(x, y, 0.0) {
            if let Some(element) = self.layers[leaf_slot].elements.get(&entry.id) {
                if let DynKind::Leaf { slot } = element.kind {
                    if self.points[slot].as_ref() == Some(point) {
                        found = Some((entry.id, slot));
                        break;
                    }
                }
            }
        }
        let (leaf_id, slot) = found.ok_or(ClustioError::PointNotFound)?;

        let old = self.layers[leaf_slot]
            .elements
            .remove(&leaf_id)
            .expect("leaf instance present in leaf layer");
        self.layers[leaf_slot]
            .tree
            .remove(&IndexedEntry::new(old.x, old.y, leaf_id));
        let removed = self.points[slot].take().expect("point slot occupied");
        self.free_slots.push(slot);
        self.active_points -= 1;

        self.restructure(
            vec![(x, y)],
            Vec::new(),
            vec![VanishRec {
                id: leaf_id,
                x: old.x,
                y: old.y,
                parent: old.parent,
            }],
        );
        Ok(removed)
    }

    /// Replace a point's payload (and possibly position). Equivalent to
    /// `remove(old)` followed by `add(new)`; preconditions are checked before
    /// any state changes.
    pub fn modify_point_data(&mut self, old: &P, new: P) -> Result<()>
    where
        P: PartialEq,
    {
        self.hooks.project_point(&new)?;
        if !self.contains(old)? {
            return Err(ClustioError::PointNotFound);
        }
        self.remove(old)?;
        self.add(new)
    }

    /// Whether the given point is present in the index.
    pub fn contains(&self, point: &P) -> Result<bool>
    where
        P: PartialEq,
    {
        let (x, y) = self.hooks.project_point(point)?;
        let leaf = &self.layers[self.leaf_slot()];
        Ok(leaf.tree.within(x, y, 0.0).iter().any(|entry| {
            match leaf.elements.get(&entry.id) {
                Some(element) => match element.kind {
                    DynKind::Leaf { slot } => self.points[slot].as_ref() == Some(point),
                    DynKind::Cluster { .. } => false,
                },
                None => false,
            }
        }))
    }

    /// Elements visible in the geographic viewport at the given zoom.
    pub fn search(
        &self,
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        zoom: u8,
    ) -> Result<Vec<ClusterEntry<'_, P, A, D>>> {
        if ![west, south, east, north].iter().all(|v| v.is_finite()) {
            log::warn!("rejecting viewport query with non-finite bounds");
            return Ok(Vec::new());
        }

        let layer = self.layer_for(zoom);
        let mut out = Vec::new();
        for [min_x, min_y, max_x, max_y] in
            self.hooks.projection.viewport_boxes(west, south, east, north)
        {
            for entry in layer.tree.range(Boundary::new(min_x, min_y, max_x, max_y)) {
                if let Some(view) = self.view(layer, entry.id) {
                    out.push(view);
                }
            }
        }
        Ok(out)
    }

    /// Direct children of a cluster, at the zoom one finer than its
    /// formation zoom.
    pub fn get_children(&self, id: ClusterId) -> Result<Vec<ClusterEntry<'_, P, A, D>>> {
        let formed_zoom = self.formation_zoom(id)?;
        let child_layer = &self.layers[self.slot(formed_zoom + 1)];
        Ok(self
            .child_ids(id, formed_zoom)?
            .into_iter()
            .filter_map(|child| self.view(child_layer, child))
            .collect())
    }

    /// Original points under a cluster, in depth-first traversal order,
    /// paginated by `limit` and `offset`.
    pub fn get_leaves(&self, id: ClusterId, limit: usize, offset: usize) -> Result<Vec<&P>> {
        let formed_zoom = self.formation_zoom(id)?;
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        let mut skipped = 0;
        self.collect_leaves(id, formed_zoom, limit, offset, &mut skipped, &mut out)?;
        Ok(out)
    }

    /// Smallest zoom at which the cluster's contents stop rendering as a
    /// single cluster.
    pub fn get_cluster_expansion_zoom(&self, id: ClusterId) -> Result<u8> {
        let mut current = id;
        loop {
            let formed_zoom = self.formation_zoom(current)?;
            let kids = self.child_ids(current, formed_zoom)?;
            if kids.len() == 1 {
                let child_layer = &self.layers[self.slot(formed_zoom + 1)];
                if let Some(element) = child_layer.elements.get(&kids[0]) {
                    if matches!(element.kind, DynKind::Cluster { .. }) {
                        current = ClusterId::token(kids[0]);
                        continue;
                    }
                }
            }
            return Ok(formed_zoom + 1);
        }
    }

    fn formation_zoom(&self, id: ClusterId) -> Result<u8> {
        self.cluster_zooms
            .get(&id)
            .copied()
            .ok_or(ClustioError::ClusterNotFound(id))
    }

    /// Child element ids of a cluster, in stable creation order.
    fn child_ids(&self, id: ClusterId, formed_zoom: u8) -> Result<Vec<Uuid>> {
        let layer = &self.layers[self.slot(formed_zoom)];
        let element = layer
            .elements
            .get(&id.as_uuid())
            .ok_or(ClustioError::ClusterNotFound(id))?;
        let (origin_x, origin_y) = match element.kind {
            DynKind::Cluster {
                origin_x, origin_y, ..
            } => (origin_x, origin_y),
            DynKind::Leaf { .. } => unreachable!("cluster registry points at a leaf"),
        };

        let child_layer = &self.layers[self.slot(formed_zoom + 1)];
        let mut kids: Vec<(u64, Uuid)> = child_layer
            .tree
            .within(origin_x, origin_y, layer.r)
            .into_iter()
            .filter_map(|entry| {
                let child = child_layer.elements.get(&entry.id)?;
                if child.parent == Some(id) {
                    Some((child.seq, entry.id))
                } else {
                    None
                }
            })
            .collect();
        kids.sort_unstable();
        Ok(kids.into_iter().map(|(_, id)| id).collect())
    }

    fn collect_leaves<'a>(
        &'a self,
        id: ClusterId,
        formed_zoom: u8,
        limit: usize,
        offset: usize,
        skipped: &mut usize,
        out: &mut Vec<&'a P>,
    ) -> Result<bool> {
        let child_layer = &self.layers[self.slot(formed_zoom + 1)];
        for child in self.child_ids(id, formed_zoom)? {
            let Some(element) = child_layer.elements.get(&child) else {
                continue;
            };
            match element.kind {
                DynKind::Leaf { slot } => {
                    if *skipped < offset {
                        *skipped += 1;
                    } else if let Some(point) = self.points[slot].as_ref() {
                        out.push(point);
                        if out.len() >= limit {
                            return Ok(true);
                        }
                    }
                }
                DynKind::Cluster { formed_zoom, .. } => {
                    let child_id = ClusterId::token(child);
                    if self.collect_leaves(child_id, formed_zoom, limit, offset, skipped, out)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn view<'a>(
        &'a self,
        layer: &'a DynLayer<A, D>,
        id: Uuid,
    ) -> Option<ClusterEntry<'a, P, A, D>> {
        let element = layer.elements.get(&id)?;
        let (x, y) = self.hooks.projection.unproject(element.x, element.y);
        let position = Point::new(x, y);
        match element.kind {
            DynKind::Leaf { slot } => self.points[slot].as_ref().map(|point| {
                ClusterEntry::Point(PointView { point, position })
            }),
            DynKind::Cluster { .. } => Some(ClusterEntry::Cluster(ClusterView {
                id: ClusterId::token(id),
                position,
                count: element.count,
                properties: element.properties.as_ref(),
                data: element.data.as_ref(),
            })),
        }
    }

    /// Full greedy pass used by `load`: derive the layer at `zoom` from the
    /// one zoom finer, bulk-loading the layer tree.
    fn cluster_layer_full(&mut self, zoom: u8) {
        let prev_slot = self.slot(zoom + 1);
        let this_slot = self.slot(zoom);
        let r = self.layers[this_slot].r;
        let min_points = self.hooks.config.min_points;

        let mut order: Vec<(u64, Uuid)> = self.layers[prev_slot]
            .elements
            .iter()
            .map(|(id, element)| (element.seq, *id))
            .collect();
        order.sort_unstable();

        let mut processed: FxHashSet<Uuid> = FxHashSet::default();
        let mut created: Vec<(Uuid, DynElement<A, D>)> = Vec::new();

        for (_, eid) in order {
            processed.insert(eid);
            if self.layers[prev_slot].elements[&eid].parent.is_some() {
                continue;
            }
            let element = self.layers[prev_slot].elements[&eid].clone();

            let (members, total) =
                self.absorbable_neighbors(prev_slot, eid, &element, r, &processed, None);

            if members.is_empty() || total < min_points {
                let mut instance = element;
                instance.seq = self.next_seq;
                self.next_seq += 1;
                created.push((eid, instance));
                continue;
            }

            let id = ClusterId::token((self.uuid_source)());
            let seq = self.next_seq;
            self.next_seq += 1;
            let cluster = self.form_cluster(prev_slot, zoom, id, seq, eid, &element, &members, total);
            self.cluster_zooms.insert(id, zoom);
            created.push((id.as_uuid(), cluster));
        }

        let mut entries = Vec::with_capacity(created.len());
        for (id, element) in created {
            entries.push(IndexedEntry::new(element.x, element.y, id));
            self.layers[this_slot].elements.insert(id, element);
        }
        self.layers[this_slot].tree = DynamicTree::bulk(entries);
    }

    /// Still-unabsorbed, unprocessed neighbors within `r`, in stable creation
    /// order. When `restrict` is given, only elements of that set may be
    /// absorbed (everything else keeps its existing derivation).
    fn absorbable_neighbors(
        &self,
        prev_slot: usize,
        eid: Uuid,
        element: &DynElement<A, D>,
        r: f64,
        processed: &FxHashSet<Uuid>,
        restrict: Option<&FxHashSet<Uuid>>,
    ) -> (Vec<Uuid>, usize) {
        let mut members: Vec<(u64, Uuid)> = Vec::new();
        let mut total = element.count;
        for entry in self.layers[prev_slot].tree.within(element.x, element.y, r) {
            if entry.id == eid || processed.contains(&entry.id) {
                continue;
            }
            if let Some(allowed) = restrict {
                if !allowed.contains(&entry.id) {
                    continue;
                }
            }
            let Some(neighbor) = self.layers[prev_slot].elements.get(&entry.id) else {
                continue;
            };
            if neighbor.parent.is_some() {
                continue;
            }
            members.push((neighbor.seq, entry.id));
            total += neighbor.count;
        }
        members.sort_unstable();
        (members.into_iter().map(|(_, id)| id).collect(), total)
    }

    /// Build a cluster element from a seed and its absorbed members, setting
    /// the members' parent links on the finer layer.
    #[allow(clippy::too_many_arguments)]
    fn form_cluster(
        &mut self,
        prev_slot: usize,
        zoom: u8,
        id: ClusterId,
        seq: u64,
        seed: Uuid,
        element: &DynElement<A, D>,
        members: &[Uuid],
        total: usize,
    ) -> DynElement<A, D> {
        let mut wx = element.x * element.count as f64;
        let mut wy = element.y * element.count as f64;
        let mut properties = element.properties.clone();
        let mut data = element.data.clone();

        for member in members {
            let (mx, my, mcount, mproperties, mdata) = {
                let m = &self.layers[prev_slot].elements[member];
                (m.x, m.y, m.count, m.properties.clone(), m.data.clone())
            };
            wx += mx * mcount as f64;
            wy += my * mcount as f64;
            if let Some(map_reduce) = self.hooks.map_reduce.as_ref() {
                if let (Some(accumulator), Some(other)) = (properties.as_mut(), mproperties.as_ref())
                {
                    map_reduce.reduce(accumulator, other);
                }
            }
            data = match (data.take(), mdata) {
                (Some(accumulator), Some(other)) => Some(accumulator.combine(&other)),
                (accumulator, _) => accumulator,
            };
            if let Some(m) = self.layers[prev_slot].elements.get_mut(member) {
                m.parent = Some(id);
            }
        }
        if let Some(seed_element) = self.layers[prev_slot].elements.get_mut(&seed) {
            seed_element.parent = Some(id);
        }

        let total_f = total as f64;
        DynElement {
            x: wx / total_f,
            y: wy / total_f,
            count: total,
            seq,
            parent: None,
            kind: DynKind::Cluster {
                origin_x: element.x,
                origin_y: element.y,
                seed,
                formed_zoom: zoom,
            },
            properties,
            data,
        }
    }

    /// Cascade an edit from the leaf layer downward.
    ///
    /// `seeds` are the positions that changed at the finer layer, `dirty` the
    /// ids whose finer-layer instances changed or appeared, `vanished` the
    /// instances that were removed from it.
    fn restructure(
        &mut self,
        mut seeds: Vec<(f64, f64)>,
        mut dirty: Vec<Uuid>,
        mut vanished: Vec<VanishRec>,
    ) {
        let min_zoom = self.hooks.config.min_zoom;
        let max_zoom = self.hooks.config.max_zoom;
        let min_points = self.hooks.config.min_points;

        for zoom in (min_zoom..=max_zoom).rev() {
            if seeds.is_empty() && dirty.is_empty() && vanished.is_empty() {
                return;
            }

            let prev_slot = self.slot(zoom + 1);
            let this_slot = self.slot(zoom);
            let r = self.layers[this_slot].r;

            // Probe the finer layer: anything within twice the layer radius
            // of a changed position can change its derivation at this zoom.
            let mut affected: FxHashSet<Uuid> = FxHashSet::default();
            for &(sx, sy) in &seeds {
                let probe = Boundary::around(sx, sy, r).expand_by(r);
                for entry in self.layers[prev_slot].tree.range(probe) {
                    let dx = entry.x - sx;
                    let dy = entry.y - sy;
                    if dx * dx + dy * dy <= 4.0 * r * r {
                        affected.insert(entry.id);
                    }
                }
            }

            // Everything at this zoom derived from an affected or changed
            // element must be dissolved and re-derived.
            let mut targets: FxHashSet<Uuid> = FxHashSet::default();
            for id in &affected {
                if let Some(element) = self.layers[prev_slot].elements.get(id) {
                    if let Some(parent) = element.parent {
                        targets.insert(parent.as_uuid());
                    } else if self.layers[this_slot].elements.contains_key(id) {
                        targets.insert(*id);
                    }
                }
            }
            for id in &dirty {
                if self.layers[this_slot].elements.contains_key(id) {
                    targets.insert(*id);
                }
            }
            for rec in &vanished {
                if let Some(parent) = rec.parent {
                    targets.insert(parent.as_uuid());
                }
                if self.layers[this_slot].elements.contains_key(&rec.id) {
                    targets.insert(rec.id);
                }
            }

            let mut removed: FxHashMap<Uuid, DynElement<A, D>> = FxHashMap::default();
            for target in targets {
                if let Some(element) = self.layers[this_slot].elements.remove(&target) {
                    self.layers[this_slot]
                        .tree
                        .remove(&IndexedEntry::new(element.x, element.y, target));
                    removed.insert(target, element);
                }
            }

            // Free the children of clusters dissolved at their formation
            // zoom, remembering each seed so an identical re-formation keeps
            // its identifier.
            let mut seed_reuse: FxHashMap<Uuid, (ClusterId, u64)> = FxHashMap::default();
            let mut work: FxHashSet<Uuid> = FxHashSet::default();
            for (target, element) in &removed {
                if let DynKind::Cluster {
                    origin_x,
                    origin_y,
                    seed,
                    formed_zoom,
                } = element.kind
                {
                    if formed_zoom == zoom {
                        let cluster_id = ClusterId::token(*target);
                        seed_reuse.insert(seed, (cluster_id, element.seq));
                        self.cluster_zooms.remove(&cluster_id);

                        let kids: Vec<Uuid> = self.layers[prev_slot]
                            .tree
                            .within(origin_x, origin_y, r)
                            .into_iter()
                            .map(|entry| entry.id)
                            .collect();
                        for kid in kids {
                            if let Some(child) = self.layers[prev_slot].elements.get_mut(&kid) {
                                if child.parent == Some(cluster_id) {
                                    child.parent = None;
                                    work.insert(kid);
                                }
                            }
                        }
                    }
                }
            }
            for id in &affected {
                if let Some(element) = self.layers[prev_slot].elements.get(id) {
                    if element.parent.is_none() {
                        work.insert(*id);
                    }
                }
            }

            // Greedy absorption over the affected elements, in stable
            // creation order. Elements outside the work set keep their
            // existing derivation and cannot be absorbed.
            let mut order: Vec<(u64, Uuid)> = work
                .iter()
                .filter_map(|id| {
                    self.layers[prev_slot]
                        .elements
                        .get(id)
                        .map(|element| (element.seq, *id))
                })
                .collect();
            order.sort_unstable();

            let mut processed: FxHashSet<Uuid> = FxHashSet::default();
            let mut created: Vec<Uuid> = Vec::new();

            for (_, eid) in order {
                processed.insert(eid);
                if self.layers[prev_slot].elements[&eid].parent.is_some() {
                    continue;
                }
                let element = self.layers[prev_slot].elements[&eid].clone();

                let (members, total) = self.absorbable_neighbors(
                    prev_slot,
                    eid,
                    &element,
                    r,
                    &processed,
                    Some(&work),
                );

                if members.is_empty() || total < min_points {
                    let mut instance = element;
                    instance.seq = match removed.get(&eid) {
                        Some(old) => old.seq,
                        None => {
                            let seq = self.next_seq;
                            self.next_seq += 1;
                            seq
                        }
                    };
                    self.layers[this_slot]
                        .tree
                        .insert(IndexedEntry::new(instance.x, instance.y, eid));
                    self.layers[this_slot].elements.insert(eid, instance);
                    created.push(eid);
                    continue;
                }

                let (id, seq) = match seed_reuse.remove(&eid) {
                    Some(reused) => reused,
                    None => {
                        let seq = self.next_seq;
                        self.next_seq += 1;
                        (ClusterId::token((self.uuid_source)()), seq)
                    }
                };
                let cluster =
                    self.form_cluster(prev_slot, zoom, id, seq, eid, &element, &members, total);
                self.layers[this_slot]
                    .tree
                    .insert(IndexedEntry::new(cluster.x, cluster.y, id.as_uuid()));
                self.layers[this_slot].elements.insert(id.as_uuid(), cluster);
                self.cluster_zooms.insert(id, zoom);
                created.push(id.as_uuid());
            }

            // Diff dissolved against re-created to drive the next coarser
            // zoom. Identical re-creations keep their previous parent link
            // and produce no further cascade.
            let mut next_seeds = Vec::new();
            let mut next_dirty = Vec::new();
            let mut next_vanished = Vec::new();

            for id in created {
                let (x, y, count) = {
                    let element = &self.layers[this_slot].elements[&id];
                    (element.x, element.y, element.count)
                };
                match removed.remove(&id) {
                    Some(old) if old.x == x && old.y == y && old.count == count => {
                        if old.parent.is_some() {
                            if let Some(element) = self.layers[this_slot].elements.get_mut(&id) {
                                element.parent = old.parent;
                            }
                        }
                    }
                    Some(old) => {
                        next_seeds.push((old.x, old.y));
                        next_seeds.push((x, y));
                        next_dirty.push(id);
                        if old.parent.is_some() {
                            next_vanished.push(VanishRec {
                                id,
                                x: old.x,
                                y: old.y,
                                parent: old.parent,
                            });
                        }
                    }
                    None => {
                        next_seeds.push((x, y));
                        next_dirty.push(id);
                    }
                }
            }
            for (id, old) in removed {
                if let DynKind::Cluster { formed_zoom, .. } = old.kind {
                    if formed_zoom == zoom {
                        // Dissolved for good; the registry entry was already
                        // dropped when its children were freed.
                        debug_assert!(!self
                            .cluster_zooms
                            .contains_key(&ClusterId::token(id)));
                    }
                }
                next_seeds.push((old.x, old.y));
                next_vanished.push(VanishRec {
                    id,
                    x: old.x,
                    y: old.y,
                    parent: old.parent,
                });
            }

            seeds = next_seeds;
            dirty = next_dirty;
            vanished = next_vanished;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::ClusterBuilder;
    use crate::error::ClustioError;

    #[derive(Debug, Clone, PartialEq)]
    struct City {
        lng: f64,
        lat: f64,
    }

    fn city(lng: f64, lat: f64) -> City {
        City { lng, lat }
    }

    fn empty_index() -> crate::DynamicClusterIndex<City> {
        ClusterBuilder::new()
            .get_x(|c: &City| c.lng)
            .get_y(|c: &City| c.lat)
            .build_dynamic()
            .unwrap()
    }

    #[test]
    fn test_add_and_search() {
        let mut index = empty_index();
        index.add(city(10.0, 10.0)).unwrap();
        index.add(city(10.0, 10.0)).unwrap();

        for zoom in 0..=16 {
            let found = index.search(9.0, 9.0, 11.0, 11.0, zoom).unwrap();
            assert_eq!(found.len(), 1, "zoom {}", zoom);
            assert_eq!(found[0].count(), 2);
            assert!(found[0].is_cluster());
        }
        // At the leaf zoom both points are visible individually.
        let found = index.search(9.0, 9.0, 11.0, 11.0, 17).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_remove_unknown_point_fails() {
        let mut index = empty_index();
        index.add(city(0.0, 0.0)).unwrap();
        assert!(matches!(
            index.remove(&city(1.0, 1.0)),
            Err(ClustioError::PointNotFound)
        ));
        assert_eq!(index.num_points(), 1);
    }

    #[test]
    fn test_add_then_remove_leaves_empty() {
        let mut index = empty_index();
        let p = city(12.0, -5.0);
        index.add(p.clone()).unwrap();
        assert!(index.contains(&p).unwrap());

        let removed = index.remove(&p).unwrap();
        assert_eq!(removed, p);
        assert!(index.is_empty());
        for zoom in 0..=17 {
            assert!(index.search(-180.0, -85.0, 180.0, 85.0, zoom).unwrap().is_empty());
        }
    }

    #[test]
    fn test_cluster_dissolves_on_remove() {
        let mut index = empty_index();
        index.add(city(10.0, 10.0)).unwrap();
        index.add(city(10.0, 10.0)).unwrap();

        let found = index.search(9.0, 9.0, 11.0, 11.0, 5).unwrap();
        assert!(found[0].is_cluster());

        index.remove(&city(10.0, 10.0)).unwrap();
        let found = index.search(9.0, 9.0, 11.0, 11.0, 5).unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].is_cluster());
        assert_eq!(index.num_points(), 1);
    }

    #[test]
    fn test_modify_point_data() {
        let mut index = empty_index();
        let old = city(10.0, 10.0);
        index.add(old.clone()).unwrap();

        index.modify_point_data(&old, city(11.0, 11.0)).unwrap();
        assert!(!index.contains(&old).unwrap());
        assert!(index.contains(&city(11.0, 11.0)).unwrap());

        assert!(matches!(
            index.modify_point_data(&old, city(12.0, 12.0)),
            Err(ClustioError::PointNotFound)
        ));
    }

    #[test]
    fn test_unknown_cluster_id_fails() {
        let index = empty_index();
        let bogus = crate::element::ClusterId::dense(3, 12);
        assert!(matches!(
            index.get_children(bogus),
            Err(ClustioError::ClusterNotFound(_))
        ));
    }
}
