//! Engine builder for flexible construction.
//!
//! `ClusterBuilder` collects the non-serializable construction parameters —
//! coordinate extractors, projection, aggregation hooks, the cluster
//! identifier source — next to a [`ClusterConfig`], and assembles either
//! engine variant.

use uuid::Uuid;

use crate::aggregate::{ClusterData, MapReduce};
use crate::cluster::ClusterIndex;
use crate::config::ClusterConfig;
use crate::dynamic::DynamicClusterIndex;
use crate::error::{ClustioError, Result};
use crate::projection::Projection;

/// Builder for both engine variants.
///
/// The coordinate extractors are required; everything else has a default.
///
/// # Example
///
/// ```rust
/// use clustio::ClusterBuilder;
///
/// struct City { lng: f64, lat: f64 }
///
/// let index = ClusterBuilder::new()
///     .get_x(|c: &City| c.lng)
///     .get_y(|c: &City| c.lat)
///     .build_static()
///     .unwrap();
/// # let _ = index;
/// ```
pub struct ClusterBuilder<P, A = (), D = ()> {
    config: ClusterConfig,
    projection: Projection,
    get_x: Option<Box<dyn Fn(&P) -> f64>>,
    get_y: Option<Box<dyn Fn(&P) -> f64>>,
    map_reduce: Option<MapReduce<P, A>>,
    extract_data: Option<Box<dyn Fn(&P) -> D>>,
    uuid_source: Option<Box<dyn FnMut() -> Uuid>>,
}

impl<P> ClusterBuilder<P> {
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
            projection: Projection::default(),
            get_x: None,
            get_y: None,
            map_reduce: None,
            extract_data: None,
            uuid_source: None,
        }
    }
}

impl<P> Default for ClusterBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, A, D> ClusterBuilder<P, A, D> {
    /// Set the numeric clustering parameters.
    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the coordinate projection. Defaults to
    /// [`Projection::WebMercator`].
    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Extractor for the x coordinate (longitude under the default
    /// projection).
    pub fn get_x(mut self, f: impl Fn(&P) -> f64 + 'static) -> Self {
        self.get_x = Some(Box::new(f));
        self
    }

    /// Extractor for the y coordinate (latitude under the default
    /// projection).
    pub fn get_y(mut self, f: impl Fn(&P) -> f64 + 'static) -> Self {
        self.get_y = Some(Box::new(f));
        self
    }

    /// Attach a map/reduce aggregation pair.
    ///
    /// `map` must return a fresh, independently owned value per call; the
    /// engine may mutate it. `reduce` merges its second argument into the
    /// first in place, must not mutate the second argument, and must be
    /// associative and commutative.
    pub fn map_reduce<A2>(
        self,
        map: impl Fn(&P) -> A2 + 'static,
        reduce: impl Fn(&mut A2, &A2) + 'static,
    ) -> ClusterBuilder<P, A2, D> {
        ClusterBuilder {
            config: self.config,
            projection: self.projection,
            get_x: self.get_x,
            get_y: self.get_y,
            map_reduce: Some(MapReduce::new(map, reduce)),
            extract_data: self.extract_data,
            uuid_source: self.uuid_source,
        }
    }

    /// Attach a monoid-style aggregate extractor. Coexists with
    /// [`map_reduce`](Self::map_reduce); a cluster carries both payload types
    /// if both are configured.
    pub fn cluster_data<D2: ClusterData>(
        self,
        extract: impl Fn(&P) -> D2 + 'static,
    ) -> ClusterBuilder<P, A, D2> {
        ClusterBuilder {
            config: self.config,
            projection: self.projection,
            get_x: self.get_x,
            get_y: self.get_y,
            map_reduce: self.map_reduce,
            extract_data: Some(Box::new(extract)),
            uuid_source: self.uuid_source,
        }
    }

    /// Cluster identifier source for the dynamic engine. Defaults to random
    /// v4 UUIDs.
    pub fn uuid_source(mut self, f: impl FnMut() -> Uuid + 'static) -> Self {
        self.uuid_source = Some(Box::new(f));
        self
    }

    /// Build the static (load-once) engine.
    pub fn build_static(self) -> Result<ClusterIndex<P, A, D>> {
        let (hooks, _) = self.into_parts()?;
        Ok(ClusterIndex::from_hooks(hooks))
    }

    /// Build the dynamic (incrementally maintained) engine.
    pub fn build_dynamic(self) -> Result<DynamicClusterIndex<P, A, D>> {
        let (hooks, uuid_source) = self.into_parts()?;
        Ok(DynamicClusterIndex::from_hooks(
            hooks,
            uuid_source.unwrap_or_else(|| Box::new(Uuid::new_v4)),
        ))
    }

    fn into_parts(
        self,
    ) -> Result<(EngineHooks<P, A, D>, Option<Box<dyn FnMut() -> Uuid>>)> {
        self.config.validate().map_err(ClustioError::InvalidInput)?;

        let get_x = self
            .get_x
            .ok_or_else(|| ClustioError::InvalidInput("missing get_x extractor".to_string()))?;
        let get_y = self
            .get_y
            .ok_or_else(|| ClustioError::InvalidInput("missing get_y extractor".to_string()))?;

        Ok((
            EngineHooks {
                config: self.config,
                projection: self.projection,
                get_x,
                get_y,
                map_reduce: self.map_reduce,
                extract_data: self.extract_data,
            },
            self.uuid_source,
        ))
    }
}

/// Validated construction parameters shared by both engines.
pub(crate) struct EngineHooks<P, A, D> {
    pub config: ClusterConfig,
    pub projection: Projection,
    pub get_x: Box<dyn Fn(&P) -> f64>,
    pub get_y: Box<dyn Fn(&P) -> f64>,
    pub map_reduce: Option<MapReduce<P, A>>,
    pub extract_data: Option<Box<dyn Fn(&P) -> D>>,
}

impl<P, A, D> EngineHooks<P, A, D> {
    /// Extract and project one point, rejecting non-finite coordinates.
    pub fn project_point(&self, point: &P) -> Result<(f64, f64)> {
        let x = (self.get_x)(point);
        let y = (self.get_y)(point);
        if !x.is_finite() || !y.is_finite() {
            return Err(ClustioError::InvalidInput(format!(
                "coordinate extractors returned non-finite values ({}, {})",
                x, y
            )));
        }

        let (px, py) = self.projection.project(x, y);
        if !px.is_finite() || !py.is_finite() {
            return Err(ClustioError::InvalidInput(format!(
                "coordinates ({}, {}) project outside the supported domain",
                x, y
            )));
        }
        Ok((px, py))
    }

    /// Initial aggregate payloads for a leaf.
    pub fn leaf_payloads(&self, point: &P) -> (Option<A>, Option<D>) {
        let properties = self.map_reduce.as_ref().map(|mr| mr.map(point));
        let data = self.extract_data.as_ref().map(|f| f(point));
        (properties, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct City {
        lng: f64,
        lat: f64,
    }

    #[test]
    fn test_builder_requires_extractors() {
        let result = ClusterBuilder::<City>::new().build_static();
        assert!(matches!(result, Err(ClustioError::InvalidInput(_))));

        let result = ClusterBuilder::new()
            .get_x(|c: &City| c.lng)
            .build_static();
        assert!(matches!(result, Err(ClustioError::InvalidInput(_))));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = ClusterBuilder::new()
            .config(ClusterConfig::default().with_radius(-1.0))
            .get_x(|c: &City| c.lng)
            .get_y(|c: &City| c.lat)
            .build_static();
        assert!(matches!(result, Err(ClustioError::InvalidInput(_))));
    }

    #[test]
    fn test_builder_builds_both_variants() {
        assert!(ClusterBuilder::new()
            .get_x(|c: &City| c.lng)
            .get_y(|c: &City| c.lat)
            .build_static()
            .is_ok());

        assert!(ClusterBuilder::new()
            .get_x(|c: &City| c.lng)
            .get_y(|c: &City| c.lat)
            .build_dynamic()
            .is_ok());
    }

    #[test]
    fn test_project_point_rejects_non_finite() {
        let (hooks, _) = ClusterBuilder::new()
            .get_x(|c: &City| c.lng)
            .get_y(|c: &City| c.lat)
            .into_parts()
            .unwrap();

        let bad = City {
            lng: f64::NAN,
            lat: 0.0,
        };
        assert!(hooks.project_point(&bad).is_err());

        let ok = City {
            lng: 10.0,
            lat: 20.0,
        };
        assert!(hooks.project_point(&ok).is_ok());
    }
}
