//! Clustering parameters.
//!
//! `ClusterConfig` carries the numeric parameters that are fixed at
//! construction time. It is designed to be easily serializable and loadable
//! from JSON or other formats; the non-serializable parts of engine
//! construction (coordinate extractors, aggregation hooks) live on
//! [`ClusterBuilder`](crate::ClusterBuilder).

use serde::de::Error;
use serde::{Deserialize, Serialize};

/// Numeric clustering parameters, fixed at construction.
///
/// # Example
///
/// ```rust
/// use clustio::ClusterConfig;
///
/// // Create default config
/// let config = ClusterConfig::default();
/// assert_eq!(config.radius, 40.0);
///
/// // Load from JSON; omitted fields take their defaults
/// let json = r#"{ "radius": 80.0, "min_points": 3 }"#;
/// let config = ClusterConfig::from_json(json).unwrap();
/// assert_eq!(config.min_points, 3);
/// assert_eq!(config.extent, 512.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster inclusion radius, in pixels at tile extent `extent`.
    #[serde(default = "ClusterConfig::default_radius")]
    pub radius: f64,

    /// Virtual tile size used to translate `radius` into projected units.
    #[serde(default = "ClusterConfig::default_extent")]
    pub extent: f64,

    /// Minimum combined point count required to form a cluster.
    #[serde(default = "ClusterConfig::default_min_points")]
    pub min_points: usize,

    /// Coarsest zoom at which layers are built.
    #[serde(default)]
    pub min_zoom: u8,

    /// Finest zoom at which clustering is considered.
    #[serde(default = "ClusterConfig::default_max_zoom")]
    pub max_zoom: u8,

    /// KD-tree leaf block size (static engine only).
    #[serde(default = "ClusterConfig::default_node_size")]
    pub node_size: usize,
}

impl ClusterConfig {
    const fn default_radius() -> f64 {
        40.0
    }

    const fn default_extent() -> f64 {
        512.0
    }

    const fn default_min_points() -> usize {
        2
    }

    const fn default_max_zoom() -> u8 {
        16
    }

    const fn default_node_size() -> usize {
        64
    }

    /// Largest supported `max_zoom`; finer layers add nothing at double
    /// precision.
    pub const MAX_SUPPORTED_ZOOM: u8 = 30;

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_extent(mut self, extent: f64) -> Self {
        self.extent = extent;
        self
    }

    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    /// Set the zoom range over which layers are built.
    pub fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    pub fn with_node_size(mut self, node_size: usize) -> Self {
        self.node_size = node_size;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err("Cluster radius must be finite and positive".to_string());
        }

        if !self.extent.is_finite() || self.extent <= 0.0 {
            return Err("Tile extent must be finite and positive".to_string());
        }

        if self.min_points < 1 {
            return Err("min_points must be at least 1".to_string());
        }

        if self.min_zoom > self.max_zoom {
            return Err(format!(
                "min_zoom ({}) must be <= max_zoom ({})",
                self.min_zoom, self.max_zoom
            ));
        }

        if self.max_zoom > Self::MAX_SUPPORTED_ZOOM {
            return Err(format!(
                "max_zoom must be <= {}",
                Self::MAX_SUPPORTED_ZOOM
            ));
        }

        if self.node_size < 2 {
            return Err("node_size must be at least 2".to_string());
        }

        Ok(())
    }

    /// Inclusion radius at the given zoom, in unit-square coordinates.
    pub(crate) fn radius_at(&self, zoom: u8) -> f64 {
        self.radius / (self.extent * f64::powi(2.0, zoom as i32))
    }

    /// Zoom of the leaf layer, one finer than `max_zoom`.
    pub(crate) fn leaf_zoom(&self) -> u8 {
        self.max_zoom + 1
    }

    /// Number of layers in the stack, from `min_zoom` through the leaf layer.
    pub(crate) fn layer_count(&self) -> usize {
        (self.leaf_zoom() - self.min_zoom) as usize + 1
    }

    /// Position of the layer for `zoom` within the stack.
    pub(crate) fn layer_slot(&self, zoom: u8) -> usize {
        (zoom - self.min_zoom) as usize
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius: Self::default_radius(),
            extent: Self::default_extent(),
            min_points: Self::default_min_points(),
            min_zoom: 0,
            max_zoom: Self::default_max_zoom(),
            node_size: Self::default_node_size(),
        }
    }
}
