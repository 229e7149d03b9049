//! Hierarchical point clustering for interactive map rendering.
//!
//! Given a set of geographic points, clustio precomputes, for every integer
//! zoom level in a configured range, the clusters and standalone points
//! visible at that zoom. Viewport queries return what to draw; drill-down
//! queries expand a cluster into its children or its original points.
//!
//! Two engines share the algorithmic core: [`ClusterIndex`] loads once and
//! serves read-only queries from packed KD-tree layers, while
//! [`DynamicClusterIndex`] also supports `add`/`remove` and maintains its
//! R-tree layers incrementally.
//!
//! ```rust
//! use clustio::ClusterBuilder;
//!
//! struct City { name: &'static str, lng: f64, lat: f64 }
//!
//! let mut index = ClusterBuilder::new()
//!     .get_x(|c: &City| c.lng)
//!     .get_y(|c: &City| c.lat)
//!     .build_static()?;
//!
//! index.load(vec![
//!     City { name: "Poitiers", lng: 0.34, lat: 46.58 },
//!     City { name: "Tours", lng: 0.69, lat: 47.39 },
//!     City { name: "Zagreb", lng: 15.98, lat: 45.81 },
//! ])?;
//!
//! for entry in index.search(-5.0, 40.0, 20.0, 50.0, 4)? {
//!     if let Some(cluster) = entry.as_cluster() {
//!         println!("cluster of {} at {:?}", cluster.count, cluster.position);
//!     }
//! }
//! # Ok::<(), clustio::ClustioError>(())
//! ```

pub mod aggregate;
pub mod builder;
pub mod cluster;
pub mod config;
pub mod dynamic;
pub mod element;
pub mod error;
pub mod projection;

mod kdtree;
mod rtree;

pub use aggregate::{ClusterData, MapReduce};
pub use builder::ClusterBuilder;
pub use cluster::ClusterIndex;
pub use config::ClusterConfig;
pub use dynamic::DynamicClusterIndex;
pub use element::{ClusterEntry, ClusterId, ClusterView, PointView};
pub use error::{ClustioError, Result};
pub use projection::Projection;

pub use geo::Point;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{ClusterBuilder, ClustioError, Result};

    pub use crate::{ClusterIndex, DynamicClusterIndex};

    pub use crate::{ClusterConfig, Projection};

    pub use crate::{ClusterData, ClusterEntry, ClusterId};

    pub use geo::Point;
}
