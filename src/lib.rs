pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod hungarian;
pub mod index;
pub mod kalman;
pub mod pipeline;
pub mod track;
pub mod tracker;

// Re-export main types
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::index::ivf_flat::IndexIvfFlat;
pub use crate::index::ivf_int8::IndexInt8IvfFlat;
pub use crate::index::ivf_pq::IndexIvfPq;
pub use crate::index::{IdSelector, Metric, VectorIndex};
pub use crate::track::{BoundingBox, DetectInfo, Detection, TraceLet};
pub use crate::tracker::{MatchMetric, MotConnection, TrackedObject, TrackerConfig};
