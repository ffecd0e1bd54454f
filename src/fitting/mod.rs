//! Per-frame geometry: body metrics, garment warp, face protection and blending.

pub mod composite;
pub mod mask;
pub mod metrics;
pub mod warp;

pub use composite::composite;
pub use mask::{FaceCue, MaskParams, protective_mask};
pub use metrics::{BodyKeypoints, BodyMetrics, extract};
pub use warp::{AffineTransform, place, placement_target, warp};
