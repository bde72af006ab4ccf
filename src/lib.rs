pub mod cli;
pub mod detection;
pub mod geometry;
pub mod transform;

pub use cli::Cli;
pub use detection::{Layout, MarkerKind, TagDetection, TagDetector};
pub use geometry::{rotation_about_center, transform_point, Quadrilateral};
pub use transform::{normalize_image, normalize_markers, rotate_quarter};
