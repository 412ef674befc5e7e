mod result;
pub mod source;

pub use result::{BBox, Detection, DetectionClass, PpeItem, Roi};
pub use source::{DetectionSource, FrameInput, ReplayConfig, ReplaySource, ReplayStats};
