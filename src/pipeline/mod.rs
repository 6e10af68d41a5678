pub mod relay;
pub mod viewers;

pub use relay::FrameRelay;
pub use viewers::{StreamState, ViewerGuard, ViewerLifecycle, ViewerToken};
