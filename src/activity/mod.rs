pub mod ingress;
pub mod normalizer;
pub mod poll;
pub mod stream;

pub use ingress::DedupGate;
pub use stream::{StreamMetrics, StreamStatus};
