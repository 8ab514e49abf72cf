//! Host and node process samplers run by the collector on every tick.
//!
//! Samplers read procfs/sysfs synchronously; the collector runs them on the
//! blocking thread pool.
mod error;
pub mod logtail;
pub mod netclass;
pub mod netdev;
pub mod process;

pub use error::{Error, Result};
pub use logtail::LogEventSampler;
pub use netclass::NetClassSampler;
pub use netdev::NetDevSampler;
pub use process::ProcessSampler;

use crate::node::NodeIdentity;
use crate::sample::Sample;

/// Produces samples from the current state of the host or the node process.
pub trait Sampler: Send {
    fn name(&self) -> &str;

    /// Appends this round's samples to `out`. `identity` is `None` while no
    /// node is discovered; node specific samplers then produce nothing.
    fn sample(&mut self, identity: Option<&NodeIdentity>, out: &mut Vec<Sample>) -> Result<()>;
}
