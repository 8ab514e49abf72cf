//! Chain Telemetry: a host agent that finds a blockchain node process and
//! streams process, network and log samples about it.
//!
//! The node is discovered through Docker, containerd or systemd, identified
//! by a per chain adapter and guarded by a persisted fingerprint so that a
//! swapped node is noticed. Samples flow from timer driven samplers through a
//! shared stream to every registered sink.
pub mod agent;
pub mod collector;
pub mod config;
pub mod container;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod host;
pub mod node;
pub mod sample;
pub mod sampler;
pub mod stream;
pub mod watch;

pub use agent::run;
