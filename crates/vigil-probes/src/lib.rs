//! Concrete collaborators that observe the local host.

pub mod network;
pub mod process;
pub mod system;

pub use network::HttpNetworkProbe;
pub use process::PsProcessSampler;
pub use system::ProcMetricsProvider;
