//! Core of the multi-protocol IoT load generator: a concurrent metrics
//! store, per-device workers, the dispatcher that starts them, a periodic
//! sampler and the report/SLO generator.

pub mod burst;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod errors;
pub mod interval;
pub mod metrics;
pub mod payload;
pub mod percentile;
pub mod protocol;
pub mod report;
pub mod run;
pub mod sampler;
pub mod slo;
pub mod transport;
pub mod worker;

pub use burst::*;
pub use config::*;
pub use device::*;
pub use dispatcher::*;
pub use errors::*;
pub use interval::*;
pub use metrics::*;
pub use payload::*;
pub use percentile::*;
pub use protocol::*;
pub use report::*;
pub use run::*;
pub use sampler::*;
pub use slo::*;
pub use transport::*;
pub use worker::*;
