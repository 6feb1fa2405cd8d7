pub mod batch;
pub mod config;
pub mod data;
pub mod distributor;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod topology;
pub mod workload;

pub use batch::{Batch, BatchShape, RawBatch};
pub use config::WorkloadConfig;
pub use distributor::{BatchDistributor, Role};
pub use error::{Result, WorkloadErr};
pub use metrics::EvalMetrics;
pub use topology::{ExecutionMode, Topology};
pub use workload::{AuxState, ForwardOutput, ForwardPassMode, MnistWorkload, Params, Split};
