//! Custom Resource Definitions for the NetIP operator

mod pool;
mod types;

pub use pool::{NetIPAllocation, NetIPAllocationSpec};
pub use types::{
    CloudProviderKind, CloudSpec, DeploymentRef, RolloutStrategy, WorkloadKind, WorkloadRef,
};
