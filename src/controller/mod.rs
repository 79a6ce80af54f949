pub mod bootstrap;
pub mod context;
pub mod error;
pub mod failover;
pub mod fencing;
pub mod hibernation;
pub mod instance_set;
pub mod instance_status;
pub mod observed;
pub mod operations;
pub mod reconciler;
pub mod rolling_update;
pub mod safety_net;
pub mod slots;
pub mod state_machine;
pub mod status;

pub use context::Context;
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use reconciler::{error_policy, reconcile};
pub use state_machine::{ClusterEvent, ClusterStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusManager};
