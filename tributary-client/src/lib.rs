//! Tributary-Client
//!
//! Tributary-Client -- resilient receive links and cooperative partition
//! load balancing for event hub consumer groups

pub mod errors;
pub use errors::{ClientError, ErrorCondition};

mod client_metrics;

mod retry_policy;
pub use retry_policy::{
    retry_policy, ExponentialRetryPolicy, FixedRetryPolicy, RetryMode, RetryOptions, RetryPolicy,
};

mod endpoint;
pub use endpoint::{Endpoint, EndpointState, EndpointStateTracker, ShutdownSignal};

mod resource_processor;
pub use resource_processor::{CloseBehavior, ResourceProcessor, ResourceStream};

mod receive_link;
pub use receive_link::{EmptyCreditListener, ReceiveLink, ReceiveLinkFactory};

mod credit_flow_processor;
pub use credit_flow_processor::{CreditFlowProcessor, ReceiveStream};

mod event_handler;
pub use event_handler::{
    CloseContext, CloseReason, ErrorContext, EventContext, EventHandler, InitializationContext,
    PartitionContext,
};

mod options;
pub use options::{LoadBalancingStrategy, ProcessorOptions};

mod pump_manager;
pub use pump_manager::PartitionPumpManager;

mod load_balancer;
pub use load_balancer::{PartitionLoadBalancer, PartitionSource, PassSummary};

mod event_processor;
pub use event_processor::{EventProcessor, EventProcessorBuilder, DEFAULT_CONSUMER_GROUP};

pub mod in_memory;

pub use tributary_core::{
    Checkpoint, Clock, EventData, EventPosition, ManualClock, MemoryOwnershipStore,
    OwnershipStore, PartitionOwnership, StoreError, SystemClock,
};
