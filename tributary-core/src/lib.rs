pub mod clock;
pub mod event;
pub mod ownership;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{EventData, EventPosition};
pub use ownership::{
    Checkpoint, MemoryOwnershipStore, OwnershipStore, PartitionOwnership, Result, StoreError,
};
