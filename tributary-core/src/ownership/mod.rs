mod errors;
pub use errors::{Result, StoreError};

mod store;
pub use store::{Checkpoint, OwnershipStore, PartitionOwnership};

mod memory_store;
pub use memory_store::MemoryOwnershipStore;
