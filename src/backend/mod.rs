// Abstract collaborators consumed by the orchestration core. Cloud-specific
// queue/store mechanics live behind these traits; the in-memory variants back
// the test suite and single-process runs.

pub mod kv;
pub mod object_store;
pub mod queue;

pub use kv::{KeyValueBackend, MemoryKvStore};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, StoredObject};
pub use queue::{AmqpQueue, MemoryQueue, QueueDelivery, QueueTier, TaskQueue};
