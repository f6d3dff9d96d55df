//! Processing engine: worker threads, the merger and the shared state they run on.

pub mod batch_manager;
pub mod cache_manager;
pub mod instance;
pub mod merger;
pub mod processor;

pub use batch_manager::{BatchManager, TaskId};
pub use cache_manager::{CacheKey, CacheManager, ThetaMatrix};
pub use instance::{Instance, InstanceContext};
pub use merger::{Merger, ModelIncrement, SyncRequest};
pub use processor::{NwtTarget, Processor, ProcessorInput};
