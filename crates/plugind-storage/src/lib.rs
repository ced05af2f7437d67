//! Object storage boundary and the per-plugin persistence bucket that sits
//! on top of it with quota enforcement.

mod bucket;
mod object_store;

pub use bucket::PersistenceBucket;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
