pub mod datum;
pub mod interval;
pub mod local_storage;
pub mod persistence;
pub mod write_queue;

pub use datum::{Datum, DeleteResult, WriteResult};
pub use interval::IntervalTask;
pub use local_storage::LocalStorage;
pub use persistence::Persistence;
pub use write_queue::WriteQueue;
