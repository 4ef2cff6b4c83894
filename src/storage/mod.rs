/// The registry-keeping manager of named storages.
pub mod manager;
/// Typed key-value access to one named storage.
pub mod node_storage;

pub use manager::NodeStorageManager;
pub use node_storage::NodeStorage;
