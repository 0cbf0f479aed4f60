use std::path::Path;
use std::sync::Arc;

use crate::core::storage::StorageClient;

mod local;
mod simulated;

pub use local::LocalStorage;
pub use simulated::{SimulatedOp, SimulatedStorage};

/// Storage client for an account rooted at `location`.
pub fn get_client(location: &Path) -> Arc<dyn StorageClient> {
    Arc::new(LocalStorage::new(location))
}
