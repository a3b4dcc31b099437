use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Number of pending graph nodes that forces an eager flush.
pub const MAX_PENDING_NODES: usize = 120;

/// Upper bound of identities covered by a single sub-request.
pub const MAX_KEYS_PER_REQUEST: usize = 40;

/// Default capacity of the confirmed-member set of a collection state.
pub const COLLECTION_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub max_pending_nodes: usize,
    pub max_keys_per_request: usize,
    pub collection_cache_capacity: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_pending_nodes: MAX_PENDING_NODES,
            max_keys_per_request: MAX_KEYS_PER_REQUEST,
            collection_cache_capacity: COLLECTION_CACHE_CAPACITY,
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_pending_nodes == 0 {
            return Err(Error::InvalidArgument(
                "max_pending_nodes must be positive".to_string(),
            ));
        }
        if self.max_keys_per_request == 0 {
            return Err(Error::InvalidArgument(
                "max_keys_per_request must be positive".to_string(),
            ));
        }
        if self.collection_cache_capacity == 0 {
            return Err(Error::InvalidArgument(
                "collection_cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
