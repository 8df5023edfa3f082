use std::sync::Arc;

use crate::assembler::ChunkAssembler;
use crate::store::ChunkStore;

/// shared application state
pub struct AppState {
    /// protocol service in front of the chunk store
    pub assembler: ChunkAssembler,
}

impl AppState {
    /// create a new app state over the given store
    pub fn new(store: Arc<dyn ChunkStore>, verify_chunk_hash: bool) -> Self {
        Self {
            assembler: ChunkAssembler::new(store, verify_chunk_hash),
        }
    }
}
