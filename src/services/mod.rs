pub mod codec;
pub mod collaborators;
pub mod content_index;
pub mod health;
pub mod lifecycle;
pub mod metadata_store;
pub mod storage_manager;
