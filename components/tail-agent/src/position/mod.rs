pub mod async_file_store;
pub mod cached_store;
pub mod error;
pub mod file_store;
pub mod models;
pub mod sqlite_store;
pub mod store;
pub mod tracker;
