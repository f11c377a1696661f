// Storage and fixture data
pub mod row_store;
pub mod fixture;
pub mod loader;

pub use row_store::{RowStore, Snapshot, StoredRow};
