pub mod in_memory;
pub mod sqlite_case_store;

pub use in_memory::InMemoryCaseStore;
pub use sqlite_case_store::SqliteCaseStore;
