pub mod in_memory;
pub mod sqlite_policy_store;

pub use in_memory::InMemoryPolicyStore;
pub use sqlite_policy_store::SqlitePolicyStore;
