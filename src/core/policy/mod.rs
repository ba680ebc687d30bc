// Per-guild policy: section models, validation, compiled snapshots and the
// store port.

pub mod compiled_policy;
pub mod policy_models;
pub mod policy_service;

pub use compiled_policy::*;
pub use policy_models::*;
pub use policy_service::*;
