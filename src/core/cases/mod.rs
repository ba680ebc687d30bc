// Case ledger - cases, appeals and the store port they are persisted through.

pub mod case_ledger;
pub mod case_models;

pub use case_ledger::*;
pub use case_models::*;
