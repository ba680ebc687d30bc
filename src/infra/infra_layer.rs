// The infra module contains implementations of core traits.
// Each feature implementation goes in its own submodule.

#[path = "ai/mod.rs"]
pub mod ai;

#[path = "cases/mod.rs"]
pub mod cases;

#[path = "policy/mod.rs"]
pub mod policy;
