// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "cases/mod.rs"]
pub mod cases;

#[path = "confirmation/mod.rs"]
pub mod confirmation;

#[path = "enforcement/mod.rs"]
pub mod enforcement;

#[path = "moderation/mod.rs"]
pub mod moderation;

#[path = "policy/mod.rs"]
pub mod policy;

#[path = "raid/mod.rs"]
pub mod raid;

#[path = "rate_limit/mod.rs"]
pub mod rate_limit;

#[path = "verification/mod.rs"]
pub mod verification;
