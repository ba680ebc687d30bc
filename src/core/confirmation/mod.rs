pub mod confirmation_coordinator;

pub use confirmation_coordinator::*;
