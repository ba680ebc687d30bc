// Enforcement - the platform port and the executor applying actions through it.

pub mod action_executor;
pub mod platform;

#[cfg(test)]
pub mod mock_platform;

pub use action_executor::*;
pub use platform::*;
