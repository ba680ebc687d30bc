pub mod rate_window;

pub use rate_window::*;
