pub mod raid_detector;

pub use raid_detector::*;
