pub mod sample;

pub use sample::{LocationSample, PositionFix, StoredSample, ValidationError};
