mod error;
mod segment;

pub use error::SegmentError;
pub use segment::{HEADER_SIZE, Segment};
