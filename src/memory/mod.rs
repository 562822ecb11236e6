//! Shared memory segments: configuration, header, mapping and registry

pub mod config;
pub mod header;
pub mod manager;
pub mod segment;

pub use config::{BackingType, OpenMode, SegmentConfig};
pub use header::{SegmentHeader, LAYOUT_VERSION, ROOT_SLOTS, SEGMENT_MAGIC};
pub use manager::SegmentManager;
pub use segment::{Segment, SegmentLayout, SegmentStats};
