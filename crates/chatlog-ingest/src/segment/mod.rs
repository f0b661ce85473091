//! Date-bounded segmentation of imported conversations.

pub mod segmenter;

pub use segmenter::{plan, BucketFailure, SegmentOutcome, SegmentPlan, ThreadSegmenter};
