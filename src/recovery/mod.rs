//! Recovering usable output from truncated agent responses.
//!
//! A response cut off by a length limit is inspected to find what it already
//! delivered ([`detect_truncation_context`]), a continuation request is built
//! for the rest ([`build_continuation_prompt`]), and the two outputs are
//! merged per format ([`merge_outputs`]).

pub mod format;
pub mod incremental;
pub mod merge;
pub mod prompt;
pub mod truncation;

pub use format::{FileEntry, detect_format};
pub use incremental::{IncrementalParser, PartialObject};
pub use merge::merge_outputs;
pub use prompt::build_continuation_prompt;
pub use truncation::{
    ContinuationContext, DiffSection, detect_truncation_context, detect_truncation_context_as,
    split_diff_sections,
};
