// Core modules implementing the segmented ring, append path, and cursor reads.
pub mod cursor;
pub mod error;
pub mod fragment;
pub mod ring;
