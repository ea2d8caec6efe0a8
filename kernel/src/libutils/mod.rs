//! Reusable helpers

pub mod vptr;

pub use vptr::ResizableArray;
