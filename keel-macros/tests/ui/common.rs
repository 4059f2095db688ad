// Re-exported at the root of each UI test so that `::keel::...` paths in the
// generated code resolve without depending on the facade crate.
pub use keel_core::{event, unique};
