//! Run execution: the per-run context, its output stream and the legacy snippet path.

mod context;
mod legacy;
mod output;

pub use context::RunContext;
pub use output::OutputStream;
