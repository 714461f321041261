//! Small shared helpers.

mod http;
mod latch;

pub use http::serve_file;
pub use latch::Latch;
