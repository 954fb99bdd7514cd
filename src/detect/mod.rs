mod backend;
mod backends;

pub use backend::TagDetector;
pub use backends::{constellation, StubBackend};
