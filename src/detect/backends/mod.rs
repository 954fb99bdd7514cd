pub mod stub;

pub use stub::{constellation, StubBackend};
