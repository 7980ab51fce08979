pub mod codec;
pub mod discover;
pub mod manifest;
pub mod persist;

pub use codec::*;
pub use discover::*;
pub use manifest::*;
pub use persist::*;
