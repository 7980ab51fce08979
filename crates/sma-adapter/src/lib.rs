pub mod command;
pub mod contract;
pub mod fixture;
pub mod types;

pub use command::*;
pub use contract::*;
pub use fixture::*;
pub use types::*;
