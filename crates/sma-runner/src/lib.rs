pub mod agent;
pub mod collect;
pub mod config;
pub mod convert;
pub mod error;
pub mod session;
pub mod trigger;
pub mod workspace;

pub use agent::*;
pub use collect::*;
pub use config::*;
pub use convert::*;
pub use error::*;
pub use session::*;
pub use trigger::*;
pub use workspace::*;
