pub mod error;
pub mod ids;
pub mod merge;
pub mod run;
pub mod types;
pub mod value;

pub use error::*;
pub use ids::*;
pub use merge::*;
pub use run::*;
pub use types::*;
pub use value::*;
