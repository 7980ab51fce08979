pub mod render;
pub mod template;

pub use render::*;
pub use template::*;
