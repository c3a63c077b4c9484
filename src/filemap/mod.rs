mod document;
mod loader;

pub use document::*;
pub use loader::*;
