//! Data models for the coordination engine

mod capability;
mod room;

pub use capability::*;
pub use room::*;
