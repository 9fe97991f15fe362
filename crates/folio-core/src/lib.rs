mod core;
mod html;
mod ops;
mod plugin;
pub mod position;

pub use crate::core::*;
pub use crate::html::*;
pub use crate::ops::*;
pub use crate::plugin::*;
