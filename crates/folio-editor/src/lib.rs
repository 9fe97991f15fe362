mod config;
mod controls;
mod editor;
mod image;
mod layout;
mod node_view;
mod slash;
mod store;
mod tracker;
mod view;

pub mod math;

pub use crate::config::*;
pub use crate::controls::*;
pub use crate::editor::*;
pub use crate::image::*;
pub use crate::layout::*;
pub use crate::node_view::*;
pub use crate::slash::*;
pub use crate::store::*;
pub use crate::tracker::*;
pub use crate::view::*;
