//! # maprender
//!
//! The backend-agnostic render-orchestration core of a tiled vector-map
//! engine: tile-identity algebra, a tag-scoped task scheduler, and the
//! layer-group/drawable model that turns a style's layer list plus the
//! visible tile set into GPU draw calls behind a single
//! [`GraphicsContext`](render::graphics::GraphicsContext) seam.
//!
//! Style parsing, tessellation, resource loading and the concrete GPU
//! backends live outside this crate; they meet it at the traits in
//! [`render::graphics`] and [`render::source`].

pub mod coords;
pub mod render;
pub mod scheduler;
pub mod style;
pub mod util;
