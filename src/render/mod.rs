//! This module implements the render orchestration of maprender. It turns a
//! style's layer list plus the set of visible tiles into an ordered sequence
//! of backend-agnostic draw units and issues them through the
//! [`GraphicsContext`](graphics::GraphicsContext) seam.

pub mod drawable;
pub mod graphics;
pub mod layer_group;
pub mod orchestrator;
pub mod paint_parameters;
pub mod render_layer;
pub mod render_pass;
pub mod source;

pub use render_pass::{RenderPass, RenderPasses};
