//! Render-pass tags and the per-layer pass bitmask.

use std::fmt;

bitflags::bitflags! {
    /// The set of render passes a layer or bucket participates in.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct RenderPasses: u8 {
        const OPAQUE = 1 << 0;
        const TRANSLUCENT = 1 << 1;
        /// Extrusion rendering. Uses its own depth/stencil regime and is
        /// always drawn inside the translucent phase.
        const PASS_3D = 1 << 2;
    }
}

/// One rendering phase. Drawables are registered and drawn under exactly one
/// pass; the frame walks the passes in this order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RenderPass {
    Opaque,
    Translucent,
}

impl RenderPass {
    pub fn flag(&self) -> RenderPasses {
        match self {
            RenderPass::Opaque => RenderPasses::OPAQUE,
            RenderPass::Translucent => RenderPasses::TRANSLUCENT,
        }
    }
}

impl fmt::Display for RenderPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderPass::Opaque => write!(f, "opaque"),
            RenderPass::Translucent => write!(f, "translucent"),
        }
    }
}
