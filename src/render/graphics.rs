//! The flat backend capability seam.
//!
//! Every GPU backend implements [`GraphicsContext`] once; the shared
//! orchestration code (stencil bookkeeping, layer-group indexing, drawable
//! lifecycle) never branches on the backend and calls through this trait
//! only for the operations a GPU API must actually perform. Resources are
//! identified by opaque handles rather than backend object pointers so the
//! shared layer can store and compare them freely.

use std::cell::Cell;

use crate::{coords::UnwrappedTileId, util::SimpleIdentity};

/// Backends with fewer vertex-attribute bindings than this cannot run the
/// engine at all.
pub const MIN_REQUIRED_VERTEX_BINDINGS: u32 = 8;

macro_rules! define_handle {
    ($name:ident) => {
        /// Opaque backend resource handle.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub SimpleIdentity);
    };
}

define_handle!(BufferHandle);
define_handle!(UniformBufferHandle);
define_handle!(TextureHandle);
define_handle!(ShaderHandle);
define_handle!(RenderTargetHandle);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DepthFunction {
    Always,
    Less,
    LessEqual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DepthMask {
    ReadOnly,
    ReadWrite,
}

/// Depth test state for one draw call. `range` maps the drawable's depth
/// values into a sub-interval of the depth buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DepthMode {
    pub func: DepthFunction,
    pub mask: DepthMask,
    pub range: (f32, f32),
}

impl DepthMode {
    pub fn disabled() -> Self {
        Self {
            func: DepthFunction::Always,
            mask: DepthMask::ReadOnly,
            range: (0.0, 1.0),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StencilTest {
    Always,
    Equal { mask: u32 },
    NotEqual { mask: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Replace,
    Zero,
}

/// Stencil state for one draw call.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StencilMode {
    pub test: StencilTest,
    pub reference: i32,
    pub write_mask: u32,
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
}

impl StencilMode {
    pub fn disabled() -> Self {
        Self {
            test: StencilTest::Always,
            reference: 0,
            write_mask: 0,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Keep,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColorMode {
    Unblended,
    AlphaBlended,
}

/// The fixed-function state a backend must apply before a draw.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DrawState {
    pub depth: DepthMode,
    pub stencil: StencilMode,
    pub color: ColorMode,
}

/// One indexed draw over a segment of a drawable's buffers.
#[derive(Copy, Clone, Debug)]
pub struct DrawCall {
    pub shader: ShaderHandle,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_offset: u32,
    pub index_count: u32,
    pub uniforms: Option<UniformBufferHandle>,
    pub texture: Option<TextureHandle>,
}

/// The capability interface one GPU backend implements.
///
/// All methods take `&self`; backends that need interior mutability own it
/// themselves. The context is only ever used from the render thread.
pub trait GraphicsContext {
    fn create_vertex_buffer(&self, contents: &[u8]) -> BufferHandle;
    fn create_index_buffer(&self, contents: &[u8]) -> BufferHandle;
    fn create_uniform_buffer(&self, contents: &[u8]) -> UniformBufferHandle;
    fn update_uniform_buffer(&self, handle: UniformBufferHandle, contents: &[u8]);
    fn create_texture_2d(&self, width: u32, height: u32, pixels: &[u8]) -> TextureHandle;
    fn create_render_target(&self, width: u32, height: u32) -> RenderTargetHandle;

    /// Resolves a named shader program, compiling it on first use.
    fn get_shader(&self, name: &str) -> ShaderHandle;

    /// Binds the per-frame global uniform data shared by every drawable.
    fn bind_global_uniforms(&self, contents: &[u8]);
    fn unbind_global_uniforms(&self);

    /// Stamps `stencil_id` into the stencil buffer over the screen-space
    /// footprint of `tile_id`.
    fn stamp_clip_mask(&self, tile_id: UnwrappedTileId, stencil_id: i32);
    fn clear_stencil_buffer(&self);

    fn draw(&self, state: &DrawState, call: &DrawCall);

    /// Hardware limit on vertex-attribute bindings per draw.
    fn max_vertex_attribute_bindings(&self) -> u32;
}

/// A context that records call counts and hands out fresh handles without
/// touching any GPU. Used by tests.
#[derive(Default)]
pub struct NopContext {
    pub stamped_masks: Cell<usize>,
    pub stencil_clears: Cell<usize>,
    pub draw_calls: Cell<usize>,
    pub global_binds: Cell<usize>,
    pub vertex_bindings: Cell<u32>,
    /// Fixed-function state of the most recent draw.
    pub last_draw_state: Cell<Option<DrawState>>,
}

impl NopContext {
    pub fn new() -> Self {
        Self {
            vertex_bindings: Cell::new(16),
            ..Default::default()
        }
    }

    pub fn with_vertex_bindings(limit: u32) -> Self {
        let context = Self::new();
        context.vertex_bindings.set(limit);
        context
    }
}

impl GraphicsContext for NopContext {
    fn create_vertex_buffer(&self, _contents: &[u8]) -> BufferHandle {
        BufferHandle(SimpleIdentity::unique())
    }

    fn create_index_buffer(&self, _contents: &[u8]) -> BufferHandle {
        BufferHandle(SimpleIdentity::unique())
    }

    fn create_uniform_buffer(&self, _contents: &[u8]) -> UniformBufferHandle {
        UniformBufferHandle(SimpleIdentity::unique())
    }

    fn update_uniform_buffer(&self, _handle: UniformBufferHandle, _contents: &[u8]) {}

    fn create_texture_2d(&self, _width: u32, _height: u32, _pixels: &[u8]) -> TextureHandle {
        TextureHandle(SimpleIdentity::unique())
    }

    fn create_render_target(&self, _width: u32, _height: u32) -> RenderTargetHandle {
        RenderTargetHandle(SimpleIdentity::unique())
    }

    fn get_shader(&self, _name: &str) -> ShaderHandle {
        ShaderHandle(SimpleIdentity::unique())
    }

    fn bind_global_uniforms(&self, _contents: &[u8]) {
        self.global_binds.set(self.global_binds.get() + 1);
    }

    fn unbind_global_uniforms(&self) {}

    fn stamp_clip_mask(&self, _tile_id: UnwrappedTileId, _stencil_id: i32) {
        self.stamped_masks.set(self.stamped_masks.get() + 1);
    }

    fn clear_stencil_buffer(&self) {
        self.stencil_clears.set(self.stencil_clears.get() + 1);
    }

    fn draw(&self, state: &DrawState, _call: &DrawCall) {
        self.draw_calls.set(self.draw_calls.get() + 1);
        self.last_draw_state.set(Some(*state));
    }

    fn max_vertex_attribute_bindings(&self) -> u32 {
        self.vertex_bindings.get()
    }
}
