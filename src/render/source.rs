//! The seam to tile data: `RenderSource` snapshots, per-tile buckets and
//! the minimal feature index rendered-feature queries run against.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc, sync::Arc};

use downcast_rs::{impl_downcast, Downcast};

use crate::{coords::OverscaledTileId, render::render_pass::RenderPasses, util::SimpleIdentity};

/// Axis-aligned bounds in tile units (0..EXTENT).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TileUnitBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl TileUnitBounds {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// One indexed feature inside a bucket, enough to answer "which features
/// are at this point" without the full geometry.
#[derive(Copy, Clone, Debug)]
pub struct FeatureIndexEntry {
    pub feature_id: u64,
    pub bounds: TileUnitBounds,
    pub sort_key: f32,
}

/// Raw geometry payload shared by the 2D bucket kinds.
#[derive(Clone, Debug, Default)]
pub struct GeometryData {
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
}

impl GeometryData {
    /// The static tile quad: four `i16` corner vertices spanning
    /// `[0, EXTENT]` and the two triangles covering them, 16-bit indices.
    /// Raster and background drawables draw this instead of per-feature
    /// geometry.
    pub fn tile_quad() -> Self {
        let extent = crate::coords::EXTENT_UINT as i16;
        let vertices: [[i16; 2]; 4] = [[0, 0], [extent, 0], [0, extent], [extent, extent]];
        let indices: [u16; 6] = [0, 1, 2, 1, 2, 3];
        Self {
            vertices: bytemuck::cast_slice(&vertices).to_vec(),
            indices: bytemuck::cast_slice(&indices).to_vec(),
        }
    }
}

/// The per-kind payload of a bucket. One pipeline dispatches on this tag
/// instead of one generic layout per layer type.
#[derive(Clone, Debug)]
pub enum BucketData {
    Fill(GeometryData),
    Line(GeometryData),
    Symbol(GeometryData),
    Raster {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    },
    FillExtrusion(GeometryData),
}

/// How a bucket orders its feature index on insertion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeatureOrder {
    /// Insertion order, as features appear in the tile.
    ByFeature,
    /// Ascending by the evaluated sort key (symbol layers).
    BySortKey,
}

/// The immutable per-tile, per-layer geometry produced by the layout stage.
/// Workers build buckets and hand them to the render thread; drawables
/// reference them by `id` only.
#[derive(Clone, Debug)]
pub struct Bucket {
    pub id: SimpleIdentity,
    pub data: BucketData,
    pub passes: RenderPasses,
    features: Vec<FeatureIndexEntry>,
}

impl Bucket {
    pub fn new(data: BucketData, passes: RenderPasses) -> Self {
        Self {
            id: SimpleIdentity::unique(),
            data,
            passes,
            features: Vec::new(),
        }
    }

    pub fn with_features(
        data: BucketData,
        passes: RenderPasses,
        mut features: Vec<FeatureIndexEntry>,
        order: FeatureOrder,
    ) -> Self {
        if order == FeatureOrder::BySortKey {
            features.sort_by(|a, b| a.sort_key.total_cmp(&b.sort_key));
        }
        Self {
            id: SimpleIdentity::unique(),
            data,
            passes,
            features,
        }
    }

    pub fn features(&self) -> &[FeatureIndexEntry] {
        &self.features
    }

    pub fn query(&self, x: f64, y: f64) -> impl Iterator<Item = &FeatureIndexEntry> {
        self.features.iter().filter(move |f| f.bounds.contains(x, y))
    }
}

/// One visible tile with its per-layer buckets.
#[derive(Clone, Debug)]
pub struct RenderTile {
    pub id: OverscaledTileId,
    buckets: BTreeMap<String, Arc<Bucket>>,
}

impl RenderTile {
    pub fn new(id: OverscaledTileId) -> Self {
        Self {
            id,
            buckets: BTreeMap::new(),
        }
    }

    pub fn set_bucket(&mut self, layer_id: impl Into<String>, bucket: Arc<Bucket>) {
        self.buckets.insert(layer_id.into(), bucket);
    }

    pub fn bucket_for_layer(&self, layer_id: &str) -> Option<&Arc<Bucket>> {
        self.buckets.get(layer_id)
    }
}

/// The contract a tile source fulfils towards the render layers: a snapshot
/// of the currently visible tiles, gated by `is_enabled`.
pub trait RenderSource: Downcast {
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn render_tiles(&self) -> Vec<Rc<RenderTile>>;
}

impl_downcast!(RenderSource);

/// An in-memory source. The production tile pipeline lives outside this
/// crate; this implementation backs the orchestrator until one is attached
/// and carries the whole test suite.
pub struct MemoryRenderSource {
    name: String,
    enabled: bool,
    tiles: RefCell<Vec<Rc<RenderTile>>>,
}

impl MemoryRenderSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            tiles: RefCell::new(Vec::new()),
        }
    }

    pub fn set_enabled(&mut self, value: bool) {
        self.enabled = value;
    }

    pub fn set_tiles(&self, tiles: Vec<Rc<RenderTile>>) {
        *self.tiles.borrow_mut() = tiles;
    }
}

impl RenderSource for MemoryRenderSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn render_tiles(&self) -> Vec<Rc<RenderTile>> {
        self.tiles.borrow().clone()
    }
}
