//! Per-point coloring brushes and their factory.
//!
//! A brush computes one color channel of a tile's output buffer. Its
//! lifecycle against a tile is prepare → color → unprepare; between prepare
//! and unprepare the brush carries per-tile state (histogram ranges, field
//! offsets) that also crosses the worker boundary in serialized form.

use std::fmt;
use std::sync::Arc;

use point_protocol::{BufferStats, GeoTransform, RenderSpaceBounds, Schema, TreePath};
use serde_json::Value;

pub mod color;
pub mod factory;
pub mod field_color;
pub mod imagery;
pub mod ramp;
pub mod uri;

pub use color::ColorBrush;
pub use factory::{
    BrushConstructor, BrushCreateError, BrushRegistry, BrushRestoreError, BrushSlotTransfers,
    BrushTransferError, SerializedBrush, SlotTransfer, begin_transfer_for_brushes,
    deserialize_brushes, end_transfer_onto_brushes, serialize_brush, serialize_brushes,
    take_brushes_from_transfers,
};
pub use field_color::FieldColorBrush;
pub use imagery::{ImageryBrush, ImageryTexture, ImageryTextureError};
pub use ramp::RampBrush;
pub use uri::{BrushUri, BrushUriParseError, HexColorParseError, parse_hex_color};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    MainToWorker,
    WorkerToMain,
}

/// Cross-thread packaging of one brush: a value copy of its state plus the
/// backing storages that move (not copy) with it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrushTransfer {
    pub params: Value,
    pub buffers: Vec<Arc<Vec<u8>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelectionStrategy {
    None,
    Ancestors,
    All,
}

/// Which other cached tiles an insert under this brush may invalidate.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSelection {
    pub strategy: NodeSelectionStrategy,
    pub params: Value,
}

impl NodeSelection {
    pub fn none() -> Self {
        Self {
            strategy: NodeSelectionStrategy::None,
            params: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampSelector {
    None,
    ZRange,
    IntensityRange,
}

/// Which GPU color-ramp uniform this brush contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampConfiguration {
    pub selector: RampSelector,
    pub start: [u8; 3],
    pub end: [u8; 3],
}

impl RampConfiguration {
    pub fn none() -> Self {
        Self {
            selector: RampSelector::None,
            start: [0, 0, 0],
            end: [255, 255, 255],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrushError {
    SchemaMismatch { field: String },
    MalformedPayload,
    MissingTransferBuffer,
}

impl fmt::Display for BrushError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrushError::SchemaMismatch { field } => {
                write!(formatter, "required schema field '{field}' is missing")
            }
            BrushError::MalformedPayload => write!(formatter, "brush payload is malformed"),
            BrushError::MissingTransferBuffer => {
                write!(formatter, "brush transfer is missing a backing buffer")
            }
        }
    }
}

impl std::error::Error for BrushError {}

/// Inputs a brush prepares against: the tile's own layout and stats plus a
/// snapshot of the pipeline-wide aggregate taken after this tile was merged
/// into it.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferParams {
    pub tree_path: TreePath,
    pub total_points: u32,
    pub schema: Schema,
    pub render_space_bounds: RenderSpaceBounds,
    pub tile_stats: BufferStats,
    pub point_cloud_stats: BufferStats,
    pub geo_transform: GeoTransform,
}

pub trait Brush: Send {
    fn uri(&self) -> &BrushUri;

    /// Field names this brush needs in the tile schema to be usable.
    fn required_schema_fields(&self) -> Vec<String>;

    /// Value snapshot of configuration and prepared state.
    /// Must round-trip through `deserialize`.
    fn serialize(&self) -> Value;

    fn deserialize(&mut self, payload: &Value) -> Result<(), BrushError>;

    /// Package this brush for a thread hop. Stock brushes carry no backing
    /// storages; brushes that do must override both transfer hooks.
    fn begin_transfer(&mut self, _direction: TransferDirection) -> BrushTransfer {
        BrushTransfer {
            params: self.serialize(),
            buffers: Vec::new(),
        }
    }

    fn end_transfer(
        &mut self,
        _direction: TransferDirection,
        transfer: BrushTransfer,
    ) -> Result<(), BrushError> {
        self.deserialize(&transfer.params)
    }

    /// Compute per-tile coloring parameters. An unsuitable stats range puts
    /// the brush into a quiescent no-color mode rather than failing; a
    /// missing required schema field is an error and the caller skips the
    /// slot for this tile only. Paired with `unprepare`.
    fn prepare(
        &mut self,
        params: &BufferParams,
        parent_staging: Option<&Value>,
        children_staging: &[Value],
    ) -> Result<(), BrushError>;

    /// Equality-comparable snapshot of the prepare-computed state, retained
    /// on the tile so `buffer_needs_recolor` can later detect drift.
    fn staging_attributes(&self) -> Value;

    fn node_selection_strategy(&self) -> NodeSelection;

    fn buffer_needs_recolor(&self, strategy_params: &Value, other_staging: &Value) -> bool;

    /// Write the RGB triple for a single decoded point.
    fn color_point(&self, color: &mut [u8; 3], point: &[f32]);

    fn unprepare(&mut self);

    fn ramp_configuration(&self) -> RampConfiguration;
}

impl fmt::Debug for dyn Brush + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Brush").field("uri", self.uri()).finish()
    }
}
