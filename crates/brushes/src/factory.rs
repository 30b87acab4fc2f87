//! Brush registry and the batch helpers that move whole brush slot vectors
//! across the worker boundary.
//!
//! Slot vectors keep their ordering everywhere: a `None` at slot `i` on one
//! side is a `None` at slot `i` on the other, and color channel `i` of the
//! output buffer always belongs to slot `i`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde_json::Value;

use crate::color::ColorBrush;
use crate::field_color::FieldColorBrush;
use crate::imagery::ImageryBrush;
use crate::ramp::RampBrush;
use crate::uri::{BrushUri, BrushUriParseError};
use crate::{Brush, BrushError, BrushTransfer, TransferDirection};

pub type BrushConstructor = fn(BrushUri) -> Result<Box<dyn Brush>, BrushCreateError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrushCreateError {
    Uri(BrushUriParseError),
    UnknownBrush { uri: String },
    InvalidParameter { key: &'static str },
}

impl fmt::Display for BrushCreateError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrushCreateError::Uri(error) => write!(formatter, "brush uri invalid: {error}"),
            BrushCreateError::UnknownBrush { uri } => {
                write!(formatter, "no brush registered for '{uri}'")
            }
            BrushCreateError::InvalidParameter { key } => {
                write!(formatter, "brush parameter '{key}' is invalid")
            }
        }
    }
}

impl std::error::Error for BrushCreateError {}

impl From<BrushUriParseError> for BrushCreateError {
    fn from(error: BrushUriParseError) -> Self {
        Self::Uri(error)
    }
}

/// Registry of brush constructors keyed by `(scheme, name)`.
///
/// Shared explicitly (behind an `Arc`) between the cache and the worker
/// pool rather than living in process-global state.
#[derive(Debug, Default)]
pub struct BrushRegistry {
    constructors: Mutex<HashMap<(String, String), BrushConstructor>>,
}

impl BrushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stock_brushes() -> Self {
        let registry = Self::new();
        registry.register_brush("local", "color", |uri| Ok(Box::new(ColorBrush::from_uri(uri)?)));
        registry.register_brush("local", "ramp", |uri| Ok(Box::new(RampBrush::from_uri(uri)?)));
        registry.register_brush("local", "field-color", |uri| {
            Ok(Box::new(FieldColorBrush::from_uri(uri)?))
        });
        registry.register_brush("remote", "imagery", |uri| {
            Ok(Box::new(ImageryBrush::from_uri(uri)?))
        });
        registry
    }

    pub fn register_brush(&self, scheme: &str, name: &str, constructor: BrushConstructor) {
        self.constructors
            .lock()
            .expect("brush registry lock poisoned")
            .insert((scheme.to_owned(), name.to_owned()), constructor);
    }

    pub fn deregister_brush(&self, scheme: &str, name: &str) -> bool {
        self.constructors
            .lock()
            .expect("brush registry lock poisoned")
            .remove(&(scheme.to_owned(), name.to_owned()))
            .is_some()
    }

    /// Sorted `scheme://name` prefixes of every registered constructor.
    pub fn available(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .constructors
            .lock()
            .expect("brush registry lock poisoned")
            .keys()
            .map(|(scheme, name)| format!("{scheme}://{name}"))
            .collect();
        prefixes.sort();
        prefixes
    }

    pub fn create_brush(&self, uri_text: &str) -> Result<Box<dyn Brush>, BrushCreateError> {
        let uri = BrushUri::parse(uri_text)?;
        let constructor = self
            .constructors
            .lock()
            .expect("brush registry lock poisoned")
            .get(&(uri.scheme().to_owned(), uri.name().to_owned()))
            .copied()
            .ok_or_else(|| BrushCreateError::UnknownBrush { uri: uri.prefix() })?;
        constructor(uri)
    }
}

/// Value form of a brush: its uri plus the `serialize` payload. This is how
/// brushes rest in the recolor queue and how they ride job messages.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedBrush {
    pub uri: String,
    pub payload: Value,
}

pub fn serialize_brush(brush: &dyn Brush) -> SerializedBrush {
    SerializedBrush {
        uri: brush.uri().as_str().to_owned(),
        payload: brush.serialize(),
    }
}

pub fn serialize_brushes(slots: &[Option<Box<dyn Brush>>]) -> Vec<Option<SerializedBrush>> {
    slots
        .iter()
        .map(|slot| slot.as_deref().map(serialize_brush))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrushRestoreError {
    Create { slot: usize, error: BrushCreateError },
    Payload { slot: usize, error: BrushError },
}

impl fmt::Display for BrushRestoreError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrushRestoreError::Create { slot, error } => {
                write!(formatter, "brush slot {slot} failed to construct: {error}")
            }
            BrushRestoreError::Payload { slot, error } => {
                write!(formatter, "brush slot {slot} failed to restore: {error}")
            }
        }
    }
}

impl std::error::Error for BrushRestoreError {}

pub fn deserialize_brushes(
    registry: &BrushRegistry,
    slots: &[Option<SerializedBrush>],
) -> Result<Vec<Option<Box<dyn Brush>>>, BrushRestoreError> {
    let mut brushes = Vec::with_capacity(slots.len());
    for (slot, serialized) in slots.iter().enumerate() {
        match serialized {
            None => brushes.push(None),
            Some(serialized) => {
                let mut brush = registry
                    .create_brush(&serialized.uri)
                    .map_err(|error| BrushRestoreError::Create { slot, error })?;
                brush
                    .deserialize(&serialized.payload)
                    .map_err(|error| BrushRestoreError::Payload { slot, error })?;
                brushes.push(Some(brush));
            }
        }
    }
    Ok(brushes)
}

/// One brush slot packaged for a thread hop.
#[derive(Debug)]
pub struct SlotTransfer {
    pub uri: String,
    pub transfer: BrushTransfer,
}

/// A whole slot vector packaged for a thread hop, alignment preserved.
#[derive(Debug, Default)]
pub struct BrushSlotTransfers {
    pub slots: Vec<Option<SlotTransfer>>,
}

impl BrushSlotTransfers {
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

pub fn begin_transfer_for_brushes(
    brushes: &mut [Option<Box<dyn Brush>>],
    direction: TransferDirection,
) -> BrushSlotTransfers {
    BrushSlotTransfers {
        slots: brushes
            .iter_mut()
            .map(|slot| {
                slot.as_mut().map(|brush| SlotTransfer {
                    uri: brush.uri().as_str().to_owned(),
                    transfer: brush.begin_transfer(direction),
                })
            })
            .collect(),
    }
}

/// Construct a fresh slot vector from transferred state (the receiving side
/// of a hop, where no live brushes exist yet).
pub fn take_brushes_from_transfers(
    registry: &BrushRegistry,
    transfers: BrushSlotTransfers,
    direction: TransferDirection,
) -> Result<Vec<Option<Box<dyn Brush>>>, BrushRestoreError> {
    let mut brushes = Vec::with_capacity(transfers.slots.len());
    for (slot, transferred) in transfers.slots.into_iter().enumerate() {
        match transferred {
            None => brushes.push(None),
            Some(transferred) => {
                let mut brush = registry
                    .create_brush(&transferred.uri)
                    .map_err(|error| BrushRestoreError::Create { slot, error })?;
                brush
                    .end_transfer(direction, transferred.transfer)
                    .map_err(|error| BrushRestoreError::Payload { slot, error })?;
                brushes.push(Some(brush));
            }
        }
    }
    Ok(brushes)
}

#[derive(Debug, Clone, PartialEq)]
pub enum BrushTransferError {
    SlotCountMismatch,
    SlotAlignmentMismatch { slot: usize },
    Brush { slot: usize, error: BrushError },
}

impl fmt::Display for BrushTransferError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrushTransferError::SlotCountMismatch => {
                write!(formatter, "brush transfer slot count mismatch")
            }
            BrushTransferError::SlotAlignmentMismatch { slot } => {
                write!(formatter, "brush transfer slot {slot} occupancy mismatch")
            }
            BrushTransferError::Brush { slot, error } => {
                write!(formatter, "brush transfer slot {slot} failed: {error}")
            }
        }
    }
}

impl std::error::Error for BrushTransferError {}

/// Adopt transferred state back onto existing live brushes (the returning
/// side of a hop).
pub fn end_transfer_onto_brushes(
    brushes: &mut [Option<Box<dyn Brush>>],
    direction: TransferDirection,
    transfers: BrushSlotTransfers,
) -> Result<(), BrushTransferError> {
    if brushes.len() != transfers.slots.len() {
        return Err(BrushTransferError::SlotCountMismatch);
    }
    for (slot, (brush, transferred)) in brushes.iter_mut().zip(transfers.slots).enumerate() {
        match (brush, transferred) {
            (None, None) => {}
            (Some(brush), Some(transferred)) => {
                brush
                    .end_transfer(direction, transferred.transfer)
                    .map_err(|error| BrushTransferError::Brush { slot, error })?;
            }
            _ => return Err(BrushTransferError::SlotAlignmentMismatch { slot }),
        }
    }
    Ok(())
}
