//! Categorical field coloring: each discrete field value maps into a fixed
//! palette. Deterministic per point, so an insert never invalidates
//! neighbors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::factory::BrushCreateError;
use crate::uri::BrushUri;
use crate::{Brush, BrushError, BufferParams, NodeSelection, RampConfiguration};

pub const DEFAULT_CATEGORICAL_FIELD: &str = "classification";

/// Stock categorical palette, ASPRS-classification flavored.
pub const FIELD_COLOR_PALETTE: [[u8; 3]; 10] = [
    [120, 120, 120],
    [170, 120, 70],
    [140, 100, 60],
    [60, 140, 60],
    [50, 170, 50],
    [40, 200, 40],
    [220, 60, 60],
    [230, 230, 100],
    [100, 100, 230],
    [230, 140, 40],
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldColorPayload {
    field: String,
    field_offset: Option<usize>,
}

#[derive(Debug)]
pub struct FieldColorBrush {
    uri: BrushUri,
    field: String,
    field_offset: Option<usize>,
}

impl FieldColorBrush {
    pub fn from_uri(uri: BrushUri) -> Result<Self, BrushCreateError> {
        let field = uri
            .query_value("field")
            .unwrap_or(DEFAULT_CATEGORICAL_FIELD)
            .to_owned();
        Ok(Self {
            uri,
            field,
            field_offset: None,
        })
    }
}

impl Brush for FieldColorBrush {
    fn uri(&self) -> &BrushUri {
        &self.uri
    }

    fn required_schema_fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn serialize(&self) -> Value {
        serde_json::to_value(FieldColorPayload {
            field: self.field.clone(),
            field_offset: self.field_offset,
        })
        .expect("serialize field color brush payload")
    }

    fn deserialize(&mut self, payload: &Value) -> Result<(), BrushError> {
        let payload: FieldColorPayload =
            serde_json::from_value(payload.clone()).map_err(|_| BrushError::MalformedPayload)?;
        self.field = payload.field;
        self.field_offset = payload.field_offset;
        Ok(())
    }

    fn prepare(
        &mut self,
        params: &BufferParams,
        _parent_staging: Option<&Value>,
        _children_staging: &[Value],
    ) -> Result<(), BrushError> {
        self.field_offset = Some(params.schema.field_offset(&self.field).ok_or(
            BrushError::SchemaMismatch {
                field: self.field.clone(),
            },
        )?);
        Ok(())
    }

    fn staging_attributes(&self) -> Value {
        serde_json::json!({ "kind": "categorical", "field": self.field })
    }

    fn node_selection_strategy(&self) -> NodeSelection {
        NodeSelection::none()
    }

    fn buffer_needs_recolor(&self, _strategy_params: &Value, _other_staging: &Value) -> bool {
        false
    }

    fn color_point(&self, color: &mut [u8; 3], point: &[f32]) {
        let Some(field_offset) = self.field_offset else {
            *color = [0, 0, 0];
            return;
        };
        let value = point[field_offset];
        let category = if value.is_finite() && value >= 0.0 {
            value as usize % FIELD_COLOR_PALETTE.len()
        } else {
            0
        };
        *color = FIELD_COLOR_PALETTE[category];
    }

    fn unprepare(&mut self) {
        self.field_offset = None;
    }

    fn ramp_configuration(&self) -> RampConfiguration {
        RampConfiguration::none()
    }
}
