//! Direct RGB passthrough from the tile's red/green/blue schema fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::factory::BrushCreateError;
use crate::uri::BrushUri;
use crate::{
    Brush, BrushError, BufferParams, NodeSelection, NodeSelectionStrategy, RampConfiguration,
};

const CHANNEL_FIELDS: [&str; 3] = ["red", "green", "blue"];

/// Bucket key at which a channel histogram is taken to hold 16-bit samples.
const SIXTEEN_BIT_BUCKET_KEY: i64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct ColorPrepared {
    scale: f64,
    channel_offsets: [usize; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColorPayload {
    prepared: Option<ColorPrepared>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ColorStaging {
    Scale { scale: f64 },
}

#[derive(Debug)]
pub struct ColorBrush {
    uri: BrushUri,
    prepared: Option<ColorPrepared>,
}

impl ColorBrush {
    pub fn from_uri(uri: BrushUri) -> Result<Self, BrushCreateError> {
        Ok(Self {
            uri,
            prepared: None,
        })
    }
}

impl Brush for ColorBrush {
    fn uri(&self) -> &BrushUri {
        &self.uri
    }

    fn required_schema_fields(&self) -> Vec<String> {
        CHANNEL_FIELDS.iter().map(|&field| field.to_owned()).collect()
    }

    fn serialize(&self) -> Value {
        serde_json::to_value(ColorPayload {
            prepared: self.prepared,
        })
        .expect("serialize color brush payload")
    }

    fn deserialize(&mut self, payload: &Value) -> Result<(), BrushError> {
        let payload: ColorPayload =
            serde_json::from_value(payload.clone()).map_err(|_| BrushError::MalformedPayload)?;
        self.prepared = payload.prepared;
        Ok(())
    }

    fn prepare(
        &mut self,
        params: &BufferParams,
        _parent_staging: Option<&Value>,
        _children_staging: &[Value],
    ) -> Result<(), BrushError> {
        let mut channel_offsets = [0_usize; 3];
        for (slot, field) in CHANNEL_FIELDS.iter().enumerate() {
            channel_offsets[slot] =
                params
                    .schema
                    .field_offset(field)
                    .ok_or(BrushError::SchemaMismatch {
                        field: (*field).to_owned(),
                    })?;
        }

        // Sources with 16-bit color push histogram buckets past the 8-bit
        // range; everything scales down together once any channel does.
        let sixteen_bit = CHANNEL_FIELDS.iter().any(|field| {
            params
                .point_cloud_stats
                .field(field)
                .map(|histogram| {
                    histogram
                        .buckets()
                        .any(|(key, _)| key >= SIXTEEN_BIT_BUCKET_KEY)
                })
                .unwrap_or(false)
        });
        self.prepared = Some(ColorPrepared {
            scale: if sixteen_bit { 1.0 / 256.0 } else { 1.0 },
            channel_offsets,
        });
        Ok(())
    }

    fn staging_attributes(&self) -> Value {
        match self.prepared {
            Some(prepared) => serde_json::to_value(ColorStaging::Scale {
                scale: prepared.scale,
            })
            .expect("serialize color staging"),
            None => Value::Null,
        }
    }

    fn node_selection_strategy(&self) -> NodeSelection {
        match self.prepared {
            Some(_) => NodeSelection {
                strategy: NodeSelectionStrategy::All,
                params: self.staging_attributes(),
            },
            None => NodeSelection::none(),
        }
    }

    fn buffer_needs_recolor(&self, strategy_params: &Value, other_staging: &Value) -> bool {
        other_staging != strategy_params
    }

    fn color_point(&self, color: &mut [u8; 3], point: &[f32]) {
        let Some(prepared) = self.prepared else {
            *color = [0, 0, 0];
            return;
        };
        for (slot, &offset) in prepared.channel_offsets.iter().enumerate() {
            let value = f64::from(point[offset]) * prepared.scale;
            color[slot] = value.clamp(0.0, 255.0) as u8;
        }
    }

    fn unprepare(&mut self) {
        self.prepared = None;
    }

    fn ramp_configuration(&self) -> RampConfiguration {
        RampConfiguration::none()
    }
}
