//! Scalar field → color ramp. Contours the aggregate histogram range of one
//! schema field into 256 steps and interpolates between two anchor colors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::factory::BrushCreateError;
use crate::uri::{BrushUri, parse_hex_color};
use crate::{
    Brush, BrushError, BufferParams, NodeSelection, NodeSelectionStrategy, RampConfiguration,
    RampSelector,
};

pub const DEFAULT_RAMP_FIELD: &str = "z";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RampPrepared {
    /// The aggregate range was unusable; paint black and invalidate nobody.
    NoColor,
    Range {
        min: f64,
        max: f64,
        scalef: f64,
        field_offset: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RampStaging {
    NoColor,
    Range { min: f64, max: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RampPayload {
    field: String,
    step: u32,
    start: [u8; 3],
    end: [u8; 3],
    prepared: Option<RampPrepared>,
}

#[derive(Debug)]
pub struct RampBrush {
    uri: BrushUri,
    field: String,
    step: u32,
    start: [u8; 3],
    end: [u8; 3],
    prepared: Option<RampPrepared>,
}

impl RampBrush {
    pub fn from_uri(uri: BrushUri) -> Result<Self, BrushCreateError> {
        let field = uri
            .query_value("field")
            .unwrap_or(DEFAULT_RAMP_FIELD)
            .to_owned();
        let step = match uri.query_value("step") {
            None => 1,
            Some(text) => {
                let step: u32 = text
                    .parse()
                    .map_err(|_| BrushCreateError::InvalidParameter { key: "step" })?;
                // A zero contour step degenerates to continuous shading.
                step.max(1)
            }
        };
        let start = match uri.query_value("start") {
            None => [0, 0, 0],
            Some(text) => parse_hex_color(text)
                .map_err(|_| BrushCreateError::InvalidParameter { key: "start" })?,
        };
        let end = match uri.query_value("end") {
            None => [255, 255, 255],
            Some(text) => parse_hex_color(text)
                .map_err(|_| BrushCreateError::InvalidParameter { key: "end" })?,
        };
        Ok(Self {
            uri,
            field,
            step,
            start,
            end,
            prepared: None,
        })
    }

    fn staging(&self) -> Option<RampStaging> {
        match self.prepared? {
            RampPrepared::NoColor => Some(RampStaging::NoColor),
            RampPrepared::Range { min, max, .. } => Some(RampStaging::Range { min, max }),
        }
    }
}

impl Brush for RampBrush {
    fn uri(&self) -> &BrushUri {
        &self.uri
    }

    fn required_schema_fields(&self) -> Vec<String> {
        vec![self.field.clone()]
    }

    fn serialize(&self) -> Value {
        serde_json::to_value(RampPayload {
            field: self.field.clone(),
            step: self.step,
            start: self.start,
            end: self.end,
            prepared: self.prepared,
        })
        .expect("serialize ramp brush payload")
    }

    fn deserialize(&mut self, payload: &Value) -> Result<(), BrushError> {
        let payload: RampPayload =
            serde_json::from_value(payload.clone()).map_err(|_| BrushError::MalformedPayload)?;
        self.field = payload.field;
        self.step = payload.step.max(1);
        self.start = payload.start;
        self.end = payload.end;
        self.prepared = payload.prepared;
        Ok(())
    }

    fn prepare(
        &mut self,
        params: &BufferParams,
        _parent_staging: Option<&Value>,
        _children_staging: &[Value],
    ) -> Result<(), BrushError> {
        let field_offset =
            params
                .schema
                .field_offset(&self.field)
                .ok_or(BrushError::SchemaMismatch {
                    field: self.field.clone(),
                })?;
        let range = params
            .point_cloud_stats
            .field(&self.field)
            .and_then(|histogram| histogram.value_range());
        self.prepared = Some(match range {
            Some((min, max)) if min < max => RampPrepared::Range {
                min,
                max,
                scalef: 255.0 / (f64::from(self.step) * (max - min)),
                field_offset,
            },
            _ => RampPrepared::NoColor,
        });
        Ok(())
    }

    fn staging_attributes(&self) -> Value {
        match self.staging() {
            Some(staging) => serde_json::to_value(staging).expect("serialize ramp staging"),
            None => Value::Null,
        }
    }

    fn node_selection_strategy(&self) -> NodeSelection {
        match self.staging() {
            Some(staging @ RampStaging::Range { .. }) => NodeSelection {
                strategy: NodeSelectionStrategy::All,
                params: serde_json::to_value(staging).expect("serialize ramp staging"),
            },
            _ => NodeSelection::none(),
        }
    }

    fn buffer_needs_recolor(&self, strategy_params: &Value, other_staging: &Value) -> bool {
        other_staging != strategy_params
    }

    fn color_point(&self, color: &mut [u8; 3], point: &[f32]) {
        let Some(RampPrepared::Range {
            min,
            scalef,
            field_offset,
            ..
        }) = self.prepared
        else {
            *color = [0, 0, 0];
            return;
        };
        let value = f64::from(point[field_offset]);
        let contour = ((scalef * (value - min)).floor() * f64::from(self.step)).clamp(0.0, 255.0);
        for channel in 0..3 {
            let low = f64::from(self.start[channel]);
            let high = f64::from(self.end[channel]);
            color[channel] = (low + (high - low) * contour / 255.0).round() as u8;
        }
    }

    fn unprepare(&mut self) {
        self.prepared = None;
    }

    fn ramp_configuration(&self) -> RampConfiguration {
        let selector = match self.field.as_str() {
            "z" => RampSelector::ZRange,
            "intensity" => RampSelector::IntensityRange,
            _ => RampSelector::None,
        };
        RampConfiguration {
            selector,
            start: self.start,
            end: self.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use point_protocol::{
        BufferStats, FieldHistogram, GeoTransform, RenderSpaceBounds, Schema, SchemaField, TreePath,
    };

    use super::*;

    fn ramp(uri_text: &str) -> RampBrush {
        let uri = BrushUri::parse(uri_text).expect("parse ramp uri");
        RampBrush::from_uri(uri).expect("build ramp brush")
    }

    fn params_with_z_buckets(buckets: &[(i64, u64)]) -> BufferParams {
        let stats = BufferStats::from_fields([(
            "z".to_owned(),
            FieldHistogram::from_buckets(buckets.iter().copied()),
        )]);
        BufferParams {
            tree_path: TreePath::root(),
            total_points: 4,
            schema: Schema::from_fields(vec![
                SchemaField::floating("x"),
                SchemaField::floating("y"),
                SchemaField::floating("z"),
            ])
            .expect("build schema"),
            render_space_bounds: RenderSpaceBounds([0.0; 6]),
            tile_stats: stats.clone(),
            point_cloud_stats: stats,
            geo_transform: GeoTransform::identity(),
        }
    }

    #[test]
    fn contours_the_aggregate_range() {
        let mut brush = ramp("local://ramp?field=z&step=1&start=%23000000&end=%23ffffff");
        let params = params_with_z_buckets(&[(0, 1), (10, 1), (20, 1), (30, 1)]);
        brush
            .prepare(&params, None, &[])
            .expect("prepare ramp brush");

        // min 0, max 30+10, scalef 255/40.
        let mut color = [0_u8; 3];
        let mut contours = Vec::new();
        for value in [0.0_f32, 5.0, 10.0, 15.0] {
            brush.color_point(&mut color, &[0.0, 0.0, value]);
            assert_eq!(color[0], color[1]);
            assert_eq!(color[1], color[2]);
            contours.push(color[0]);
        }
        assert_eq!(contours, vec![0, 31, 63, 95]);
    }

    #[test]
    fn stages_the_prepared_range_and_selects_all_nodes() {
        let mut brush = ramp("local://ramp?field=z");
        brush
            .prepare(&params_with_z_buckets(&[(0, 1), (30, 1)]), None, &[])
            .expect("prepare ramp brush");

        let staging = brush.staging_attributes();
        assert_eq!(staging["kind"], "range");
        assert_eq!(staging["min"], 0.0);
        assert_eq!(staging["max"], 40.0);

        let selection = brush.node_selection_strategy();
        assert_eq!(selection.strategy, NodeSelectionStrategy::All);
        assert!(!brush.buffer_needs_recolor(&selection.params, &staging));

        let stale = serde_json::json!({"kind": "range", "min": 0.0, "max": 30.0});
        assert!(brush.buffer_needs_recolor(&selection.params, &stale));
    }

    #[test]
    fn empty_range_goes_quiescent() {
        let mut brush = ramp("local://ramp?field=z");
        brush
            .prepare(&params_with_z_buckets(&[]), None, &[])
            .expect("prepare ramp brush");

        let mut color = [9_u8; 3];
        brush.color_point(&mut color, &[0.0, 0.0, 12.5]);
        assert_eq!(color, [0, 0, 0]);
        assert_eq!(
            brush.node_selection_strategy().strategy,
            NodeSelectionStrategy::None
        );
        assert_eq!(brush.staging_attributes()["kind"], "no_color");
    }

    #[test]
    fn missing_field_is_a_schema_mismatch() {
        let mut brush = ramp("local://ramp?field=intensity");
        let error = brush
            .prepare(&params_with_z_buckets(&[(0, 1), (10, 1)]), None, &[])
            .expect_err("prepare must fail");
        assert_eq!(
            error,
            BrushError::SchemaMismatch {
                field: "intensity".to_owned()
            }
        );
    }

    #[test]
    fn zero_step_is_normalized_to_one() {
        let brush = ramp("local://ramp?step=0");
        assert_eq!(brush.step, 1);
        assert_eq!(
            RampBrush::from_uri(BrushUri::parse("local://ramp?step=x").expect("parse uri"))
                .expect_err("step must fail"),
            BrushCreateError::InvalidParameter { key: "step" }
        );
    }

    #[test]
    fn serialize_round_trips_prepared_state() {
        let mut brush = ramp("local://ramp?field=z&step=2&start=%23102030&end=%23a0b0c0");
        brush
            .prepare(&params_with_z_buckets(&[(0, 2), (20, 2)]), None, &[])
            .expect("prepare ramp brush");
        let payload = brush.serialize();

        let mut restored = ramp("local://ramp");
        restored.deserialize(&payload).expect("restore ramp brush");
        assert_eq!(restored.serialize(), payload);
        assert_eq!(restored.staging_attributes(), brush.staging_attributes());

        brush.unprepare();
        assert_eq!(brush.staging_attributes(), Value::Null);
    }

    #[test]
    fn interpolates_between_anchor_colors() {
        let mut brush = ramp("local://ramp?field=z&start=%23000000&end=%23ff0000");
        brush
            .prepare(&params_with_z_buckets(&[(0, 1), (30, 1)]), None, &[])
            .expect("prepare ramp brush");

        let mut color = [0_u8; 3];
        brush.color_point(&mut color, &[0.0, 0.0, 20.0]);
        // contour 127 of 255 along a black→red ramp.
        assert_eq!(color, [127, 0, 0]);
    }

    #[test]
    fn ramp_configuration_follows_the_field() {
        assert_eq!(
            ramp("local://ramp?field=z").ramp_configuration().selector,
            RampSelector::ZRange
        );
        assert_eq!(
            ramp("local://ramp?field=intensity")
                .ramp_configuration()
                .selector,
            RampSelector::IntensityRange
        );
        assert_eq!(
            ramp("local://ramp?field=red").ramp_configuration().selector,
            RampSelector::None
        );
    }
}
