//! External imagery sampling: drapes an RGBA8 texture over the cloud's full
//! geo bounds and samples it per point, nearest-neighbor.
//!
//! The texture is installed by the outer shell once its fetch completes; the
//! pixel storage is the one backing buffer a coloring job moves across the
//! worker boundary instead of copying.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::factory::BrushCreateError;
use crate::uri::BrushUri;
use crate::{
    Brush, BrushError, BrushTransfer, BufferParams, NodeSelection, RampConfiguration,
    TransferDirection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageryTextureError {
    EmptyDimensions,
    LengthMismatch,
}

impl std::fmt::Display for ImageryTextureError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageryTextureError::EmptyDimensions => {
                write!(formatter, "imagery texture dimensions must be non-zero")
            }
            ImageryTextureError::LengthMismatch => {
                write!(formatter, "imagery texture pixel length must be width * height * 4")
            }
        }
    }
}

impl std::error::Error for ImageryTextureError {}

/// Row-major RGBA8 pixels, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageryTexture {
    width: u32,
    height: u32,
    pixels: Arc<Vec<u8>>,
}

impl ImageryTexture {
    pub fn from_rgba8(
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Self, ImageryTextureError> {
        if width == 0 || height == 0 {
            return Err(ImageryTextureError::EmptyDimensions);
        }
        if pixels.len() != width as usize * height as usize * 4 {
            return Err(ImageryTextureError::LengthMismatch);
        }
        Ok(Self {
            width,
            height,
            pixels: Arc::new(pixels),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn sample(&self, u: f64, v: f64) -> [u8; 3] {
        let column = (u * f64::from(self.width - 1)).round() as usize;
        let row = ((1.0 - v) * f64::from(self.height - 1)).round() as usize;
        let index = (row * self.width as usize + column) * 4;
        [
            self.pixels[index],
            self.pixels[index + 1],
            self.pixels[index + 2],
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ImageryPrepared {
    /// No texture installed or degenerate geo bounds.
    NoColor,
    Mapped {
        x_offset: usize,
        y_offset: usize,
        geo_scale: [f64; 2],
        geo_offset: [f64; 2],
        // [min_x, min_y, max_x, max_y] of the full cloud in geo coordinates.
        bounds: [f64; 4],
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageryPayload {
    source: String,
    prepared: Option<ImageryPrepared>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TextureDims {
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageryTransferParams {
    brush: Value,
    texture: Option<TextureDims>,
}

#[derive(Debug)]
pub struct ImageryBrush {
    uri: BrushUri,
    source: String,
    texture: Option<ImageryTexture>,
    prepared: Option<ImageryPrepared>,
}

impl ImageryBrush {
    pub fn from_uri(uri: BrushUri) -> Result<Self, BrushCreateError> {
        let source = uri.query_value("source").unwrap_or("").to_owned();
        Ok(Self {
            uri,
            source,
            texture: None,
            prepared: None,
        })
    }

    pub fn install_texture(&mut self, texture: ImageryTexture) {
        self.texture = Some(texture);
    }

    pub fn texture(&self) -> Option<&ImageryTexture> {
        self.texture.as_ref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Brush for ImageryBrush {
    fn uri(&self) -> &BrushUri {
        &self.uri
    }

    fn required_schema_fields(&self) -> Vec<String> {
        vec!["x".to_owned(), "y".to_owned()]
    }

    fn serialize(&self) -> Value {
        serde_json::to_value(ImageryPayload {
            source: self.source.clone(),
            prepared: self.prepared,
        })
        .expect("serialize imagery brush payload")
    }

    fn deserialize(&mut self, payload: &Value) -> Result<(), BrushError> {
        let payload: ImageryPayload =
            serde_json::from_value(payload.clone()).map_err(|_| BrushError::MalformedPayload)?;
        self.source = payload.source;
        self.prepared = payload.prepared;
        Ok(())
    }

    fn begin_transfer(&mut self, _direction: TransferDirection) -> BrushTransfer {
        let params = serde_json::to_value(ImageryTransferParams {
            brush: self.serialize(),
            texture: self.texture.as_ref().map(|texture| TextureDims {
                width: texture.width,
                height: texture.height,
            }),
        })
        .expect("serialize imagery transfer params");

        // The pixel storage moves with the job; this side keeps only the
        // dimensions until the transfer comes back.
        let mut buffers = Vec::new();
        if let Some(texture) = self.texture.take() {
            buffers.push(texture.pixels);
        }
        BrushTransfer { params, buffers }
    }

    fn end_transfer(
        &mut self,
        _direction: TransferDirection,
        transfer: BrushTransfer,
    ) -> Result<(), BrushError> {
        let params: ImageryTransferParams = serde_json::from_value(transfer.params.clone())
            .map_err(|_| BrushError::MalformedPayload)?;
        self.deserialize(&params.brush)?;
        self.texture = match params.texture {
            None => None,
            Some(dims) => {
                let pixels = transfer
                    .buffers
                    .into_iter()
                    .next()
                    .ok_or(BrushError::MissingTransferBuffer)?;
                if pixels.len() != dims.width as usize * dims.height as usize * 4 {
                    return Err(BrushError::MissingTransferBuffer);
                }
                Some(ImageryTexture {
                    width: dims.width,
                    height: dims.height,
                    pixels,
                })
            }
        };
        Ok(())
    }

    fn prepare(
        &mut self,
        params: &BufferParams,
        _parent_staging: Option<&Value>,
        _children_staging: &[Value],
    ) -> Result<(), BrushError> {
        let x_offset = params
            .schema
            .field_offset("x")
            .ok_or(BrushError::SchemaMismatch {
                field: "x".to_owned(),
            })?;
        let y_offset = params
            .schema
            .field_offset("y")
            .ok_or(BrushError::SchemaMismatch {
                field: "y".to_owned(),
            })?;

        let geo = &params.geo_transform;
        let bounds = [
            geo.full_geo_bounds[0],
            geo.full_geo_bounds[1],
            geo.full_geo_bounds[3],
            geo.full_geo_bounds[4],
        ];
        let degenerate = bounds[0] >= bounds[2] || bounds[1] >= bounds[3];
        self.prepared = Some(if self.texture.is_none() || degenerate {
            ImageryPrepared::NoColor
        } else {
            ImageryPrepared::Mapped {
                x_offset,
                y_offset,
                geo_scale: [geo.scale[0], geo.scale[1]],
                geo_offset: [geo.offset[0], geo.offset[1]],
                bounds,
            }
        });
        Ok(())
    }

    fn staging_attributes(&self) -> Value {
        serde_json::json!({ "kind": "imagery", "source": self.source })
    }

    fn node_selection_strategy(&self) -> NodeSelection {
        NodeSelection::none()
    }

    fn buffer_needs_recolor(&self, _strategy_params: &Value, _other_staging: &Value) -> bool {
        false
    }

    fn color_point(&self, color: &mut [u8; 3], point: &[f32]) {
        let (
            Some(ImageryPrepared::Mapped {
                x_offset,
                y_offset,
                geo_scale,
                geo_offset,
                bounds,
            }),
            Some(texture),
        ) = (self.prepared, &self.texture)
        else {
            *color = [0, 0, 0];
            return;
        };
        let geo_x = f64::from(point[x_offset]) * geo_scale[0] + geo_offset[0];
        let geo_y = f64::from(point[y_offset]) * geo_scale[1] + geo_offset[1];
        let u = ((geo_x - bounds[0]) / (bounds[2] - bounds[0])).clamp(0.0, 1.0);
        let v = ((geo_y - bounds[1]) / (bounds[3] - bounds[1])).clamp(0.0, 1.0);
        *color = texture.sample(u, v);
    }

    fn unprepare(&mut self) {
        self.prepared = None;
    }

    fn ramp_configuration(&self) -> RampConfiguration {
        RampConfiguration::none()
    }
}
