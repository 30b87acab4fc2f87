//! Shared data model of the point-buffer pipeline.
//! Can be depended on by any crate in the workspace.
//! Should not depend on other workspace crates.

use std::fmt;

use smol_str::SmolStr;

pub mod color;
pub mod stats;

pub use stats::{BufferStats, FieldHistogram, STATS_BUCKET_WIDTH, accumulate};

pub const TREE_PATH_ROOT: char = 'R';
pub const OCTANT_COUNT: u8 = 8;

/// Octree node address. A path is `R` followed by zero or more octant digits
/// (`0..=7`); a prefix names an ancestor and appending a digit names a child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreePath(SmolStr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreePathParseError {
    Empty,
    MissingRoot,
    InvalidOctant,
}

impl fmt::Display for TreePathParseError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreePathParseError::Empty => write!(formatter, "tree path is empty"),
            TreePathParseError::MissingRoot => {
                write!(formatter, "tree path must start with '{TREE_PATH_ROOT}'")
            }
            TreePathParseError::InvalidOctant => {
                write!(formatter, "tree path octants must be digits 0..=7")
            }
        }
    }
}

impl std::error::Error for TreePathParseError {}

impl TreePath {
    pub fn root() -> Self {
        Self(SmolStr::new_inline("R"))
    }

    pub fn parse(text: &str) -> Result<Self, TreePathParseError> {
        let mut characters = text.chars();
        match characters.next() {
            None => return Err(TreePathParseError::Empty),
            Some(TREE_PATH_ROOT) => {}
            Some(_) => return Err(TreePathParseError::MissingRoot),
        }
        for character in characters {
            if !('0'..='7').contains(&character) {
                return Err(TreePathParseError::InvalidOctant);
            }
        }
        Ok(Self(SmolStr::new(text)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Number of octant digits below the root.
    pub fn depth(&self) -> usize {
        self.0.len() - 1
    }

    pub fn parent(&self) -> Option<TreePath> {
        if self.is_root() {
            return None;
        }
        Some(Self(SmolStr::new(&self.0[..self.0.len() - 1])))
    }

    pub fn child(&self, octant: u8) -> TreePath {
        if octant >= OCTANT_COUNT {
            panic!("tree path octant {octant} out of range");
        }
        let mut text = String::with_capacity(self.0.len() + 1);
        text.push_str(self.0.as_str());
        text.push(char::from(b'0' + octant));
        Self(SmolStr::new(text))
    }

    /// Walks toward the root, nearest ancestor first, excluding `self`.
    pub fn ancestors(&self) -> TreePathAncestors {
        TreePathAncestors {
            current: self.parent(),
        }
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TreePathAncestors {
    current: Option<TreePath>,
}

impl Iterator for TreePathAncestors {
    type Item = TreePath;

    fn next(&mut self) -> Option<TreePath> {
        let next = self.current.take()?;
        self.current = next.parent();
        Some(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFieldKind {
    Floating,
    Unsigned,
}

pub const SCHEMA_FIELD_SIZE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub kind: SchemaFieldKind,
    pub size: u32,
}

impl SchemaField {
    pub fn floating(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: SchemaFieldKind::Floating,
            size: SCHEMA_FIELD_SIZE,
        }
    }

    pub fn unsigned(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: SchemaFieldKind::Unsigned,
            size: SCHEMA_FIELD_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaError {
    Empty,
    DuplicateFieldName,
    UnsupportedFieldSize,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Empty => write!(formatter, "schema has no fields"),
            SchemaError::DuplicateFieldName => write!(formatter, "schema field name duplicated"),
            SchemaError::UnsupportedFieldSize => {
                write!(formatter, "schema fields must be {SCHEMA_FIELD_SIZE} bytes")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

/// Ordered field layout of a decoded point. The loader normalizes every
/// field to one f32, so the point stride equals the field count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<SchemaField>,
}

impl Schema {
    pub fn from_fields(fields: Vec<SchemaField>) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::Empty);
        }
        for (index, field) in fields.iter().enumerate() {
            if field.size != SCHEMA_FIELD_SIZE {
                return Err(SchemaError::UnsupportedFieldSize);
            }
            if fields[..index].iter().any(|other| other.name == field.name) {
                return Err(SchemaError::DuplicateFieldName);
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn point_stride(&self) -> usize {
        self.fields.len()
    }

    pub fn field_offset(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_offset(name).is_some()
    }

    /// Offsets of the `x`, `y`, `z` position fields, in that order.
    pub fn position_offsets(&self) -> Option<[usize; 3]> {
        Some([
            self.field_offset("x")?,
            self.field_offset("y")?,
            self.field_offset("z")?,
        ])
    }
}

/// Axis-aligned min/max corners in render coordinates,
/// laid out `[min_x, min_y, min_z, max_x, max_y, max_z]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSpaceBounds(pub [f32; 6]);

impl RenderSpaceBounds {
    pub fn mins(&self) -> [f32; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    pub fn maxes(&self) -> [f32; 3] {
        [self.0[3], self.0[4], self.0[5]]
    }
}

/// Opaque to the cache; the imagery brush samples `full_geo_bounds`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub full_geo_bounds: [f64; 6],
}

impl GeoTransform {
    pub fn identity() -> Self {
        Self {
            scale: [1.0; 3],
            offset: [0.0; 3],
            full_geo_bounds: [0.0; 6],
        }
    }
}

/// Handoff record from the tile loader: one decoded, schema-normalized
/// octree node ready for coloring and insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedBuffer {
    pub data: Vec<f32>,
    pub total_points: u32,
    pub schema: Schema,
    pub tree_path: TreePath,
    pub render_space_bounds: RenderSpaceBounds,
    pub buffer_stats: BufferStats,
    pub geo_transform: GeoTransform,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_and_nested_paths() {
        let root = TreePath::parse("R").expect("parse root");
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
        assert_eq!(root.parent(), None);

        let nested = TreePath::parse("R121").expect("parse nested");
        assert_eq!(nested.depth(), 3);
        assert_eq!(nested.as_str(), "R121");
        assert_eq!(nested.parent(), Some(TreePath::parse("R12").expect("parse parent")));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(TreePath::parse(""), Err(TreePathParseError::Empty));
        assert_eq!(TreePath::parse("121"), Err(TreePathParseError::MissingRoot));
        assert_eq!(TreePath::parse("R8"), Err(TreePathParseError::InvalidOctant));
        assert_eq!(TreePath::parse("R1a"), Err(TreePathParseError::InvalidOctant));
    }

    #[test]
    fn child_appends_octant_digit() {
        let path = TreePath::root().child(3).child(7);
        assert_eq!(path.as_str(), "R37");
    }

    #[test]
    #[should_panic(expected = "octant 8 out of range")]
    fn child_rejects_out_of_range_octant() {
        let _ = TreePath::root().child(8);
    }

    #[test]
    fn ancestors_walk_nearest_first() {
        let path = TreePath::parse("R123").expect("parse path");
        let ancestors: Vec<String> = path
            .ancestors()
            .map(|ancestor| ancestor.as_str().to_owned())
            .collect();
        assert_eq!(ancestors, vec!["R12", "R1", "R"]);
    }

    #[test]
    fn lexicographic_order_matches_depth_first_traversal() {
        let mut paths = vec![
            TreePath::parse("R1").expect("parse"),
            TreePath::parse("R").expect("parse"),
            TreePath::parse("R01").expect("parse"),
            TreePath::parse("R0").expect("parse"),
            TreePath::parse("R00").expect("parse"),
        ];
        paths.sort();
        let sorted: Vec<&str> = paths.iter().map(|path| path.as_str()).collect();
        assert_eq!(sorted, vec!["R", "R0", "R00", "R01", "R1"]);
    }

    #[test]
    fn schema_resolves_field_offsets() {
        let schema = Schema::from_fields(vec![
            SchemaField::floating("x"),
            SchemaField::floating("y"),
            SchemaField::floating("z"),
            SchemaField::unsigned("intensity"),
        ])
        .expect("build schema");

        assert_eq!(schema.point_stride(), 4);
        assert_eq!(schema.field_offset("intensity"), Some(3));
        assert_eq!(schema.field_offset("classification"), None);
        assert_eq!(schema.position_offsets(), Some([0, 1, 2]));
    }

    #[test]
    fn schema_rejects_duplicates_and_bad_sizes() {
        assert_eq!(
            Schema::from_fields(vec![
                SchemaField::floating("x"),
                SchemaField::floating("x"),
            ]),
            Err(SchemaError::DuplicateFieldName)
        );

        let mut wide = SchemaField::floating("x");
        wide.size = 8;
        assert_eq!(
            Schema::from_fields(vec![wide]),
            Err(SchemaError::UnsupportedFieldSize)
        );
        assert_eq!(Schema::from_fields(Vec::new()), Err(SchemaError::Empty));
    }
}
