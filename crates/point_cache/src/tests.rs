use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use brushes::{
    Brush, BrushCreateError, BrushRegistry, BrushUri, BufferParams, NodeSelection,
    NodeSelectionStrategy, RampConfiguration,
};
use color_workers::{ColorWorkerPool, ColorWorkerPoolConfig};
use point_protocol::color::{compress_color, decompress_color};
use point_protocol::{
    BufferStats, DownloadedBuffer, FieldHistogram, GeoTransform, RenderSpaceBounds, Schema,
    SchemaField, TreePath,
};
use serde_json::Value;

use super::*;

const RAMP: &str = "local://ramp?field=z&step=1&start=%23000000&end=%23ffffff";

fn path(text: &str) -> TreePath {
    TreePath::parse(text).expect("parse tree path")
}

fn xyz_schema() -> Schema {
    Schema::from_fields(vec![
        SchemaField::floating("x"),
        SchemaField::floating("y"),
        SchemaField::floating("z"),
    ])
    .expect("build schema")
}

fn z_stats(buckets: &[(i64, u64)]) -> BufferStats {
    BufferStats::from_fields([(
        "z".to_owned(),
        FieldHistogram::from_buckets(buckets.iter().copied()),
    )])
}

fn downloaded(path_text: &str, z_values: &[f32], z_buckets: &[(i64, u64)]) -> DownloadedBuffer {
    let mut data = Vec::with_capacity(z_values.len() * 3);
    for (index, &z) in z_values.iter().enumerate() {
        data.extend_from_slice(&[index as f32, 0.0, z]);
    }
    DownloadedBuffer {
        data,
        total_points: z_values.len() as u32,
        schema: xyz_schema(),
        tree_path: path(path_text),
        render_space_bounds: RenderSpaceBounds([0.0; 6]),
        buffer_stats: z_stats(z_buckets),
        geo_transform: GeoTransform::identity(),
    }
}

fn cache_with_registry(registry: Arc<BrushRegistry>) -> PointBufferCache {
    let pool = ColorWorkerPool::start(
        ColorWorkerPoolConfig { workers: 2 },
        Arc::clone(&registry),
    )
    .expect("start color worker pool");
    PointBufferCache::new(Arc::new(pool), registry)
}

fn stock_cache() -> PointBufferCache {
    cache_with_registry(Arc::new(BrushRegistry::with_stock_brushes()))
}

fn install_render_counter(cache: &mut PointBufferCache) -> Arc<AtomicUsize> {
    let render_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&render_count);
    cache.set_render_request(Some(Box::new(move || {
        counter.fetch_add(1, Ordering::Relaxed);
    })));
    render_count
}

/// First color channel of every point, decompressed, red component.
fn channel_contours(tile: &Tile, channel: usize) -> Vec<u8> {
    let buffer = tile.output_buffer();
    (0..tile.total_points() as usize)
        .map(|point_index| {
            decompress_color(buffer[point_index * tile.output_point_size() + 3 + channel])[0]
        })
        .collect()
}

#[test]
fn colors_a_single_ramp_tile() {
    let mut cache = stock_cache();
    let result = cache
        .push(
            downloaded("R", &[0.0, 5.0, 10.0, 15.0], &[(0, 1), (10, 1), (20, 1), (30, 1)]),
            &[Some(RAMP)],
        )
        .expect("push root tile");

    assert!(!result.update);
    assert!(result.colored);
    assert_eq!(result.output_point_size, 4);

    let tile = cache.tile(&path("R")).expect("root tile cached");
    // range 0..40, scalef 255/40 = 6.375.
    assert_eq!(channel_contours(tile, 0), vec![0, 31, 63, 95]);
    assert_eq!(
        tile.output_buffer().len(),
        tile.total_points() as usize * tile.output_point_size()
    );
    assert_eq!(tile.staging_attributes().len(), 1);
    assert_eq!(tile.staging_attributes()[0]["kind"], "range");
    assert_eq!(tile.staging_attributes()[0]["max"], 40.0);
    // Positions pass through to the interleaved output.
    assert_eq!(tile.output_buffer()[4], 1.0);

    assert_eq!(cache.recolor_queue_len(), 0);
}

#[test]
fn growing_stats_requeue_and_repaint_cached_tiles() {
    let mut cache = stock_cache();
    let render_count = install_render_counter(&mut cache);

    cache
        .push(
            downloaded("R0", &[0.0, 5.0, 10.0, 15.0], &[(0, 1), (10, 1), (20, 1), (30, 1)]),
            &[Some(RAMP)],
        )
        .expect("push R0");
    cache
        .push(downloaded("R00", &[40.0], &[(70, 1)]), &[Some(RAMP)])
        .expect("push R00");

    // The aggregate max grew from 40 to 80; exactly one queue entry for R0.
    assert_eq!(cache.recolor_queue_paths(), vec![path("R0")]);

    let processed = cache.drive_recolors();
    assert_eq!(processed, 1);
    assert_eq!(render_count.load(Ordering::Relaxed), 1);
    assert_eq!(cache.recolor_queue_len(), 0);

    {
        let tile = cache.tile(&path("R0")).expect("R0 cached");
        assert!(tile.update());
        // scalef is now 255/80.
        assert_eq!(channel_contours(tile, 0), vec![0, 15, 31, 47]);
        assert_eq!(tile.staging_attributes()[0]["max"], 80.0);
    }

    assert!(cache.mark_uploaded(&path("R0")));
    assert!(!cache.tile(&path("R0")).expect("R0 cached").update());
}

#[test]
fn requeued_tiles_appear_once_and_all_repaint() {
    let mut cache = stock_cache();
    let render_count = install_render_counter(&mut cache);

    cache
        .push(downloaded("R0", &[0.0, 15.0], &[(0, 1), (30, 1)]), &[Some(RAMP)])
        .expect("push R0");
    cache
        .push(downloaded("R00", &[40.0], &[(70, 1)]), &[Some(RAMP)])
        .expect("push R00");
    cache
        .push(downloaded("R01", &[100.0], &[(110, 1)]), &[Some(RAMP)])
        .expect("push R01");

    // R0 was re-impacted by R01's push and coalesced; R00 joined fresh.
    let queued = cache.recolor_queue_paths();
    assert_eq!(queued.len(), 2);
    assert!(queued.contains(&path("R0")));
    assert!(queued.contains(&path("R00")));

    assert_eq!(cache.drive_recolors(), 2);
    assert_eq!(render_count.load(Ordering::Relaxed), 2);
    for tile_path in ["R0", "R00"] {
        let tile = cache.tile(&path(tile_path)).expect("tile cached");
        assert!(tile.update());
        assert_eq!(tile.staging_attributes()[0]["max"], 120.0);
    }
    assert_eq!(cache.updated_paths(), vec![path("R0"), path("R00")]);
}

#[test]
fn remove_cancels_pending_recolors() {
    let mut cache = stock_cache();
    let render_count = install_render_counter(&mut cache);

    cache
        .push(downloaded("R", &[0.0], &[(0, 1)]), &[Some(RAMP)])
        .expect("push R");
    cache
        .push(downloaded("R0", &[40.0], &[(70, 1)]), &[Some(RAMP)])
        .expect("push R0");
    assert_eq!(cache.recolor_queue_paths(), vec![path("R")]);

    assert!(cache.remove(&path("R")));
    assert_eq!(cache.recolor_queue_len(), 0);
    assert!(!cache.contains(&path("R")));

    assert_eq!(cache.drive_recolors(), 0);
    assert_eq!(render_count.load(Ordering::Relaxed), 0);
}

#[test]
fn none_strategy_leaves_the_queue_unchanged() {
    let mut cache = stock_cache();

    cache
        .push(
            downloaded("R", &[2.0], &[(0, 1)]),
            &[Some("local://field-color?field=z")],
        )
        .expect("push R");
    cache
        .push(
            downloaded("R0", &[7.0], &[(0, 1)]),
            &[Some("local://field-color?field=z")],
        )
        .expect("push R0");

    assert_eq!(cache.recolor_queue_len(), 0);
    let tile = cache.tile(&path("R")).expect("R cached");
    let packed = tile.output_buffer()[3];
    let palette = brushes::field_color::FIELD_COLOR_PALETTE[2];
    assert_eq!(packed, compress_color(palette[0], palette[1], palette[2]));
}

#[derive(Debug)]
struct AncestorSweepBrush {
    uri: BrushUri,
}

fn create_ancestor_sweep(uri: BrushUri) -> Result<Box<dyn Brush>, BrushCreateError> {
    Ok(Box::new(AncestorSweepBrush { uri }))
}

impl Brush for AncestorSweepBrush {
    fn uri(&self) -> &BrushUri {
        &self.uri
    }

    fn required_schema_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn serialize(&self) -> Value {
        serde_json::json!({})
    }

    fn deserialize(&mut self, _payload: &Value) -> Result<(), brushes::BrushError> {
        Ok(())
    }

    fn prepare(
        &mut self,
        _params: &BufferParams,
        _parent_staging: Option<&Value>,
        _children_staging: &[Value],
    ) -> Result<(), brushes::BrushError> {
        Ok(())
    }

    fn staging_attributes(&self) -> Value {
        serde_json::json!({ "kind": "sweep" })
    }

    fn node_selection_strategy(&self) -> NodeSelection {
        NodeSelection {
            strategy: NodeSelectionStrategy::Ancestors,
            params: Value::Null,
        }
    }

    fn buffer_needs_recolor(&self, _strategy_params: &Value, _other_staging: &Value) -> bool {
        true
    }

    fn color_point(&self, color: &mut [u8; 3], _point: &[f32]) {
        *color = [1, 2, 3];
    }

    fn unprepare(&mut self) {}

    fn ramp_configuration(&self) -> RampConfiguration {
        RampConfiguration::none()
    }
}

#[test]
fn ancestors_strategy_walks_toward_the_root_in_order() {
    let registry = Arc::new(BrushRegistry::with_stock_brushes());
    registry.register_brush("local", "ancestor-sweep", create_ancestor_sweep);
    let mut cache = cache_with_registry(registry);
    let render_count = install_render_counter(&mut cache);

    for tile_path in ["R", "R1", "R12"] {
        cache
            .push(
                downloaded(tile_path, &[1.0], &[(0, 1)]),
                &[Some("local://field-color?field=z")],
            )
            .expect("push ancestor tile");
    }
    // R2 is off the ancestor chain and must stay untouched.
    cache
        .push(
            downloaded("R2", &[1.0], &[(0, 1)]),
            &[Some("local://field-color?field=z")],
        )
        .expect("push R2");

    cache
        .push(
            downloaded("R123", &[1.0], &[(0, 1)]),
            &[Some("local://ancestor-sweep")],
        )
        .expect("push R123");

    assert_eq!(
        cache.recolor_queue_paths(),
        vec![path("R12"), path("R1"), path("R")]
    );

    assert_eq!(cache.drive_recolors(), 3);
    assert_eq!(render_count.load(Ordering::Relaxed), 3);
    let repainted = compress_color(1, 2, 3);
    for tile_path in ["R", "R1", "R12"] {
        let tile = cache.tile(&path(tile_path)).expect("tile cached");
        assert!(tile.update());
        assert_eq!(tile.output_buffer()[3], repainted);
    }
    let untouched = cache.tile(&path("R2")).expect("R2 cached");
    assert!(!untouched.update());
    assert_ne!(untouched.output_buffer()[3], repainted);
}

#[derive(Debug)]
struct WorkerPoisonBrush {
    uri: BrushUri,
}

fn create_worker_poison(uri: BrushUri) -> Result<Box<dyn Brush>, BrushCreateError> {
    Ok(Box::new(WorkerPoisonBrush { uri }))
}

impl Brush for WorkerPoisonBrush {
    fn uri(&self) -> &BrushUri {
        &self.uri
    }

    fn required_schema_fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn serialize(&self) -> Value {
        serde_json::json!({})
    }

    // Always refuses to restore, so the worker-side decode fails.
    fn deserialize(&mut self, _payload: &Value) -> Result<(), brushes::BrushError> {
        Err(brushes::BrushError::MalformedPayload)
    }

    fn prepare(
        &mut self,
        _params: &BufferParams,
        _parent_staging: Option<&Value>,
        _children_staging: &[Value],
    ) -> Result<(), brushes::BrushError> {
        Ok(())
    }

    fn staging_attributes(&self) -> Value {
        serde_json::json!({ "kind": "poison" })
    }

    fn node_selection_strategy(&self) -> NodeSelection {
        NodeSelection::none()
    }

    fn buffer_needs_recolor(&self, _strategy_params: &Value, _other_staging: &Value) -> bool {
        false
    }

    fn color_point(&self, color: &mut [u8; 3], _point: &[f32]) {
        *color = [255, 255, 255];
    }

    fn unprepare(&mut self) {}

    fn ramp_configuration(&self) -> RampConfiguration {
        RampConfiguration::none()
    }
}

#[test]
fn worker_failure_inserts_the_tile_uncolored() {
    let registry = Arc::new(BrushRegistry::with_stock_brushes());
    registry.register_brush("local", "worker-poison", create_worker_poison);
    let mut cache = cache_with_registry(registry);

    let result = cache
        .push(
            downloaded("R", &[0.0, 5.0], &[(0, 1)]),
            &[Some("local://worker-poison")],
        )
        .expect("push survives the worker failure");
    assert!(!result.colored);

    let tile = cache.tile(&path("R")).expect("tile inserted anyway");
    assert!(!tile.colored());
    assert_eq!(tile.output_buffer().len(), 8);
    assert!(tile.output_buffer().iter().all(|&value| value == 0.0));

    // The tile lock was released; the next push proceeds normally.
    let result = cache
        .push(downloaded("R0", &[0.0], &[(0, 1)]), &[Some(RAMP)])
        .expect("push R0 after the failure");
    assert!(result.colored);
}

#[test]
fn aggregate_stats_track_the_bucket_wise_sum() {
    let mut cache = stock_cache();

    cache
        .push(downloaded("R", &[0.0], &[(0, 2), (10, 1)]), &[Some(RAMP)])
        .expect("push R");
    cache
        .push(downloaded("R0", &[0.0], &[(10, 3), (40, 1)]), &[Some(RAMP)])
        .expect("push R0");

    let mut expected = BufferStats::new();
    for tile_path in ["R", "R0"] {
        expected.accumulate(cache.tile(&path(tile_path)).expect("tile cached").buffer_stats());
    }
    assert_eq!(*cache.aggregate_stats(), expected);

    // Removal does not subtract: the aggregate only ever grows until flush.
    cache.remove(&path("R0"));
    assert_eq!(*cache.aggregate_stats(), expected);
}

#[test]
fn flush_clears_tiles_queue_and_stats() {
    let mut cache = stock_cache();

    cache
        .push(downloaded("R", &[0.0], &[(0, 1)]), &[Some(RAMP)])
        .expect("push R");
    cache
        .push(downloaded("R0", &[40.0], &[(70, 1)]), &[Some(RAMP)])
        .expect("push R0");
    assert!(cache.recolor_queue_len() > 0);

    cache.flush();
    assert!(cache.is_empty());
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.recolor_queue_len(), 0);
    assert!(cache.aggregate_stats().is_empty());
    assert_eq!(cache.drive_recolors(), 0);

    // The cache keeps working after a flush.
    cache
        .push(downloaded("R", &[0.0], &[(0, 1)]), &[Some(RAMP)])
        .expect("push after flush");
    assert_eq!(cache.len(), 1);
}

#[test]
fn unknown_brush_slots_degrade_to_null() {
    let mut cache = stock_cache();

    let result = cache
        .push(
            downloaded("R", &[0.0, 15.0], &[(0, 1), (30, 1)]),
            &[Some("local://nonexistent"), Some(RAMP)],
        )
        .expect("push with one bad slot");
    assert_eq!(result.output_point_size, 5);

    let tile = cache.tile(&path("R")).expect("tile cached");
    assert_eq!(tile.staging_attributes().len(), 2);
    assert_eq!(tile.staging_attributes()[0], Value::Null);
    assert_eq!(tile.staging_attributes()[1]["kind"], "range");
    // The empty slot's channel stays zeroed while the ramp channel colors:
    // point 1 sits at z=15, contour 95 of the 0..40 range.
    assert_eq!(tile.output_buffer()[3], 0.0);
    assert_ne!(tile.output_buffer()[1 * 5 + 3 + 1], 0.0);
}

#[test]
fn push_with_no_usable_brushes_is_rejected() {
    let mut cache = stock_cache();
    assert_eq!(
        cache
            .push(downloaded("R", &[0.0], &[(0, 1)]), &[Some("local://nonexistent")])
            .expect_err("push must fail"),
        PushError::NoUsableBrushes
    );
    assert!(cache.is_empty());

    // No brushes requested at all is a plain position-only tile.
    let result = cache
        .push(downloaded("R", &[0.0], &[(0, 1)]), &[])
        .expect("push without brushes");
    assert_eq!(result.output_point_size, 3);
}

#[test]
fn mismatched_buffer_length_is_rejected() {
    let mut cache = stock_cache();
    let mut bad = downloaded("R", &[0.0, 5.0], &[(0, 1)]);
    bad.data.pop();
    assert_eq!(
        cache.push(bad, &[Some(RAMP)]).expect_err("push must fail"),
        PushError::BufferLengthMismatch
    );
    assert!(cache.is_empty());
}

#[test]
fn schema_mismatch_skips_the_slot_for_that_tile_only() {
    let mut cache = stock_cache();

    let result = cache
        .push(
            downloaded("R", &[0.0], &[(0, 1)]),
            &[Some("local://ramp?field=intensity")],
        )
        .expect("push with unusable field");
    assert!(result.colored);

    let tile = cache.tile(&path("R")).expect("tile cached");
    assert_eq!(tile.staging_attributes()[0], Value::Null);
    assert_eq!(tile.output_buffer()[3], 0.0);
}

#[test]
fn stable_stats_leave_nothing_stale() {
    let mut cache = stock_cache();

    cache
        .push(
            downloaded("R0", &[0.0, 15.0], &[(0, 1), (70, 1)]),
            &[Some(RAMP)],
        )
        .expect("push R0");
    // Entirely inside the existing range: counts grow, min/max do not.
    cache
        .push(downloaded("R00", &[10.0], &[(10, 5)]), &[Some(RAMP)])
        .expect("push R00");

    assert_eq!(cache.recolor_queue_len(), 0);
}
