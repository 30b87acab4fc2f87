//! The point buffer cache: owner of the octree tile map and the brush
//! coloring pipeline between the tile loader and the renderer.
//!
//! The cache is single-owner state driven from one control thread; its
//! blocking waits (worker jobs, tile locks) are the only suspension points.
//! Coloring itself runs on the worker pool. Recolors triggered by an insert
//! queue up and are drained serially by `drive_recolors`, which the shell
//! pumps on its loop tick. Serial draining keeps parent/child staging
//! reads consistent: no other recolor mutates siblings mid-cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use brushes::{
    Brush, BrushRegistry, BufferParams, NodeSelection, NodeSelectionStrategy, TransferDirection,
    begin_transfer_for_brushes, deserialize_brushes, end_transfer_onto_brushes, serialize_brush,
};
use color_workers::{ColorJobParams, ColorWorkerPool, WorkerFailed};
use point_protocol::{
    BufferStats, DownloadedBuffer, GeoTransform, RenderSpaceBounds, Schema, TreePath,
};
use serde_json::Value;

mod lock_table;
mod recolor;

pub use lock_table::TileLockTable;
pub use recolor::{RecolorEntry, RecolorQueue};

#[cfg(test)]
mod tests;

/// Floats per point ahead of the color channels: x, y, z.
pub const POSITION_FLOATS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    BufferLengthMismatch,
    NoUsableBrushes,
}

impl fmt::Display for PushError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::BufferLengthMismatch => {
                write!(formatter, "downloaded data length disagrees with schema and point count")
            }
            PushError::NoUsableBrushes => {
                write!(formatter, "no requested brush could be created")
            }
        }
    }
}

impl std::error::Error for PushError {}

#[derive(Debug)]
pub struct PushResult {
    /// Always false: the pusher performs the initial upload itself.
    pub update: bool,
    pub output_buffer: Arc<Vec<f32>>,
    pub output_point_size: usize,
    /// False when the coloring job failed and the buffer was left
    /// zero-filled; the renderer should still draw the tile.
    pub colored: bool,
}

/// One cached octree node.
#[derive(Debug)]
pub struct Tile {
    input_buffer: Arc<Vec<f32>>,
    schema: Schema,
    buffer_stats: BufferStats,
    render_space_bounds: RenderSpaceBounds,
    geo_transform: GeoTransform,
    total_points: u32,
    output_buffer: Arc<Vec<f32>>,
    output_point_size: usize,
    staging_attributes: Vec<Value>,
    update: bool,
    colored: bool,
}

impl Tile {
    pub fn input_buffer(&self) -> Arc<Vec<f32>> {
        Arc::clone(&self.input_buffer)
    }

    pub fn output_buffer(&self) -> Arc<Vec<f32>> {
        Arc::clone(&self.output_buffer)
    }

    pub fn output_point_size(&self) -> usize {
        self.output_point_size
    }

    pub fn total_points(&self) -> u32 {
        self.total_points
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn buffer_stats(&self) -> &BufferStats {
        &self.buffer_stats
    }

    pub fn render_space_bounds(&self) -> RenderSpaceBounds {
        self.render_space_bounds
    }

    pub fn geo_transform(&self) -> GeoTransform {
        self.geo_transform
    }

    pub fn staging_attributes(&self) -> &[Value] {
        &self.staging_attributes
    }

    /// True when the renderer should re-upload this tile's output buffer.
    pub fn update(&self) -> bool {
        self.update
    }

    pub fn colored(&self) -> bool {
        self.colored
    }
}

enum RecolorAbort {
    /// The tile was removed between enqueue and drain, or mid-job.
    TileGone,
    /// Every queued slot fell away (restore or schema failures).
    NoUsableSlots,
    Worker(WorkerFailed),
}

pub struct PointBufferCache {
    tiles: HashMap<TreePath, Tile>,
    aggregate_stats: BufferStats,
    recolor_queue: RecolorQueue,
    recolor_running: bool,
    lock_table: TileLockTable,
    workers: Arc<ColorWorkerPool>,
    registry: Arc<BrushRegistry>,
    render_request: Option<Box<dyn FnMut() + Send>>,
}

impl PointBufferCache {
    pub fn new(workers: Arc<ColorWorkerPool>, registry: Arc<BrushRegistry>) -> Self {
        Self {
            tiles: HashMap::new(),
            aggregate_stats: BufferStats::new(),
            recolor_queue: RecolorQueue::new(),
            recolor_running: false,
            lock_table: TileLockTable::new(),
            workers,
            registry,
            render_request: None,
        }
    }

    /// Callback fired after each successful recolor; the renderer responds
    /// by re-reading tiles whose `update` flag is set.
    pub fn set_render_request(&mut self, callback: Option<Box<dyn FnMut() + Send>>) {
        self.render_request = callback;
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn contains(&self, path: &TreePath) -> bool {
        self.tiles.contains_key(path)
    }

    pub fn tile(&self, path: &TreePath) -> Option<&Tile> {
        self.tiles.get(path)
    }

    /// Running bucket-wise sum of every ingested tile's stats. Monotone:
    /// `remove` does not subtract (accepted drift), only `flush` resets.
    pub fn aggregate_stats(&self) -> &BufferStats {
        &self.aggregate_stats
    }

    pub fn recolor_queue_len(&self) -> usize {
        self.recolor_queue.len()
    }

    pub fn recolor_queue_paths(&self) -> Vec<TreePath> {
        self.recolor_queue.paths()
    }

    /// Paths whose output buffer changed since the renderer last uploaded,
    /// in traversal order.
    pub fn updated_paths(&self) -> Vec<TreePath> {
        let mut paths: Vec<TreePath> = self
            .tiles
            .iter()
            .filter(|(_, tile)| tile.update)
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Renderer acknowledgment: clears the tile's `update` flag.
    pub fn mark_uploaded(&mut self, path: &TreePath) -> bool {
        match self.tiles.get_mut(path) {
            Some(tile) => {
                tile.update = false;
                true
            }
            None => false,
        }
    }

    /// Ingest one downloaded tile: merge its stats, prepare the brushes,
    /// color it on the worker pool under the tile lock, insert it, and
    /// queue recolors for every cached tile the insert invalidated.
    pub fn push(
        &mut self,
        downloaded: DownloadedBuffer,
        brush_uris: &[Option<&str>],
    ) -> Result<PushResult, PushError> {
        let DownloadedBuffer {
            data,
            total_points,
            schema,
            tree_path,
            render_space_bounds,
            buffer_stats,
            geo_transform,
        } = downloaded;

        if data.len() != total_points as usize * schema.point_stride() {
            return Err(PushError::BufferLengthMismatch);
        }

        let mut slots: Vec<Option<Box<dyn Brush>>> = Vec::with_capacity(brush_uris.len());
        let mut created = 0_usize;
        for uri in brush_uris {
            match uri {
                None => slots.push(None),
                Some(uri) => match self.registry.create_brush(uri) {
                    Ok(brush) => {
                        created += 1;
                        slots.push(Some(brush));
                    }
                    Err(error) => {
                        log::warn!("brush '{uri}' unavailable, slot left empty: {error}");
                        slots.push(None);
                    }
                },
            }
        }
        let requested = brush_uris.iter().filter(|uri| uri.is_some()).count();
        if requested > 0 && created == 0 {
            return Err(PushError::NoUsableBrushes);
        }

        let output_point_size = POSITION_FLOATS + slots.len();

        // Stats merge happens before prepare so every brush sees a running
        // total that already includes this tile.
        self.aggregate_stats.accumulate(&buffer_stats);

        let buffer_params = BufferParams {
            tree_path: tree_path.clone(),
            total_points,
            schema: schema.clone(),
            render_space_bounds,
            tile_stats: buffer_stats.clone(),
            point_cloud_stats: self.aggregate_stats.clone(),
            geo_transform,
        };
        self.prepare_slots(&mut slots, &buffer_params, &tree_path);

        let input_buffer = Arc::new(data);
        let output_buffer = vec![0.0_f32; total_points as usize * output_point_size];

        self.lock_table.lock(&tree_path);
        let ticket = self.workers.push_job(ColorJobParams {
            brushes: begin_transfer_for_brushes(&mut slots, TransferDirection::MainToWorker),
            total_points,
            input_buffer: Arc::clone(&input_buffer),
            schema: schema.clone(),
            output_buffer,
            output_point_size,
        });
        let response = ticket.wait();
        self.lock_table.unlock(&tree_path);

        // Local handles are reassigned from the response; the buffers sent
        // with the job may have moved.
        let (input_buffer, output_buffer, colored) = match response {
            Ok(output) => {
                if let Err(error) = end_transfer_onto_brushes(
                    &mut slots,
                    TransferDirection::WorkerToMain,
                    output.brushes,
                ) {
                    log::warn!("returned brush transfer for {tree_path} failed: {error}");
                }
                (output.input_buffer, output.output_buffer, true)
            }
            Err(failure) => {
                log::warn!(
                    "color job {} for {tree_path} failed, inserting uncolored: {}",
                    failure.job_id,
                    failure.error
                );
                let input_buffer = failure.input_buffer.unwrap_or(input_buffer);
                let output_buffer = match failure.output_buffer {
                    Some(mut buffer) => {
                        buffer.fill(0.0);
                        buffer
                    }
                    None => vec![0.0; total_points as usize * output_point_size],
                };
                (input_buffer, output_buffer, false)
            }
        };
        if output_buffer.len() != total_points as usize * output_point_size {
            panic!("color job returned a mis-sized output buffer for {tree_path}");
        }

        let staging_attributes: Vec<Value> = slots
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|brush| brush.staging_attributes())
                    .unwrap_or(Value::Null)
            })
            .collect();
        // Node selection is snapshotted while the brushes are still
        // prepared; the impact walk below runs after unprepare.
        let selections: Vec<Option<NodeSelection>> = slots
            .iter()
            .map(|slot| slot.as_ref().map(|brush| brush.node_selection_strategy()))
            .collect();
        for slot in slots.iter_mut() {
            if let Some(brush) = slot {
                brush.unprepare();
            }
        }

        let tile = Tile {
            input_buffer,
            schema,
            buffer_stats,
            render_space_bounds,
            geo_transform,
            total_points,
            output_buffer: Arc::new(output_buffer),
            output_point_size,
            staging_attributes,
            update: false,
            colored,
        };
        let result_buffer = Arc::clone(&tile.output_buffer);
        self.tiles.insert(tree_path.clone(), tile);

        self.enqueue_impacts(&tree_path, &slots, &selections, &buffer_params);

        Ok(PushResult {
            update: false,
            output_buffer: result_buffer,
            output_point_size,
            colored,
        })
    }

    /// Drop a tile and scrub its pending recolors.
    pub fn remove(&mut self, path: &TreePath) -> bool {
        let removed = self.tiles.remove(path).is_some();
        self.recolor_queue.remove_path(path);
        removed
    }

    /// Clear the tile map, the recolor queue, and the running stats.
    pub fn flush(&mut self) {
        self.tiles.clear();
        self.recolor_queue.clear();
        self.aggregate_stats.clear();
    }

    /// Drain the recolor queue, one tile at a time, firing the render
    /// request after each successful repaint. Returns how many tiles were
    /// repainted. Re-entrant calls (from inside the render callback) are
    /// no-ops while a drain is already running.
    pub fn drive_recolors(&mut self) -> usize {
        if self.recolor_running {
            return 0;
        }
        self.recolor_running = true;
        let mut processed = 0_usize;
        while let Some(entry) = self.recolor_queue.pop_front() {
            let path = entry.path.clone();
            match self.recolor_node(entry) {
                Ok(()) => {
                    processed += 1;
                    if let Some(render_request) = self.render_request.as_mut() {
                        render_request();
                    }
                }
                Err(RecolorAbort::TileGone) => {
                    log::debug!("recolor of {path} aborted: tile gone");
                }
                Err(RecolorAbort::NoUsableSlots) => {
                    log::debug!("recolor of {path} skipped: no usable brush slots");
                }
                Err(RecolorAbort::Worker(error)) => {
                    log::warn!("recolor of {path} dropped: {error}");
                }
            }
        }
        self.recolor_running = false;
        processed
    }

    fn prepare_slots(
        &self,
        slots: &mut [Option<Box<dyn Brush>>],
        params: &BufferParams,
        path: &TreePath,
    ) {
        let parent = path.parent().and_then(|parent| self.tiles.get(&parent));
        let children: Vec<&Tile> = (0..point_protocol::OCTANT_COUNT)
            .filter_map(|octant| self.tiles.get(&path.child(octant)))
            .collect();

        for (slot_index, slot) in slots.iter_mut().enumerate() {
            let Some(brush) = slot else {
                continue;
            };
            let missing = brush
                .required_schema_fields()
                .into_iter()
                .find(|field| !params.schema.has_field(field));
            if let Some(field) = missing {
                log::debug!("brush slot {slot_index} skipped for {path}: schema lacks '{field}'");
                *slot = None;
                continue;
            }

            let parent_staging = parent
                .and_then(|tile| tile.staging_attributes.get(slot_index))
                .filter(|staging| !staging.is_null());
            let children_staging: Vec<Value> = children
                .iter()
                .filter_map(|tile| tile.staging_attributes.get(slot_index))
                .cloned()
                .collect();
            if let Err(error) = brush.prepare(params, parent_staging, &children_staging) {
                log::debug!("brush slot {slot_index} skipped for {path}: {error}");
                *slot = None;
            }
        }
    }

    /// Walk the cached tiles each brush declares reachable and queue the
    /// stale ones. Absent staging counts as stale; tiles with fewer slots
    /// than the pushing tile cannot grow a channel and are skipped.
    fn enqueue_impacts(
        &mut self,
        pushed_path: &TreePath,
        slots: &[Option<Box<dyn Brush>>],
        selections: &[Option<NodeSelection>],
        params: &BufferParams,
    ) {
        for (slot_index, (slot, selection)) in slots.iter().zip(selections).enumerate() {
            let (Some(brush), Some(selection)) = (slot, selection) else {
                continue;
            };
            let candidates: Vec<TreePath> = match selection.strategy {
                NodeSelectionStrategy::None => continue,
                NodeSelectionStrategy::Ancestors => pushed_path
                    .ancestors()
                    .filter(|ancestor| self.tiles.contains_key(ancestor))
                    .collect(),
                NodeSelectionStrategy::All => {
                    let mut paths: Vec<TreePath> = self
                        .tiles
                        .keys()
                        .filter(|path| *path != pushed_path)
                        .cloned()
                        .collect();
                    // Lexicographic order equals depth-first traversal
                    // order for this path alphabet.
                    paths.sort();
                    paths
                }
            };

            for candidate in candidates {
                let tile = self
                    .tiles
                    .get(&candidate)
                    .expect("impact candidate vanished mid-walk");
                let Some(other_staging) = tile.staging_attributes.get(slot_index) else {
                    continue;
                };
                let stale = other_staging.is_null()
                    || brush.buffer_needs_recolor(&selection.params, other_staging);
                if stale {
                    self.recolor_queue.enqueue(
                        candidate,
                        slot_index,
                        serialize_brush(brush.as_ref()),
                        tile.staging_attributes.len(),
                        &params.point_cloud_stats,
                    );
                }
            }
        }
    }

    fn recolor_node(&mut self, entry: RecolorEntry) -> Result<(), RecolorAbort> {
        // Fairness hint: yield once before taking the tile lock.
        std::thread::yield_now();

        let Some(tile) = self.tiles.get(&entry.path) else {
            return Err(RecolorAbort::TileGone);
        };
        let total_points = tile.total_points;
        let output_point_size = tile.output_point_size;
        let schema = tile.schema.clone();
        let buffer_params = BufferParams {
            tree_path: entry.path.clone(),
            total_points,
            schema: schema.clone(),
            render_space_bounds: tile.render_space_bounds,
            tile_stats: tile.buffer_stats.clone(),
            point_cloud_stats: entry.captured_stats,
            geo_transform: tile.geo_transform,
        };

        let mut slots = match deserialize_brushes(&self.registry, &entry.slots) {
            Ok(slots) => slots,
            Err(error) => {
                log::warn!("recolor brushes for {} failed to restore: {error}", entry.path);
                return Err(RecolorAbort::NoUsableSlots);
            }
        };
        self.prepare_slots(&mut slots, &buffer_params, &entry.path);
        if slots.iter().all(Option::is_none) {
            return Err(RecolorAbort::NoUsableSlots);
        }

        // Reuse the tile's buffers: input is shared, output is recycled
        // when the renderer has let go of its handle.
        let (input_buffer, output_buffer) = {
            let tile = self
                .tiles
                .get_mut(&entry.path)
                .expect("recolor tile vanished before job dispatch");
            let output_arc = std::mem::replace(&mut tile.output_buffer, Arc::new(Vec::new()));
            let output_buffer =
                Arc::try_unwrap(output_arc).unwrap_or_else(|shared| (*shared).clone());
            (Arc::clone(&tile.input_buffer), output_buffer)
        };

        self.lock_table.lock(&entry.path);
        let ticket = self.workers.push_job(ColorJobParams {
            brushes: begin_transfer_for_brushes(&mut slots, TransferDirection::MainToWorker),
            total_points,
            input_buffer,
            schema,
            output_buffer,
            output_point_size,
        });
        let response = ticket.wait();
        self.lock_table.unlock(&entry.path);

        match response {
            Ok(output) => {
                if let Err(error) = end_transfer_onto_brushes(
                    &mut slots,
                    TransferDirection::WorkerToMain,
                    output.brushes,
                ) {
                    log::warn!("returned brush transfer for {} failed: {error}", entry.path);
                }
                let Some(tile) = self.tiles.get_mut(&entry.path) else {
                    return Err(RecolorAbort::TileGone);
                };
                tile.input_buffer = output.input_buffer;
                tile.output_buffer = Arc::new(output.output_buffer);
                for (slot_index, slot) in slots.iter().enumerate() {
                    if let Some(brush) = slot {
                        tile.staging_attributes[slot_index] = brush.staging_attributes();
                    }
                }
                for slot in slots.iter_mut() {
                    if let Some(brush) = slot {
                        brush.unprepare();
                    }
                }
                tile.update = true;
                tile.colored = true;
                Ok(())
            }
            Err(failure) => {
                // Keep the tile's buffers whole even though the repaint was
                // dropped.
                if let Some(tile) = self.tiles.get_mut(&entry.path) {
                    if let Some(input_buffer) = failure.input_buffer {
                        tile.input_buffer = input_buffer;
                    }
                    tile.output_buffer = Arc::new(failure.output_buffer.unwrap_or_else(|| {
                        vec![0.0; total_points as usize * output_point_size]
                    }));
                }
                Err(RecolorAbort::Worker(failure.error))
            }
        }
    }
}
