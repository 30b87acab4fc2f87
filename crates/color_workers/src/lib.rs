//! Bounded pool of coloring workers.
//!
//! A job carries the serialized brush slots, the shared input buffer, and
//! the owned output buffer; the worker rebuilds the brushes, walks the
//! points, and packs one f32 color per brush channel. Buffers move with the
//! messages in both directions; at most N jobs run concurrently and surplus
//! jobs queue FIFO on the shared channel.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use brushes::{
    Brush, BrushRegistry, BrushRestoreError, BrushSlotTransfers, TransferDirection,
    begin_transfer_for_brushes, take_brushes_from_transfers,
};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use point_protocol::Schema;
use point_protocol::color::compress_color;

pub const DEFAULT_COLOR_WORKERS: usize = 5;

/// Points colored between stop-flag checks. Bounds how long a worker keeps
/// running after the pool begins shutdown.
pub const COLOR_BATCH_POINTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWorkerPoolConfig {
    pub workers: usize,
}

impl Default for ColorWorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_COLOR_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStartError {
    ZeroWorkers,
}

impl fmt::Display for PoolStartError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolStartError::ZeroWorkers => {
                write!(formatter, "color worker pool needs at least one worker")
            }
        }
    }
}

impl std::error::Error for PoolStartError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailed {
    BrushDecode { slot: usize },
    MissingPositionFields,
    InputLengthMismatch,
    OutputLengthMismatch,
    ChannelCountMismatch,
    WorkerGone,
}

impl fmt::Display for WorkerFailed {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailed::BrushDecode { slot } => {
                write!(formatter, "color job brush slot {slot} failed to decode")
            }
            WorkerFailed::MissingPositionFields => {
                write!(formatter, "color job schema is missing x/y/z fields")
            }
            WorkerFailed::InputLengthMismatch => {
                write!(formatter, "color job input buffer length mismatch")
            }
            WorkerFailed::OutputLengthMismatch => {
                write!(formatter, "color job output buffer length mismatch")
            }
            WorkerFailed::ChannelCountMismatch => {
                write!(formatter, "color job output point size disagrees with brush slots")
            }
            WorkerFailed::WorkerGone => {
                write!(formatter, "color worker went away before replying")
            }
        }
    }
}

impl std::error::Error for WorkerFailed {}

#[derive(Debug)]
pub struct ColorJobParams {
    pub brushes: BrushSlotTransfers,
    pub total_points: u32,
    pub input_buffer: Arc<Vec<f32>>,
    pub schema: Schema,
    pub output_buffer: Vec<f32>,
    pub output_point_size: usize,
}

#[derive(Debug)]
pub struct ColorJobOutput {
    pub job_id: u64,
    pub input_buffer: Arc<Vec<f32>>,
    pub output_buffer: Vec<f32>,
    pub brushes: BrushSlotTransfers,
}

/// Failed jobs hand their buffers back when the worker still held them, so
/// the caller can keep its tile alive uncolored.
#[derive(Debug)]
pub struct ColorJobFailure {
    pub job_id: u64,
    pub error: WorkerFailed,
    pub input_buffer: Option<Arc<Vec<f32>>>,
    pub output_buffer: Option<Vec<f32>>,
}

pub type ColorJobResponse = Result<ColorJobOutput, ColorJobFailure>;

struct ColorJob {
    job_id: u64,
    params: ColorJobParams,
    reply: Sender<ColorJobResponse>,
}

#[derive(Debug)]
pub struct ColorJobTicket {
    job_id: u64,
    receiver: Receiver<ColorJobResponse>,
}

impl ColorJobTicket {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Block until the worker replies. A dropped reply channel (worker
    /// crash or pool shutdown) surfaces as `WorkerGone` with no buffers.
    pub fn wait(self) -> ColorJobResponse {
        match self.receiver.recv() {
            Ok(response) => response,
            Err(_) => Err(ColorJobFailure {
                job_id: self.job_id,
                error: WorkerFailed::WorkerGone,
                input_buffer: None,
                output_buffer: None,
            }),
        }
    }
}

pub struct ColorWorkerPool {
    job_sender: Option<Sender<ColorJob>>,
    worker_handles: Vec<std::thread::JoinHandle<()>>,
    stop_requested: Arc<AtomicBool>,
    next_job_id: AtomicU64,
}

impl ColorWorkerPool {
    pub fn start(
        config: ColorWorkerPoolConfig,
        registry: Arc<BrushRegistry>,
    ) -> Result<Self, PoolStartError> {
        if config.workers == 0 {
            return Err(PoolStartError::ZeroWorkers);
        }

        let (job_sender, job_receiver) = unbounded::<ColorJob>();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let mut worker_handles = Vec::with_capacity(config.workers);
        for worker_index in 0..config.workers {
            let job_receiver = job_receiver.clone();
            let registry = Arc::clone(&registry);
            let stop_requested = Arc::clone(&stop_requested);
            let handle = std::thread::Builder::new()
                .name(format!("color_worker_{worker_index}"))
                .spawn(move || color_worker_loop(job_receiver, registry, stop_requested))
                .expect("spawn color worker thread");
            worker_handles.push(handle);
        }

        Ok(Self {
            job_sender: Some(job_sender),
            worker_handles,
            stop_requested,
            next_job_id: AtomicU64::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    pub fn push_job(&self, params: ColorJobParams) -> ColorJobTicket {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let (reply_sender, reply_receiver) = bounded(1);
        let sender = self
            .job_sender
            .as_ref()
            .expect("color worker pool already shut down");
        if let Err(send_error) = sender.send(ColorJob {
            job_id,
            params,
            reply: reply_sender,
        }) {
            let job = send_error.into_inner();
            let _ = job.reply.send(Err(ColorJobFailure {
                job_id,
                error: WorkerFailed::WorkerGone,
                input_buffer: Some(job.params.input_buffer),
                output_buffer: Some(job.params.output_buffer),
            }));
        }
        ColorJobTicket {
            job_id,
            receiver: reply_receiver,
        }
    }
}

impl Drop for ColorWorkerPool {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.job_sender.take();
        for handle in self.worker_handles.drain(..) {
            handle.join().expect("join color worker thread");
        }
    }
}

fn color_worker_loop(
    jobs: Receiver<ColorJob>,
    registry: Arc<BrushRegistry>,
    stop_requested: Arc<AtomicBool>,
) {
    while let Ok(job) = jobs.recv() {
        if stop_requested.load(Ordering::Acquire) {
            return;
        }
        let job_id = job.job_id;
        let response = execute_color_job(job_id, job.params, &registry, &stop_requested);
        let Some(response) = response else {
            // Shutdown mid-job; the dropped reply surfaces as WorkerGone.
            return;
        };
        if let Err(failure) = &response {
            log::warn!("color job {job_id} failed: {}", failure.error);
        }
        if job.reply.send(response).is_err() {
            log::debug!("color job {job_id} reply dropped before delivery");
        }
    }
}

fn execute_color_job(
    job_id: u64,
    params: ColorJobParams,
    registry: &BrushRegistry,
    stop_requested: &AtomicBool,
) -> Option<ColorJobResponse> {
    let ColorJobParams {
        brushes,
        total_points,
        input_buffer,
        schema,
        mut output_buffer,
        output_point_size,
    } = params;

    let failure = |error, input_buffer, output_buffer| {
        Some(Err(ColorJobFailure {
            job_id,
            error,
            input_buffer,
            output_buffer,
        }))
    };

    let total_points = total_points as usize;
    let stride = schema.point_stride();
    if input_buffer.len() != total_points * stride {
        return failure(
            WorkerFailed::InputLengthMismatch,
            Some(input_buffer),
            Some(output_buffer),
        );
    }
    if output_buffer.len() != total_points * output_point_size {
        return failure(
            WorkerFailed::OutputLengthMismatch,
            Some(input_buffer),
            Some(output_buffer),
        );
    }
    let Some(position_offsets) = schema.position_offsets() else {
        return failure(
            WorkerFailed::MissingPositionFields,
            Some(input_buffer),
            Some(output_buffer),
        );
    };
    if output_point_size != 3 + brushes.slot_count() {
        return failure(
            WorkerFailed::ChannelCountMismatch,
            Some(input_buffer),
            Some(output_buffer),
        );
    }

    let mut live_brushes =
        match take_brushes_from_transfers(registry, brushes, TransferDirection::MainToWorker) {
            Ok(live_brushes) => live_brushes,
            Err(error) => {
                let slot = match error {
                    BrushRestoreError::Create { slot, .. } => slot,
                    BrushRestoreError::Payload { slot, .. } => slot,
                };
                return failure(
                    WorkerFailed::BrushDecode { slot },
                    Some(input_buffer),
                    Some(output_buffer),
                );
            }
        };

    let completed = color_points(
        &live_brushes,
        &input_buffer,
        stride,
        position_offsets,
        &mut output_buffer,
        output_point_size,
        stop_requested,
    );
    if !completed {
        return None;
    }

    let returned = begin_transfer_for_brushes(&mut live_brushes, TransferDirection::WorkerToMain);
    Some(Ok(ColorJobOutput {
        job_id,
        input_buffer,
        output_buffer,
        brushes: returned,
    }))
}

/// Walk every point, batch by batch. Empty brush slots are skipped entirely
/// so their channels keep whatever the buffer already held: zeros on an
/// initial coloring, the previous colors on a partial recolor.
fn color_points(
    brushes: &[Option<Box<dyn Brush>>],
    input: &[f32],
    stride: usize,
    position_offsets: [usize; 3],
    output: &mut [f32],
    output_point_size: usize,
    stop_requested: &AtomicBool,
) -> bool {
    let total_points = input.len() / stride;
    let mut batch_start = 0;
    while batch_start < total_points {
        if stop_requested.load(Ordering::Acquire) {
            return false;
        }
        let batch_end = (batch_start + COLOR_BATCH_POINTS).min(total_points);
        for point_index in batch_start..batch_end {
            let point = &input[point_index * stride..(point_index + 1) * stride];
            let output_base = point_index * output_point_size;
            output[output_base] = point[position_offsets[0]];
            output[output_base + 1] = point[position_offsets[1]];
            output[output_base + 2] = point[position_offsets[2]];

            let mut rgb = [0_u8; 3];
            for (slot, brush) in brushes.iter().enumerate() {
                let Some(brush) = brush else {
                    continue;
                };
                brush.color_point(&mut rgb, point);
                output[output_base + 3 + slot] = compress_color(rgb[0], rgb[1], rgb[2]);
            }
        }
        batch_start = batch_end;
    }
    true
}
