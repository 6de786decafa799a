//! Frame statistics

use std::collections::VecDeque;
use std::time::Duration;

/// Frame time history plus what went wrong during the frames.
#[derive(Debug)]
pub struct FrameStats {
    frame_times: VecDeque<Duration>,
    max_samples: usize,
    fps: f32,
    avg_frame_time_ms: f32,
    max_frame_time_ms: f32,
    total_frames: u64,
    /// Graphics errors of the last frame
    frame_graphics_errors: usize,
    total_graphics_errors: u64,
    /// Frames that reported at least one graphics error
    frames_with_errors: u64,
    kernel_reloads: u64,
    shader_reloads: u64,
    failed_reloads: u64,
}

impl FrameStats {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(120)
    }

    /// Keep the last `samples` frame times for averaging.
    #[must_use]
    pub fn with_history(samples: usize) -> Self {
        let samples = samples.max(1);
        Self {
            frame_times: VecDeque::with_capacity(samples),
            max_samples: samples,
            fps: 0.0,
            avg_frame_time_ms: 0.0,
            max_frame_time_ms: 0.0,
            total_frames: 0,
            frame_graphics_errors: 0,
            total_graphics_errors: 0,
            frames_with_errors: 0,
            kernel_reloads: 0,
            shader_reloads: 0,
            failed_reloads: 0,
        }
    }

    /// Record one frame and the number of graphics errors it reported.
    pub fn record_frame(&mut self, delta: Duration, graphics_errors: usize) {
        self.total_frames += 1;
        self.frame_graphics_errors = graphics_errors;
        self.total_graphics_errors += graphics_errors as u64;
        if graphics_errors > 0 {
            self.frames_with_errors += 1;
        }

        if self.frame_times.len() >= self.max_samples {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(delta);

        let total: Duration = self.frame_times.iter().sum();
        let total_secs = total.as_secs_f32();
        let count = self.frame_times.len() as f32;
        if total_secs > 0.0 {
            self.avg_frame_time_ms = total_secs / count * 1000.0;
            self.fps = count / total_secs;
        } else {
            self.avg_frame_time_ms = 0.0;
            self.fps = 0.0;
        }
        self.max_frame_time_ms = self
            .frame_times
            .iter()
            .max()
            .map_or(0.0, |d| d.as_secs_f32() * 1000.0);
    }

    pub fn record_kernel_reload(&mut self, ok: bool) {
        self.kernel_reloads += 1;
        if !ok {
            self.failed_reloads += 1;
        }
    }

    pub fn record_shader_reload(&mut self, ok: bool) {
        self.shader_reloads += 1;
        if !ok {
            self.failed_reloads += 1;
        }
    }

    #[must_use]
    pub const fn fps(&self) -> f32 {
        self.fps
    }

    #[must_use]
    pub const fn avg_frame_time_ms(&self) -> f32 {
        self.avg_frame_time_ms
    }

    #[must_use]
    pub const fn max_frame_time_ms(&self) -> f32 {
        self.max_frame_time_ms
    }

    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total_frames
    }

    #[must_use]
    pub const fn frame_graphics_errors(&self) -> usize {
        self.frame_graphics_errors
    }

    #[must_use]
    pub const fn total_graphics_errors(&self) -> u64 {
        self.total_graphics_errors
    }

    #[must_use]
    pub const fn frames_with_errors(&self) -> u64 {
        self.frames_with_errors
    }

    #[must_use]
    pub const fn kernel_reloads(&self) -> u64 {
        self.kernel_reloads
    }

    #[must_use]
    pub const fn shader_reloads(&self) -> u64 {
        self.shader_reloads
    }

    #[must_use]
    pub const fn failed_reloads(&self) -> u64 {
        self.failed_reloads
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} frames | {:.1} fps | {:.2}ms avg, {:.2}ms max | {} graphics errors in {} frames",
            self.total_frames,
            self.fps,
            self.avg_frame_time_ms,
            self.max_frame_time_ms,
            self.total_graphics_errors,
            self.frames_with_errors
        )
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}
