//! Environment probes
//!
//! A probe renders the scene from its own viewpoint into a private set of
//! frame buffers, for reflections and environment capture.

use glam::{Vec2, Vec3};

use super::frame::FrameBuffers;
use crate::core::PoolIndex;

/// Stable handle to a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeHandle(pub(crate) PoolIndex);

/// How often a probe is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFrequency {
    /// The next `n` frames, then never again
    Once(u32),
    EveryFrame,
    /// Every `n`th frame
    NthFrame(u32),
}

#[derive(Debug)]
pub struct EnvironmentProbe {
    pub position: Vec3,
    /// (pitch, yaw) in degrees
    pub rotation: Vec2,
    size: (u32, u32),
    capture_alpha: bool,
    frequency: ProbeFrequency,
    counter: u32,
    pub(crate) buffers: Option<FrameBuffers>,
}

impl EnvironmentProbe {
    /// Probe capturing both hemispheres side by side, so its buffers are twice
    /// as wide as `size`.
    #[must_use]
    pub fn new(position: Vec3, rotation: Vec2, size: (u32, u32), capture_alpha: bool) -> Self {
        Self {
            position,
            rotation,
            size: (size.0 * 2, size.1),
            capture_alpha,
            frequency: ProbeFrequency::EveryFrame,
            counter: 0,
            buffers: None,
        }
    }

    /// Buffer size of the probe.
    #[must_use]
    pub const fn size(&self) -> (u32, u32) {
        self.size
    }

    #[must_use]
    pub const fn captures_alpha(&self) -> bool {
        self.capture_alpha
    }

    #[must_use]
    pub const fn frequency(&self) -> ProbeFrequency {
        self.frequency
    }

    pub fn set_frequency(&mut self, frequency: ProbeFrequency) {
        self.counter = match frequency {
            ProbeFrequency::Once(frames) => frames,
            ProbeFrequency::EveryFrame => 0,
            ProbeFrequency::NthFrame(n) => n.max(1),
        };
        self.frequency = frequency;
    }

    /// Frame buffers the probe renders into, once created by the scene.
    #[must_use]
    pub const fn buffers(&self) -> Option<&FrameBuffers> {
        self.buffers.as_ref()
    }

    /// Advance the capture policy by one frame and report whether the probe
    /// renders this frame.
    pub fn tick(&mut self) -> bool {
        match self.frequency {
            ProbeFrequency::Once(_) => {
                if self.counter > 0 {
                    self.counter -= 1;
                    true
                } else {
                    false
                }
            }
            ProbeFrequency::EveryFrame => true,
            ProbeFrequency::NthFrame(n) => {
                self.counter = self.counter.saturating_sub(1);
                if self.counter == 0 {
                    self.counter = n.max(1);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> EnvironmentProbe {
        EnvironmentProbe::new(Vec3::ZERO, Vec2::ZERO, (64, 64), false)
    }

    #[test]
    fn test_dual_size() {
        assert_eq!(probe().size(), (128, 64));
    }

    #[test]
    fn test_once_counts_down() {
        let mut probe = probe();
        probe.set_frequency(ProbeFrequency::Once(2));
        let frames: Vec<bool> = (0..4).map(|_| probe.tick()).collect();
        assert_eq!(frames, vec![true, true, false, false]);
    }

    #[test]
    fn test_every_nth_frame() {
        let mut probe = probe();
        probe.set_frequency(ProbeFrequency::NthFrame(3));
        let frames: Vec<bool> = (0..7).map(|_| probe.tick()).collect();
        assert_eq!(frames, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn test_every_frame() {
        let mut probe = probe();
        assert!((0..3).all(|_| probe.tick()));
    }
}
