//! Particle systems
//!
//! The scene advances every [`ParticleManager`] once per frame without a time
//! step; managers keep their own clock. Particles are drawn in the material
//! pass after alpha objects.

use std::ops::Range;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3, Vec4};

use super::drawable::DrawContext;
use super::shading::{Primitive, DEFAULT_OPTION};

/// Advanced and drawn by the scene.
pub trait ParticleManager {
    /// Advance the simulation by one frame.
    fn run(&mut self);

    /// Draw into the scene buffer. The g-buffer depth is available through
    /// `ctx.buffers` for soft particles.
    fn draw(&mut self, ctx: &mut DrawContext<'_>);
}

/// One live particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub position: Vec3,
    pub velocity: Vec3,
    pub color: Vec4,
    pub size: f32,
    /// Seconds since spawn
    pub age: f32,
    pub lifetime: f32,
}

impl Particle {
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.age < self.lifetime
    }
}

/// Per-particle data in the layout a storage buffer or compute kernel reads.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ParticleVertex {
    /// xyz position, w size
    pub position_size: [f32; 4],
    pub color: [f32; 4],
}

/// How an emitter spawns particles.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitterConfig {
    /// Live particles at most
    pub capacity: usize,
    /// Particles per second
    pub rate: f32,
    pub lifetime: Range<f32>,
    pub speed: Range<f32>,
    /// Axis of the emission cone
    pub direction: Vec3,
    /// Half angle of the emission cone in degrees
    pub spread: f32,
    pub size: Range<f32>,
    /// Color at spawn and at the end of the lifetime
    pub colors: [Vec4; 2],
    pub acceleration: Vec3,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            rate: 100.0,
            lifetime: 1.0..2.0,
            speed: 1.0..3.0,
            direction: Vec3::Y,
            spread: 30.0,
            size: 0.1..0.3,
            colors: [Vec4::ONE, Vec4::new(1.0, 1.0, 1.0, 0.0)],
            acceleration: Vec3::new(0.0, -9.81, 0.0),
        }
    }
}

impl EmitterConfig {
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_rate(mut self, rate: f32) -> Self {
        self.rate = rate;
        self
    }

    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Range<f32>) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_cone(mut self, direction: Vec3, spread: f32) -> Self {
        self.direction = direction.normalize_or(Vec3::Y);
        self.spread = spread;
        self
    }

    #[must_use]
    pub fn with_colors(mut self, start: Vec4, end: Vec4) -> Self {
        self.colors = [start, end];
        self
    }

    #[must_use]
    pub fn with_acceleration(mut self, acceleration: Vec3) -> Self {
        self.acceleration = acceleration;
        self
    }
}

/// Spawns and integrates particles around a point.
#[derive(Debug)]
pub struct ParticleEmitter {
    pub config: EmitterConfig,
    pub origin: Vec3,
    particles: Vec<Particle>,
    /// Fractional particles carried over to the next update
    pending: f32,
    emitting: bool,
    rng: Lcg,
}

impl ParticleEmitter {
    #[must_use]
    pub fn new(config: EmitterConfig) -> Self {
        Self {
            particles: Vec::with_capacity(config.capacity),
            config,
            origin: Vec3::ZERO,
            pending: 0.0,
            emitting: true,
            rng: Lcg(0x2545_f491),
        }
    }

    #[must_use]
    pub fn at(mut self, origin: Vec3) -> Self {
        self.origin = origin;
        self
    }

    pub fn set_emitting(&mut self, emitting: bool) {
        self.emitting = emitting;
        if !emitting {
            self.pending = 0.0;
        }
    }

    #[must_use]
    pub const fn is_emitting(&self) -> bool {
        self.emitting
    }

    #[must_use]
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Live particles packed for upload.
    #[must_use]
    pub fn vertices(&self) -> Vec<ParticleVertex> {
        self.particles
            .iter()
            .map(|p| ParticleVertex {
                position_size: p.position.extend(p.size).into(),
                color: p.color.into(),
            })
            .collect()
    }

    /// Integrate live particles over `dt` seconds, drop the expired ones and
    /// spawn new ones at the configured rate.
    pub fn update(&mut self, dt: f32) {
        let [start, end] = self.config.colors;
        let acceleration = self.config.acceleration;
        for particle in &mut self.particles {
            particle.age += dt;
            particle.velocity += acceleration * dt;
            particle.position += particle.velocity * dt;
            particle.color = start.lerp(end, (particle.age / particle.lifetime).min(1.0));
        }
        self.particles.retain(Particle::is_alive);

        if !self.emitting {
            return;
        }
        self.pending += self.config.rate * dt;
        let room = self.config.capacity.saturating_sub(self.particles.len());
        let count = (self.pending as usize).min(room);
        self.pending -= self.pending.floor();
        for _ in 0..count {
            let particle = self.spawn();
            self.particles.push(particle);
        }
    }

    fn spawn(&mut self) -> Particle {
        let config = &self.config;
        let rng = &mut self.rng;

        // uniform direction inside the cone around +Z, rotated onto the axis
        let cos_max = config.spread.to_radians().cos();
        let cos_theta = 1.0 - rng.unit() * (1.0 - cos_max);
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        let phi = rng.unit() * std::f32::consts::TAU;
        let local = Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);
        let direction = Quat::from_rotation_arc(Vec3::Z, config.direction.normalize_or(Vec3::Y)) * local;

        Particle {
            position: self.origin,
            velocity: direction * rng.in_range(&config.speed),
            color: config.colors[0],
            size: rng.in_range(&config.size),
            age: 0.0,
            lifetime: rng.in_range(&config.lifetime).max(f32::EPSILON),
        }
    }
}

/// Deterministic generator so emitters replay identically.
#[derive(Debug, Clone, Copy)]
struct Lcg(u32);

impl Lcg {
    /// Uniform in [0, 1)
    fn unit(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (self.0 >> 8) as f32 / (1u32 << 24) as f32
    }

    fn in_range(&mut self, range: &Range<f32>) -> f32 {
        range.start + (range.end - range.start) * self.unit()
    }
}

/// Where a manager takes its time step from.
#[derive(Debug, Clone, Copy)]
pub enum ParticleClock {
    /// Wall time since the previous run, capped at `max_step`
    Realtime { last: Option<Instant>, max_step: f32 },
    /// The same step every run
    Fixed(f32),
}

/// Emitter-backed [`ParticleManager`], drawn with the `PARTICLE` program.
#[derive(Debug)]
pub struct EmitterManager {
    emitters: Vec<ParticleEmitter>,
    clock: ParticleClock,
    elapsed: f32,
}

impl EmitterManager {
    pub const PROGRAM: &'static str = "PARTICLE";

    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(ParticleClock::Realtime {
            last: None,
            max_step: 0.1,
        })
    }

    #[must_use]
    pub fn with_clock(clock: ParticleClock) -> Self {
        Self {
            emitters: Vec::new(),
            clock,
            elapsed: 0.0,
        }
    }

    pub fn add_emitter(&mut self, emitter: ParticleEmitter) -> usize {
        self.emitters.push(emitter);
        self.emitters.len() - 1
    }

    #[must_use]
    pub fn emitter(&self, index: usize) -> Option<&ParticleEmitter> {
        self.emitters.get(index)
    }

    pub fn emitter_mut(&mut self, index: usize) -> Option<&mut ParticleEmitter> {
        self.emitters.get_mut(index)
    }

    /// Simulated seconds so far.
    #[must_use]
    pub const fn elapsed(&self) -> f32 {
        self.elapsed
    }

    fn step(&mut self) -> f32 {
        match &mut self.clock {
            ParticleClock::Fixed(step) => *step,
            ParticleClock::Realtime { last, max_step } => {
                let now = Instant::now();
                let step = last.map_or(0.0, |l| now.duration_since(l).as_secs_f32());
                *last = Some(now);
                step.min(*max_step)
            }
        }
    }
}

impl Default for EmitterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticleManager for EmitterManager {
    fn run(&mut self) {
        let step = self.step();
        self.elapsed += step;
        for emitter in &mut self.emitters {
            emitter.update(step);
        }
    }

    fn draw(&mut self, ctx: &mut DrawContext<'_>) {
        if !ctx.shading.use_program(Self::PROGRAM, DEFAULT_OPTION) {
            return;
        }
        let camera = ctx.view.camera;
        ctx.shading.set_uniform("mvpm", ctx.view.mvp().into());
        ctx.shading.set_uniform("camera_right", camera.right().into());
        ctx.shading.set_uniform("camera_up", camera.right().cross(camera.direction).into());
        for particle in self.emitters.iter().flat_map(|e| e.particles.iter()) {
            ctx.shading.set_uniform("particle_position", particle.position.into());
            ctx.shading.set_uniform("particle_size", particle.size.into());
            ctx.shading.set_uniform("particle_color", particle.color.into());
            ctx.draw(Primitive::Mesh {
                vertices: 6,
                instances: 1,
            });
        }
        ctx.shading.disable();
    }
}
