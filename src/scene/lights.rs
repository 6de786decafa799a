//! Scene lights
//!
//! Point and spot lights are drawn as light volumes around their position,
//! directional lights as a fullscreen pass.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::rtt::{DepthFunc, Winding};

/// Type of light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum LightType {
    /// Emits in all directions up to its radius
    #[default]
    Point = 0,
    /// Parallel rays (like the sun)
    Directional = 1,
    /// Cone of light, bounded by its radius
    Spot = 2,
}

/// Uniform block of one light, as read by the light-pass program.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LightUniforms {
    /// xyz position, w radius (0 for directional lights)
    pub position: [f32; 4],
    /// rgb color, w inverse squared radius
    pub color: [f32; 4],
    /// rgb ambient (directional only)
    pub ambient: [f32; 4],
    /// xyz direction, w cosine of the outer cone (-1 disables the cone)
    pub spot: [f32; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    kind: LightType,
    /// World position, or the direction towards the light for directional lights
    pub position: Vec3,
    pub color: Vec3,
    pub ambient: Vec3,
    /// Spot direction
    pub direction: Vec3,
    /// Outer cone angle in radians
    pub cone_angle: f32,
    radius: f32,
    inv_sqr_radius: f32,
    enabled: bool,
}

impl Light {
    #[must_use]
    pub fn point(position: Vec3, color: Vec3, radius: f32) -> Self {
        let mut light = Self {
            kind: LightType::Point,
            position,
            color,
            ambient: Vec3::ZERO,
            direction: Vec3::NEG_Y,
            cone_angle: std::f32::consts::PI,
            radius: 0.0,
            inv_sqr_radius: 0.0,
            enabled: true,
        };
        light.set_radius(radius);
        light
    }

    #[must_use]
    pub fn directional(position: Vec3, color: Vec3, ambient: Vec3) -> Self {
        Self {
            kind: LightType::Directional,
            ambient,
            ..Self::point(position, color, 0.0)
        }
    }

    #[must_use]
    pub fn spot(position: Vec3, direction: Vec3, color: Vec3, radius: f32) -> Self {
        Self {
            kind: LightType::Spot,
            direction: direction.normalize(),
            cone_angle: 35.0_f32.to_radians(),
            ..Self::point(position, color, radius)
        }
    }

    /// Set the outer cone angle in degrees
    #[must_use]
    pub fn with_cone_angle(mut self, degrees: f32) -> Self {
        self.cone_angle = degrees.to_radians();
        self
    }

    #[must_use]
    pub const fn kind(&self) -> LightType {
        self.kind
    }

    #[must_use]
    pub const fn radius(&self) -> f32 {
        self.radius
    }

    /// `1 / radius²`, 0 for an unbounded light.
    #[must_use]
    pub const fn inv_sqr_radius(&self) -> f32 {
        self.inv_sqr_radius
    }

    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius.max(0.0);
        self.inv_sqr_radius = if self.radius > 0.0 {
            1.0 / (self.radius * self.radius)
        } else {
            0.0
        };
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether it is drawn as a light volume.
    #[must_use]
    pub fn has_volume(&self) -> bool {
        matches!(self.kind, LightType::Point | LightType::Spot)
    }

    /// Whether the camera is inside the light volume. The near plane is
    /// subtracted since the volume is clipped by it.
    #[must_use]
    pub fn contains_camera(&self, camera: Vec3, near: f32) -> bool {
        camera.distance(self.position) - near <= self.radius
    }

    /// Winding and depth test for drawing the volume: from inside, back faces
    /// are drawn where they lie behind the stored depth.
    #[must_use]
    pub fn volume_state(&self, camera: Vec3, near: f32) -> (Winding, DepthFunc) {
        if self.contains_camera(camera, near) {
            (Winding::Cw, DepthFunc::Greater)
        } else {
            (Winding::Ccw, DepthFunc::LessEqual)
        }
    }

    #[must_use]
    pub fn uniforms(&self) -> LightUniforms {
        let (position, color) = match self.kind {
            LightType::Directional => (self.position.extend(0.0), self.color.extend(0.0)),
            LightType::Point | LightType::Spot => (
                self.position.extend(self.radius),
                self.color.extend(self.inv_sqr_radius),
            ),
        };
        let spot = match self.kind {
            LightType::Spot => self.direction.extend(self.cone_angle.cos()),
            LightType::Point | LightType::Directional => Vec4::new(0.0, 0.0, 0.0, -1.0),
        };
        LightUniforms {
            position: position.into(),
            color: color.into(),
            ambient: self.ambient.extend(0.0).into(),
            spot: spot.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inside_outside_rule() {
        let light = Light::point(Vec3::ZERO, Vec3::ONE, 10.0);
        let near = 1.0;

        // 10.5 - 1.0 <= 10
        assert!(light.contains_camera(Vec3::new(10.5, 0.0, 0.0), near));
        assert_eq!(
            light.volume_state(Vec3::new(10.5, 0.0, 0.0), near),
            (Winding::Cw, DepthFunc::Greater)
        );
        assert_eq!(
            light.volume_state(Vec3::new(0.0, 0.0, 20.0), near),
            (Winding::Ccw, DepthFunc::LessEqual)
        );
    }

    #[test]
    fn test_uniform_packing() {
        let light = Light::point(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.5, 0.5, 1.0), 2.0);
        let uniforms = light.uniforms();
        assert_eq!(uniforms.position, [1.0, 2.0, 3.0, 2.0]);
        assert_eq!(uniforms.color, [0.5, 0.5, 1.0, 0.25]);
        assert_eq!(uniforms.spot[3], -1.0);

        let sun = Light::directional(Vec3::Y, Vec3::ONE, Vec3::splat(0.1));
        assert_eq!(sun.uniforms().position[3], 0.0);
        assert!(!sun.has_volume());
        assert_eq!(bytemuck::bytes_of(&sun.uniforms()).len(), 64);
    }

    #[test]
    fn test_radius_updates_falloff() {
        let mut light = Light::spot(Vec3::ZERO, Vec3::new(0.0, -2.0, 0.0), Vec3::ONE, 4.0);
        assert_eq!(light.direction, Vec3::NEG_Y);
        assert_eq!(light.inv_sqr_radius(), 1.0 / 16.0);
        light.set_radius(0.0);
        assert_eq!(light.inv_sqr_radius(), 0.0);
    }
}
