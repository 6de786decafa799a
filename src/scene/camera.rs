//! Camera, matrix stacks and scoped view state

use std::ops::{Deref, DerefMut};

use glam::{Mat4, Vec2, Vec3};

/// Perspective camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Eye position in world space
    pub position: Vec3,
    /// Direction the camera is looking at
    pub direction: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    yaw: f32,
    pitch: f32,
}

impl Camera {
    #[must_use]
    pub fn new() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            near: 0.1,
            far: 1000.0,
            aspect: 16.0 / 9.0,
            yaw: -90.0_f32.to_radians(),
            pitch: 0.0,
        }
    }

    /// Camera at `position` looking at `target`
    #[must_use]
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let direction = (target - position).normalize();
        let mut camera = Self::new();
        camera.position = position;
        camera.direction = direction;
        camera.up = up;
        camera.yaw = direction.z.atan2(direction.x);
        camera.pitch = direction.y.asin();
        camera
    }

    #[must_use]
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.direction, self.up)
    }

    #[must_use]
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    pub fn set_aspect(&mut self, width: u32, height: u32) {
        self.aspect = width as f32 / height.max(1) as f32;
    }

    pub fn set_planes(&mut self, near: f32, far: f32) {
        self.near = near;
        self.far = far;
    }

    /// Orientation as (pitch, yaw) in degrees.
    #[must_use]
    pub fn rotation(&self) -> Vec2 {
        Vec2::new(self.pitch.to_degrees(), self.yaw.to_degrees())
    }

    /// Set the orientation from (pitch, yaw) in degrees.
    pub fn set_rotation(&mut self, rotation: Vec2) {
        self.pitch = rotation.x.to_radians();
        self.yaw = rotation.y.to_radians();
        self.update_direction();
    }

    fn update_direction(&mut self) {
        // keep away from the poles
        let max_pitch = 89.0_f32.to_radians();
        self.pitch = self.pitch.clamp(-max_pitch, max_pitch);
        self.direction = Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize();
    }

    #[must_use]
    pub fn right(&self) -> Vec3 {
        self.direction.cross(self.up).normalize()
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

/// A stack of matrices whose top is the current transform.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixStack {
    stack: Vec<Mat4>,
}

impl MatrixStack {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: vec![Mat4::IDENTITY],
        }
    }

    #[must_use]
    pub fn top(&self) -> Mat4 {
        self.stack.last().copied().unwrap_or(Mat4::IDENTITY)
    }

    /// Replace the current matrix.
    pub fn load(&mut self, matrix: Mat4) {
        if let Some(top) = self.stack.last_mut() {
            *top = matrix;
        }
    }

    /// Post-multiply the current matrix.
    pub fn mult(&mut self, matrix: Mat4) {
        if let Some(top) = self.stack.last_mut() {
            *top *= matrix;
        }
    }

    /// Duplicate the current matrix.
    pub fn push(&mut self) {
        self.stack.push(self.top());
    }

    /// Restore the matrix saved by the last [`push`](Self::push). The bottom
    /// entry is never popped.
    pub fn pop(&mut self) -> bool {
        if self.stack.len() > 1 {
            self.stack.pop();
            true
        } else {
            log::warn!("matrix stack underflow");
            false
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

impl Default for MatrixStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Camera plus the projection and modelview stacks the passes draw with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewState {
    pub camera: Camera,
    pub projection: MatrixStack,
    pub modelview: MatrixStack,
    /// Viewport the alpha sorter projects into.
    pub screen: (u32, u32),
}

impl ViewState {
    #[must_use]
    pub fn new(camera: Camera, screen: (u32, u32)) -> Self {
        let mut view = Self {
            camera,
            projection: MatrixStack::new(),
            modelview: MatrixStack::new(),
            screen,
        };
        view.apply_camera();
        view
    }

    /// Load the camera's matrices into the top of both stacks.
    pub fn apply_camera(&mut self) {
        self.projection.load(self.camera.projection_matrix());
        self.modelview.load(self.camera.view_matrix());
    }

    #[must_use]
    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.top()
    }

    #[must_use]
    pub fn modelview_matrix(&self) -> Mat4 {
        self.modelview.top()
    }

    /// Combined modelview-projection matrix.
    #[must_use]
    pub fn mvp(&self) -> Mat4 {
        self.projection.top() * self.modelview.top()
    }

    /// Save the camera and both stacks. Everything is restored when the guard
    /// drops, including on early return.
    pub fn scoped(&mut self) -> ViewGuard<'_> {
        let saved_camera = self.camera;
        self.projection.push();
        self.modelview.push();
        ViewGuard { view: self, saved_camera }
    }
}

/// Restores a [`ViewState`] on drop.
#[derive(Debug)]
pub struct ViewGuard<'a> {
    view: &'a mut ViewState,
    saved_camera: Camera,
}

impl Deref for ViewGuard<'_> {
    type Target = ViewState;

    fn deref(&self) -> &ViewState {
        self.view
    }
}

impl DerefMut for ViewGuard<'_> {
    fn deref_mut(&mut self) -> &mut ViewState {
        self.view
    }
}

impl Drop for ViewGuard<'_> {
    fn drop(&mut self) {
        self.view.modelview.pop();
        self.view.projection.pop();
        self.view.camera = self.saved_camera;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_stack_push_pop() {
        let mut stack = MatrixStack::new();
        let translate = Mat4::from_translation(Vec3::X);
        stack.load(translate);
        stack.push();
        stack.mult(Mat4::from_scale(Vec3::splat(2.0)));
        assert_ne!(stack.top(), translate);
        assert!(stack.pop());
        assert_eq!(stack.top(), translate);
        assert!(!stack.pop());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_guard_restores_view() {
        let mut view = ViewState::new(Camera::new(), (640, 480));
        let before = view.clone();

        {
            let mut guard = view.scoped();
            guard.camera.position = Vec3::new(10.0, 2.0, -3.0);
            guard.camera.set_rotation(Vec2::new(30.0, 45.0));
            guard.apply_camera();
            assert_ne!(guard.camera, before.camera);
            assert_ne!(guard.modelview_matrix(), before.modelview_matrix());
        }

        assert_eq!(view, before);
    }

    #[test]
    fn test_guard_restores_on_early_return() {
        fn capture_pass(view: &mut ViewState) -> Option<()> {
            let mut guard = view.scoped();
            guard.camera.position = Vec3::splat(100.0);
            guard.apply_camera();
            None?;
            Some(())
        }

        let mut view = ViewState::new(Camera::new(), (64, 64));
        let before = view.clone();
        assert!(capture_pass(&mut view).is_none());
        assert_eq!(view, before);
    }

    #[test]
    fn test_rotation_roundtrip() {
        let mut camera = Camera::new();
        camera.set_rotation(Vec2::new(20.0, 135.0));
        let rotation = camera.rotation();
        assert!((rotation.x - 20.0).abs() < 1e-4);
        assert!((rotation.y - 135.0).abs() < 1e-4);
    }
}
