//! Shader programs, reflection tables and draw calls
//!
//! [`Shading`] is what the scene needs from a shader system: linking programs
//! with reflected attribute, uniform and sampler tables, selecting a program
//! option, setting uniforms, binding textures by sampler name and issuing
//! draws through a [`GraphicsBackend`]. [`WgslShading`] implements it for WGSL
//! sources validated and reflected with naga.

use std::fs;
use std::path::{Path, PathBuf};

use glam::{Mat4, Vec2, Vec3, Vec4};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::compute::options_prelude;
use crate::rtt::{GraphicsBackend, TextureHandle};

/// Option name of a program's default variant.
pub const DEFAULT_OPTION: &str = "#";

/// Vertices of the light volume sphere (a subdivided icosahedron generated in
/// the vertex stage).
pub const LIGHT_VOLUME_VERTICES: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    UInt(u32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl UniformValue {
    /// Append the value to a uniform block, honouring WGSL alignment.
    pub fn write_to(&self, block: &mut Vec<u8>) {
        let align = match self {
            Self::Float(_) | Self::Int(_) | Self::UInt(_) => 4,
            Self::Vec2(_) => 8,
            Self::Vec3(_) | Self::Vec4(_) | Self::Mat4(_) => 16,
        };
        block.resize(block.len().next_multiple_of(align), 0);
        match self {
            Self::Float(v) => block.extend_from_slice(bytemuck::bytes_of(v)),
            Self::Int(v) => block.extend_from_slice(bytemuck::bytes_of(v)),
            Self::UInt(v) => block.extend_from_slice(bytemuck::bytes_of(v)),
            Self::Vec2(v) => block.extend_from_slice(bytemuck::bytes_of(v)),
            Self::Vec3(v) => block.extend_from_slice(bytemuck::bytes_of(v)),
            Self::Vec4(v) => block.extend_from_slice(bytemuck::bytes_of(v)),
            Self::Mat4(v) => block.extend_from_slice(bytemuck::bytes_of(v)),
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<Vec2> for UniformValue {
    fn from(value: Vec2) -> Self {
        Self::Vec2(value)
    }
}

impl From<Vec3> for UniformValue {
    fn from(value: Vec3) -> Self {
        Self::Vec3(value)
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        Self::Vec4(value)
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        Self::Mat4(value)
    }
}

/// Geometry of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    FullscreenTriangle,
    /// Sphere around a point light, scaled by the light radius in the shader.
    LightVolume,
    Skybox,
    Mesh { vertices: u32, instances: u32 },
}

impl Primitive {
    #[must_use]
    pub const fn vertex_count(self) -> u32 {
        match self {
            Self::FullscreenTriangle => 3,
            Self::LightVolume => LIGHT_VOLUME_VERTICES,
            Self::Skybox => 36,
            Self::Mesh { vertices, .. } => vertices,
        }
    }

    #[must_use]
    pub const fn instance_count(self) -> u32 {
        match self {
            Self::Mesh { instances, .. } => instances,
            _ => 1,
        }
    }
}

/// One draw with the program variant, uniforms and textures it uses.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub program: String,
    pub option: String,
    pub primitive: Primitive,
    pub uniforms: Vec<(String, UniformValue)>,
    /// (texture unit, texture)
    pub textures: Vec<(u32, TextureHandle)>,
}

impl DrawCall {
    /// Fullscreen triangle with the default option and no inputs.
    #[must_use]
    pub fn fullscreen(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            option: DEFAULT_OPTION.to_string(),
            primitive: Primitive::FullscreenTriangle,
            uniforms: Vec::new(),
            textures: Vec::new(),
        }
    }

    #[must_use]
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| *value)
    }

    /// Uniforms packed into one block in the order they were set.
    #[must_use]
    pub fn uniform_block(&self) -> Vec<u8> {
        let mut block = Vec::new();
        for (_, value) in &self.uniforms {
            value.write_to(&mut block);
        }
        block.resize(block.len().next_multiple_of(16), 0);
        block
    }
}

/// Text of one shader stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    Inline(String),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSources {
    pub vertex: ShaderSource,
    /// Not available on WGSL targets; linking fails if set.
    pub geometry: Option<ShaderSource>,
    pub fragment: ShaderSource,
}

impl ShaderSources {
    /// One WGSL module holding both the vertex and the fragment entry point.
    #[must_use]
    pub fn module(source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            vertex: ShaderSource::Inline(source.clone()),
            geometry: None,
            fragment: ShaderSource::Inline(source),
        }
    }
}

/// Location of a uniform inside a uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocation {
    pub group: u32,
    pub binding: u32,
    pub offset: u32,
}

/// Reflection tables of a linked program variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramInfo {
    pub name: String,
    pub option: String,
    /// Vertex input name to location.
    pub attributes: FxHashMap<String, u32>,
    /// Uniform block member name to location.
    pub uniforms: FxHashMap<String, UniformLocation>,
    /// Uniform block name to binding.
    pub blocks: FxHashMap<String, u32>,
    /// Sampled texture name to texture unit.
    pub samplers: FxHashMap<String, u32>,
}

/// Shader system consumed by the scene.
pub trait Shading {
    /// Link `sources` as the `option` variant of program `name`.
    ///
    /// Returns `None` after logging the build log if linking fails.
    fn compile_and_link(
        &mut self,
        name: &str,
        option: &str,
        sources: &ShaderSources,
    ) -> Option<&ProgramInfo>;

    fn program(&self, name: &str, option: &str) -> Option<&ProgramInfo>;

    /// Select a program variant for the following uniforms, textures and draws.
    fn use_program(&mut self, name: &str, option: &str) -> bool;

    fn set_uniform(&mut self, name: &str, value: UniformValue);

    /// Bind `texture` to the sampler called `name` in the current program.
    fn bind_texture(&mut self, name: &str, texture: TextureHandle) -> bool;

    fn draw(&mut self, gfx: &mut dyn GraphicsBackend, primitive: Primitive);

    /// Deselect the current program.
    fn disable(&mut self);

    /// Re-link every program from its sources. Returns false if any failed.
    fn reload(&mut self) -> bool;
}

struct Linked {
    sources: ShaderSources,
    info: ProgramInfo,
}

/// WGSL program registry.
pub struct WgslShading {
    shader_path: PathBuf,
    programs: FxHashMap<(String, String), Linked>,
    current: Option<(String, String)>,
    uniforms: Vec<(String, UniformValue)>,
    textures: Vec<(u32, TextureHandle)>,
    warned: FxHashSet<String>,
}

impl WgslShading {
    pub fn new(shader_path: impl Into<PathBuf>) -> Self {
        Self {
            shader_path: shader_path.into(),
            programs: FxHashMap::default(),
            current: None,
            uniforms: Vec::new(),
            textures: Vec::new(),
            warned: FxHashSet::default(),
        }
    }

    #[must_use]
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn current(&self) -> Option<(&str, &str)> {
        self.current
            .as_ref()
            .map(|(name, option)| (name.as_str(), option.as_str()))
    }

    fn warn_once(&mut self, message: String) {
        if self.warned.insert(message.clone()) {
            log::warn!("{message}");
        }
    }

    fn current_info(&self) -> Option<&ProgramInfo> {
        self.current
            .as_ref()
            .and_then(|key| self.programs.get(key))
            .map(|linked| &linked.info)
    }

    fn load(&self, source: &ShaderSource) -> Result<String, String> {
        match source {
            ShaderSource::Inline(text) => Ok(text.clone()),
            ShaderSource::File(path) => {
                let full = resolve(&self.shader_path, path);
                fs::read_to_string(&full)
                    .map_err(|e| format!("failed to read shader {}: {e}", full.display()))
            }
        }
    }

    fn link(&self, name: &str, option: &str, sources: &ShaderSources) -> Result<ProgramInfo, String> {
        if sources.geometry.is_some() {
            return Err("geometry stages are not supported".to_string());
        }
        let prelude = if option == DEFAULT_OPTION {
            String::new()
        } else {
            options_prelude(&format!("-D OPTION_{}", option.to_ascii_uppercase()))
        };

        let vertex = parse(&format!("{prelude}{}", self.load(&sources.vertex)?))?;
        let fragment = parse(&format!("{prelude}{}", self.load(&sources.fragment)?))?;

        let mut info = ProgramInfo {
            name: name.to_string(),
            option: option.to_string(),
            ..ProgramInfo::default()
        };

        let vs = vertex
            .entry_points
            .iter()
            .find(|ep| ep.stage == naga::ShaderStage::Vertex)
            .ok_or("no vertex entry point")?;
        if !fragment
            .entry_points
            .iter()
            .any(|ep| ep.stage == naga::ShaderStage::Fragment)
        {
            return Err("no fragment entry point".to_string());
        }

        for arg in &vs.function.arguments {
            match (&arg.binding, &vertex.types[arg.ty].inner) {
                (Some(naga::Binding::Location { location, .. }), _) => {
                    if let Some(name) = &arg.name {
                        info.attributes.insert(name.clone(), *location);
                    }
                }
                (None, naga::TypeInner::Struct { members, .. }) => {
                    for member in members {
                        if let (Some(naga::Binding::Location { location, .. }), Some(name)) =
                            (&member.binding, &member.name)
                        {
                            info.attributes.insert(name.clone(), *location);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut textures: Vec<((u32, u32), String)> = Vec::new();
        for module in [&vertex, &fragment] {
            for (_, var) in module.global_variables.iter() {
                let (Some(binding), Some(var_name)) = (&var.binding, &var.name) else {
                    continue;
                };
                match (var.space, &module.types[var.ty].inner) {
                    (naga::AddressSpace::Uniform, inner) => {
                        info.blocks.insert(var_name.clone(), binding.binding);
                        if let naga::TypeInner::Struct { members, .. } = inner {
                            for member in members {
                                if let Some(member_name) = &member.name {
                                    info.uniforms.insert(
                                        member_name.clone(),
                                        UniformLocation {
                                            group: binding.group,
                                            binding: binding.binding,
                                            offset: member.offset,
                                        },
                                    );
                                }
                            }
                        }
                    }
                    (naga::AddressSpace::Handle, naga::TypeInner::Image { .. }) => {
                        let key = (binding.group, binding.binding);
                        if !textures.iter().any(|(k, _)| *k == key) {
                            textures.push((key, var_name.clone()));
                        }
                    }
                    _ => {}
                }
            }
        }
        textures.sort();
        for (unit, (_, texture)) in textures.into_iter().enumerate() {
            info.samplers.insert(texture, unit as u32);
        }
        Ok(info)
    }
}

impl Shading for WgslShading {
    fn compile_and_link(
        &mut self,
        name: &str,
        option: &str,
        sources: &ShaderSources,
    ) -> Option<&ProgramInfo> {
        match self.link(name, option, sources) {
            Ok(info) => {
                log::debug!(
                    "linked program {name}/{option}: {} attributes, {} uniforms, {} samplers",
                    info.attributes.len(),
                    info.uniforms.len(),
                    info.samplers.len()
                );
                let key = (name.to_string(), option.to_string());
                self.programs.insert(
                    key.clone(),
                    Linked {
                        sources: sources.clone(),
                        info,
                    },
                );
                self.programs.get(&key).map(|linked| &linked.info)
            }
            Err(log) => {
                log::error!("Compilation error in \"{name}/{option}\":\n{log}");
                None
            }
        }
    }

    fn program(&self, name: &str, option: &str) -> Option<&ProgramInfo> {
        self.programs
            .get(&(name.to_string(), option.to_string()))
            .map(|linked| &linked.info)
    }

    fn use_program(&mut self, name: &str, option: &str) -> bool {
        self.uniforms.clear();
        self.textures.clear();
        let key = (name.to_string(), option.to_string());
        if self.programs.contains_key(&key) {
            self.current = Some(key);
            true
        } else {
            self.current = None;
            self.warn_once(format!("program {name}/{option} is not linked"));
            false
        }
    }

    fn set_uniform(&mut self, name: &str, value: UniformValue) {
        let Some(info) = self.current_info() else {
            return;
        };
        if !info.uniforms.contains_key(name) {
            let message = format!("{}/{} has no uniform \"{name}\"", info.name, info.option);
            self.warn_once(message);
        }
        match self.uniforms.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.uniforms.push((name.to_string(), value)),
        }
    }

    fn bind_texture(&mut self, name: &str, texture: TextureHandle) -> bool {
        let Some(info) = self.current_info() else {
            return false;
        };
        let Some(&unit) = info.samplers.get(name) else {
            let message = format!("{}/{} has no sampler \"{name}\"", info.name, info.option);
            self.warn_once(message);
            return false;
        };
        self.textures.retain(|(u, _)| *u != unit);
        self.textures.push((unit, texture));
        true
    }

    fn draw(&mut self, gfx: &mut dyn GraphicsBackend, primitive: Primitive) {
        let Some((program, option)) = self.current.clone() else {
            log::trace!("draw without a program skipped");
            return;
        };
        // block order follows the declared member order
        let mut uniforms = self.uniforms.clone();
        if let Some(info) = self.current_info() {
            uniforms.sort_by_key(|(name, _)| info.uniforms.get(name).map_or(u32::MAX, |l| l.offset));
        }
        gfx.draw(&DrawCall {
            program,
            option,
            primitive,
            uniforms,
            textures: self.textures.clone(),
        });
    }

    fn disable(&mut self) {
        self.current = None;
        self.uniforms.clear();
        self.textures.clear();
    }

    fn reload(&mut self) -> bool {
        let keys: Vec<(String, String)> = self.programs.keys().cloned().collect();
        let mut ok = true;
        for (name, option) in keys {
            let Some(sources) = self.programs.get(&(name.clone(), option.clone())).map(|l| l.sources.clone())
            else {
                continue;
            };
            match self.link(&name, &option, &sources) {
                Ok(info) => {
                    if let Some(linked) = self.programs.get_mut(&(name, option)) {
                        linked.info = info;
                    }
                }
                Err(log) => {
                    // keep the previous variant usable
                    log::error!("Compilation error in \"{name}/{option}\":\n{log}");
                    ok = false;
                }
            }
        }
        self.warned.clear();
        log::info!("reloaded {} shader programs", self.programs.len());
        ok
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse(source: &str) -> Result<naga::Module, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| format!("validation failed: {e}"))?;
    Ok(module)
}
