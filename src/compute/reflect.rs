//! WGSL kernel validation and argument reflection
//!
//! Kernels are WGSL compute entry points. Arguments are the group 0 resource
//! bindings, and argument index `i` is `@binding(i)`.

use super::kernel::ArgKind;

/// Reflected argument layout of one kernel entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub args: Vec<ArgKind>,
    pub workgroup_size: [u32; 3],
}

/// Parse, validate and reflect `source`, returning the layout of `entry_point`.
///
/// The error string is the full build log.
pub fn reflect(source: &str, entry_point: &str) -> Result<KernelLayout, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| format!("validation failed: {e}"))?;

    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.name == entry_point)
        .ok_or_else(|| format!("entry point \"{entry_point}\" not found"))?;
    if entry.stage != naga::ShaderStage::Compute {
        return Err(format!(
            "entry point \"{entry_point}\" is a {:?} shader, expected compute",
            entry.stage
        ));
    }

    let mut bindings: Vec<(u32, ArgKind)> = Vec::new();
    for (_, var) in module.global_variables.iter() {
        let Some(binding) = var.binding.as_ref() else {
            continue;
        };
        if binding.group != 0 {
            return Err(format!(
                "binding group {} is not supported, kernel arguments live in group 0",
                binding.group
            ));
        }

        let inner = &module.types[var.ty].inner;
        let kind = match (var.space, inner) {
            (naga::AddressSpace::Storage { access }, _) => ArgKind::StorageBuffer {
                read_only: !access.contains(naga::StorageAccess::STORE),
            },
            (naga::AddressSpace::Uniform, _) => ArgKind::Uniform {
                size: inner.size(module.to_ctx()),
            },
            (naga::AddressSpace::Handle, naga::TypeInner::Image { dim, class, .. }) => {
                let volume = matches!(dim, naga::ImageDimension::D3);
                match class {
                    naga::ImageClass::Storage { .. } => ArgKind::StorageImage { volume },
                    _ => ArgKind::SampledImage { volume },
                }
            }
            (naga::AddressSpace::Handle, naga::TypeInner::Sampler { .. }) => ArgKind::Sampler,
            (space, _) => return Err(format!("unsupported argument address space {space:?}")),
        };
        bindings.push((binding.binding, kind));
    }

    bindings.sort_by_key(|(binding, _)| *binding);
    for (expected, (binding, _)) in bindings.iter().enumerate() {
        if *binding != expected as u32 {
            return Err(format!(
                "kernel arguments must use contiguous bindings, found @binding({binding}) at argument #{expected}"
            ));
        }
    }

    Ok(KernelLayout {
        args: bindings.into_iter().map(|(_, kind)| kind).collect(),
        workgroup_size: entry.workgroup_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE: &str = r"
struct Params { factor: f32, count: u32 }

@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(64)
fn scale(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x < params.count {
        output[id.x] = input[id.x] * params.factor;
    }
}
";

    #[test]
    fn test_reflects_argument_layout() {
        let layout = reflect(SCALE, "scale").unwrap();
        assert_eq!(
            layout.args,
            vec![
                ArgKind::StorageBuffer { read_only: true },
                ArgKind::StorageBuffer { read_only: false },
                ArgKind::Uniform { size: 8 },
            ]
        );
        assert_eq!(layout.workgroup_size, [64, 1, 1]);
    }

    #[test]
    fn test_missing_entry_point() {
        let err = reflect(SCALE, "missing").unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn test_parse_error_produces_log() {
        let err = reflect("@compute fn broken( {", "broken").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_gap_in_bindings_is_rejected() {
        let src = r"
@group(0) @binding(1) var<storage, read_write> data: array<u32>;
@compute @workgroup_size(1)
fn main() { data[0] = 1u; }
";
        assert!(reflect(src, "main").is_err());
    }
}
