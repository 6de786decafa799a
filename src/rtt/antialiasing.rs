//! Antialiasing modes and supersampled resolutions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Antialiasing mode of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AntiAliasing {
    #[default]
    None,
    Msaa1,
    Msaa2,
    Msaa4,
    Msaa8,
    Msaa16,
    Msaa32,
    Msaa64,
    /// Coverage sampling, 4 color / 8 coverage samples
    Csaa8,
    Csaa8Q,
    Csaa16,
    Csaa16Q,
    Csaa32,
    Csaa32Q,
    Ssaa2,
    Ssaa4,
    Fxaa,
    /// 4/3x supersampling followed by FXAA
    Ssaa4_3Fxaa,
    Ssaa2Fxaa,
}

impl AntiAliasing {
    pub const ALL: [Self; 19] = [
        Self::None,
        Self::Msaa1,
        Self::Msaa2,
        Self::Msaa4,
        Self::Msaa8,
        Self::Msaa16,
        Self::Msaa32,
        Self::Msaa64,
        Self::Csaa8,
        Self::Csaa8Q,
        Self::Csaa16,
        Self::Csaa16Q,
        Self::Csaa32,
        Self::Csaa32Q,
        Self::Ssaa2,
        Self::Ssaa4,
        Self::Fxaa,
        Self::Ssaa4_3Fxaa,
        Self::Ssaa2Fxaa,
    ];

    /// Configuration name, e.g. `"SSAA_4_3_FXAA"`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Msaa1 => "MSAA_1",
            Self::Msaa2 => "MSAA_2",
            Self::Msaa4 => "MSAA_4",
            Self::Msaa8 => "MSAA_8",
            Self::Msaa16 => "MSAA_16",
            Self::Msaa32 => "MSAA_32",
            Self::Msaa64 => "MSAA_64",
            Self::Csaa8 => "CSAA_8",
            Self::Csaa8Q => "CSAA_8Q",
            Self::Csaa16 => "CSAA_16",
            Self::Csaa16Q => "CSAA_16Q",
            Self::Csaa32 => "CSAA_32",
            Self::Csaa32Q => "CSAA_32Q",
            Self::Ssaa2 => "SSAA_2",
            Self::Ssaa4 => "SSAA_4",
            Self::Fxaa => "FXAA",
            Self::Ssaa4_3Fxaa => "SSAA_4_3_FXAA",
            Self::Ssaa2Fxaa => "SSAA_2_FXAA",
        }
    }

    /// Human-readable label, e.g. `"4/3xSSAA + FXAA"`.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Msaa1 => "MSAA1",
            Self::Msaa2 => "MSAA2",
            Self::Msaa4 => "MSAA4",
            Self::Msaa8 => "MSAA8",
            Self::Msaa16 => "MSAA16",
            Self::Msaa32 => "MSAA32",
            Self::Msaa64 => "MSAA64",
            Self::Csaa8 => "CSAA8",
            Self::Csaa8Q => "CSAA8Q",
            Self::Csaa16 => "CSAA16",
            Self::Csaa16Q => "CSAA16Q",
            Self::Csaa32 => "CSAA32",
            Self::Csaa32Q => "CSAA32Q",
            Self::Ssaa2 => "2xSSAA",
            Self::Ssaa4 => "4xSSAA",
            Self::Fxaa => "FXAA",
            Self::Ssaa4_3Fxaa => "4/3xSSAA + FXAA",
            Self::Ssaa2Fxaa => "2xSSAA + FXAA",
        }
    }

    /// Supersample factor (1.0 when not supersampled).
    #[must_use]
    pub const fn scale(self) -> f32 {
        match self {
            Self::Ssaa2 | Self::Ssaa2Fxaa => 2.0,
            Self::Ssaa4 => 4.0,
            Self::Ssaa4_3Fxaa => 4.0 / 3.0,
            _ => 1.0,
        }
    }

    /// Stored color samples per pixel (0 for single-sampled modes).
    #[must_use]
    pub const fn samples(self) -> u32 {
        match self {
            Self::Msaa1 => 1,
            Self::Msaa2 => 2,
            Self::Msaa4 | Self::Csaa8 | Self::Csaa16 | Self::Csaa32 => 4,
            Self::Msaa8 | Self::Csaa8Q | Self::Csaa16Q | Self::Csaa32Q => 8,
            Self::Msaa16 => 16,
            Self::Msaa32 => 32,
            Self::Msaa64 => 64,
            _ => 0,
        }
    }

    /// (color, coverage) samples of coverage-sampled modes.
    ///
    /// The 32-sample ratios are a starting default, not a verified hardware contract.
    #[must_use]
    pub const fn coverage(self) -> Option<(u32, u32)> {
        match self {
            Self::Csaa8 => Some((4, 8)),
            Self::Csaa8Q => Some((8, 8)),
            Self::Csaa16 => Some((4, 16)),
            Self::Csaa16Q => Some((8, 16)),
            Self::Csaa32 => Some((4, 32)),
            Self::Csaa32Q => Some((8, 32)),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_coverage_sampled(self) -> bool {
        self.coverage().is_some()
    }

    /// Whether rendering goes to separate multisample storage that is resolved
    /// into the sampled textures at the end of a pass.
    #[must_use]
    pub const fn requires_resolve(self) -> bool {
        self.samples() > 1
    }

    #[must_use]
    pub const fn is_fxaa(self) -> bool {
        matches!(self, Self::Fxaa | Self::Ssaa4_3Fxaa | Self::Ssaa2Fxaa)
    }

    #[must_use]
    pub fn is_supersampled(self) -> bool {
        self.scale() > 1.0
    }

    /// Next smaller supersample setting (halved factor), if one exists.
    #[must_use]
    pub const fn halved(self) -> Option<Self> {
        match self {
            Self::Ssaa4 => Some(Self::Ssaa2),
            _ => None,
        }
    }

    /// The same mode with supersampling removed (FXAA combinations keep FXAA).
    #[must_use]
    pub const fn without_supersampling(self) -> Self {
        match self {
            Self::Ssaa2 | Self::Ssaa4 => Self::None,
            Self::Ssaa4_3Fxaa | Self::Ssaa2Fxaa => Self::Fxaa,
            other => other,
        }
    }

    /// Plain multisampling with the same number of color samples.
    #[must_use]
    pub const fn without_coverage(self) -> Self {
        match self.coverage() {
            Some((4, _)) => Self::Msaa4,
            Some(_) => Self::Msaa8,
            None => self,
        }
    }

    /// Multisample mode with `samples` color samples.
    #[must_use]
    pub const fn msaa(samples: u32) -> Self {
        match samples {
            0 => Self::None,
            1 => Self::Msaa1,
            2 | 3 => Self::Msaa2,
            4..=7 => Self::Msaa4,
            8..=15 => Self::Msaa8,
            16..=31 => Self::Msaa16,
            32..=63 => Self::Msaa32,
            _ => Self::Msaa64,
        }
    }
}

impl fmt::Display for AntiAliasing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unknown antialiasing name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAntiAliasingError(pub String);

impl fmt::Display for ParseAntiAliasingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown antialiasing mode \"{}\"", self.0)
    }
}

impl std::error::Error for ParseAntiAliasingError {}

impl FromStr for AntiAliasing {
    type Err = ParseAntiAliasingError;

    /// Accepts configuration names and labels, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|aa| {
                aa.name().eq_ignore_ascii_case(trimmed) || aa.label().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| ParseAntiAliasingError(s.to_string()))
    }
}

impl TryFrom<String> for AntiAliasing {
    type Error = ParseAntiAliasingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AntiAliasing> for String {
    fn from(value: AntiAliasing) -> Self {
        value.name().to_string()
    }
}

/// Resolution of `size` scaled by `scale`, rounded up to even dimensions.
///
/// A scale of exactly 1.0 returns `size` unchanged.
#[must_use]
pub fn resolution_for_scale(scale: f32, size: (u32, u32)) -> (u32, u32) {
    if scale == 1.0 {
        return size;
    }
    let scaled = |v: u32| {
        // tolerate f32 noise such as 4/3 * 480 = 640.00003
        let exact = f64::from(scale) * f64::from(v);
        let rounded = (exact - 1e-3).ceil().max(0.0) as u32;
        rounded + rounded % 2
    };
    (scaled(size.0), scaled(size.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_for_scale() {
        assert_eq!(resolution_for_scale(2.0, (640, 480)), (1280, 960));
        assert_eq!(resolution_for_scale(4.0 / 3.0, (640, 480)), (854, 640));
        assert_eq!(resolution_for_scale(1.0, (641, 479)), (641, 479));
        assert_eq!(resolution_for_scale(2.0, (1, 1)), (2, 2));
    }

    #[test]
    fn test_parse_names_and_labels() {
        assert_eq!("SSAA_4_3_FXAA".parse(), Ok(AntiAliasing::Ssaa4_3Fxaa));
        assert_eq!("4/3xSSAA + FXAA".parse(), Ok(AntiAliasing::Ssaa4_3Fxaa));
        assert_eq!("msaa_4".parse(), Ok(AntiAliasing::Msaa4));
        assert!("MSAA_3".parse::<AntiAliasing>().is_err());

        for aa in AntiAliasing::ALL {
            assert_eq!(aa.to_string().parse(), Ok(aa));
        }
    }

    #[test]
    fn test_resolve_only_for_multisample_storage() {
        assert!(AntiAliasing::Msaa4.requires_resolve());
        assert!(AntiAliasing::Csaa16Q.requires_resolve());
        assert!(!AntiAliasing::Msaa1.requires_resolve());
        assert!(!AntiAliasing::Ssaa4.requires_resolve());
        assert!(!AntiAliasing::Ssaa2Fxaa.requires_resolve());
        assert!(!AntiAliasing::None.requires_resolve());
    }

    #[test]
    fn test_degradation_paths() {
        assert_eq!(AntiAliasing::Ssaa4.halved(), Some(AntiAliasing::Ssaa2));
        assert_eq!(AntiAliasing::Ssaa2.halved(), None);
        assert_eq!(
            AntiAliasing::Ssaa4_3Fxaa.without_supersampling(),
            AntiAliasing::Fxaa
        );
        assert_eq!(AntiAliasing::Ssaa2.without_supersampling(), AntiAliasing::None);
        assert_eq!(AntiAliasing::Csaa16.without_coverage(), AntiAliasing::Msaa4);
        assert_eq!(AntiAliasing::Csaa32Q.without_coverage(), AntiAliasing::Msaa8);
        assert_eq!(AntiAliasing::msaa(6), AntiAliasing::Msaa4);
    }
}
