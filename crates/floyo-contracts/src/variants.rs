use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// FLUX.2 endpoint family a node talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flux2Variant {
    Pro,
    Flex,
}

impl Flux2Variant {
    pub const ALL: [Flux2Variant; 2] = [Flux2Variant::Pro, Flux2Variant::Flex];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pro => "pro",
            Self::Flex => "flex",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Pro => "https://api.bfl.ai/v1/flux-2-pro",
            Self::Flex => "https://api.bfl.ai/v1/flux-2-flex",
        }
    }

    pub fn base_url_env(self) -> &'static str {
        match self {
            Self::Pro => "BFL_BASE_URL",
            Self::Flex => "BFL_FLEX_BASE_URL",
        }
    }

    /// Highest `input_image_N` slot accepted by edit requests.
    pub fn max_reference_slot(self) -> usize {
        match self {
            Self::Pro => 8,
            Self::Flex => 10,
        }
    }

    /// Flex exposes `guidance` and `steps`; pro ignores them.
    pub fn supports_sampling_controls(self) -> bool {
        matches!(self, Self::Flex)
    }
}

impl fmt::Display for Flux2Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Flux2Variant {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pro" | "flux-2-pro" => Ok(Self::Pro),
            "flex" | "flux-2-flex" => Ok(Self::Flex),
            other => Err(format!("unknown FLUX.2 variant '{other}' (expected pro or flex)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Flux2Variant;

    #[test]
    fn parses_short_and_model_names() {
        assert_eq!("pro".parse::<Flux2Variant>(), Ok(Flux2Variant::Pro));
        assert_eq!(" Flux-2-Flex ".parse::<Flux2Variant>(), Ok(Flux2Variant::Flex));
        assert!("max".parse::<Flux2Variant>().is_err());
    }

    #[test]
    fn reference_limits_differ_per_variant() {
        assert_eq!(Flux2Variant::Pro.max_reference_slot(), 8);
        assert_eq!(Flux2Variant::Flex.max_reference_slot(), 10);
        assert!(!Flux2Variant::Pro.supports_sampling_controls());
    }
}
