//! Target description.

use strum::{Display, EnumString};

/// Architectures code can be generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TargetArchitecture {
    /// x86-64
    #[default]
    X64,
    /// 32-bit x86
    X86,
    /// AArch64
    Arm64,
}

impl TargetArchitecture {
    /// Size of a pointer in bytes.
    #[must_use]
    pub fn pointer_size(self) -> u32 {
        match self {
            TargetArchitecture::X64 | TargetArchitecture::Arm64 => 8,
            TargetArchitecture::X86 => 4,
        }
    }
}

/// Target properties the type system needs for layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDetails {
    /// Architecture
    pub architecture: TargetArchitecture,
    /// Pointer size in bytes
    pub pointer_size: u32,
}

impl TargetDetails {
    /// Details for an architecture.
    #[must_use]
    pub fn new(architecture: TargetArchitecture) -> Self {
        TargetDetails {
            architecture,
            pointer_size: architecture.pointer_size(),
        }
    }
}

impl Default for TargetDetails {
    fn default() -> Self {
        TargetDetails::new(TargetArchitecture::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_and_size() {
        assert_eq!(TargetArchitecture::from_str("arm64").unwrap(), TargetArchitecture::Arm64);
        assert_eq!(TargetArchitecture::X86.pointer_size(), 4);
        assert_eq!(TargetDetails::default().pointer_size, 8);
        assert_eq!(TargetArchitecture::X64.to_string(), "x64");
    }
}
