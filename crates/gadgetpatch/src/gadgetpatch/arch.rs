use gadgetpatch_derive::EnumChoice;
use std::str::FromStr;

/// CPU architectures a gadget is published for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, EnumChoice)]
pub enum Architecture {
    Arm,
    Arm64,
    X86,
    #[choice(name = "x86_64")]
    X64,
}

impl Architecture {
    /// Maps an Android ABI name (`ro.product.cpu.abi`, or a `lib/<abi>`
    /// directory) to its architecture.
    pub fn from_abi(abi: &str) -> Option<Self> {
        match abi.trim() {
            "armeabi" | "armeabi-v7a" => Some(Self::Arm),
            "arm64-v8a" => Some(Self::Arm64),
            "x86" => Some(Self::X86),
            "x86_64" => Some(Self::X64),
            _ => None,
        }
    }

    /// Every ABI directory name that belongs to this architecture.
    pub fn abi_dirs(&self) -> &'static [&'static str] {
        match self {
            Self::Arm => &["armeabi", "armeabi-v7a"],
            Self::Arm64 => &["arm64-v8a"],
            Self::X86 => &["x86"],
            Self::X64 => &["x86_64"],
        }
    }

    /// The ABI directory a library goes into when the APK has none yet.
    pub fn primary_abi(&self) -> &'static str {
        match self {
            Self::Arm => "armeabi-v7a",
            Self::Arm64 => "arm64-v8a",
            Self::X86 => "x86",
            Self::X64 => "x86_64",
        }
    }

    /// Suffix used by upstream release asset names
    /// (`frida-gadget-<version>-android-<token>.so.xz`).
    pub fn asset_token(&self) -> &'static str {
        self.name()
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();

        if let Some(arch) = Self::VARIANTS.iter().find(|a| a.name() == lowered) {
            return Ok(*arch);
        }

        match lowered.as_str() {
            "x64" | "amd64" => Ok(Self::X64),
            "aarch64" => Ok(Self::Arm64),
            "i386" | "i686" => Ok(Self::X86),
            other => Self::from_abi(other).ok_or_else(|| {
                format!("unknown architecture '{s}', expected one of arm, arm64, x86, x86_64")
            }),
        }
    }
}

/// What the caller asked for on the command line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ArchRequest {
    #[default]
    Auto,
    Explicit(Architecture),
}

impl FromStr for ArchRequest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            s.parse().map(Self::Explicit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_upstream_tokens() {
        let names: Vec<_> = Architecture::VARIANTS.iter().map(|a| a.to_string()).collect();
        assert_eq!(names, ["arm", "arm64", "x86", "x86_64"]);
    }

    #[test]
    fn abi_directories_fold_into_architectures() {
        assert_eq!(Architecture::from_abi("armeabi"), Some(Architecture::Arm));
        assert_eq!(Architecture::from_abi("armeabi-v7a"), Some(Architecture::Arm));
        assert_eq!(Architecture::from_abi("arm64-v8a"), Some(Architecture::Arm64));
        assert_eq!(Architecture::from_abi("x86_64\n"), Some(Architecture::X64));
        assert_eq!(Architecture::from_abi("mips"), None);

        for arch in Architecture::VARIANTS {
            assert!(arch.abi_dirs().contains(&arch.primary_abi()));
        }
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("ARM64".parse::<Architecture>(), Ok(Architecture::Arm64));
        assert_eq!("x64".parse::<Architecture>(), Ok(Architecture::X64));
        assert_eq!("arm64-v8a".parse::<Architecture>(), Ok(Architecture::Arm64));
        assert!("sparc".parse::<Architecture>().is_err());

        assert_eq!("auto".parse::<ArchRequest>(), Ok(ArchRequest::Auto));
        assert_eq!(
            "x86".parse::<ArchRequest>(),
            Ok(ArchRequest::Explicit(Architecture::X86))
        );
    }
}
