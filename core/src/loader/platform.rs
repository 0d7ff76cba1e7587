//! OS / CPU architecture detection and artifact naming

use super::LoaderError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Operating systems that ship a bundled native library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Os {
    Windows,
    Linux,
    Macos,
}

impl Os {
    /// Classify an OS name string (`std::env::consts::OS` or a user-agent style name)
    pub fn parse(name: &str) -> Result<Self, LoaderError> {
        let lowered = name.to_lowercase();
        if lowered.contains("windows") {
            Ok(Os::Windows)
        } else if lowered.contains("linux") {
            Ok(Os::Linux)
        } else if lowered.contains("mac") || lowered.contains("darwin") {
            Ok(Os::Macos)
        } else {
            Err(LoaderError::UnsupportedPlatform(name.to_string()))
        }
    }

    /// Filename prefix for shared libraries
    pub fn library_prefix(&self) -> &'static str {
        match self {
            Os::Windows => "",
            Os::Linux | Os::Macos => "lib",
        }
    }

    /// Filename extension for shared libraries, including the dot
    pub fn library_suffix(&self) -> &'static str {
        match self {
            Os::Windows => ".dll",
            Os::Linux => ".so",
            Os::Macos => ".dylib",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Os::Windows => write!(f, "windows"),
            Os::Linux => write!(f, "linux"),
            Os::Macos => write!(f, "macos"),
        }
    }
}

/// CPU architectures that ship a bundled native library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    X86,
    X64,
    Aarch64,
}

impl Arch {
    pub fn parse(name: &str) -> Result<Self, LoaderError> {
        match name.to_lowercase().as_str() {
            "amd64" | "x86_64" | "x64" => Ok(Arch::X64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "x86" | "i386" | "i586" | "i686" => Ok(Arch::X86),
            _ => Err(LoaderError::UnsupportedArchitecture(name.to_string())),
        }
    }

    /// Directory name under the resource root
    pub fn dir_name(&self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X64 => "x64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A supported (OS, architecture) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    /// Detect the platform of the running process
    pub fn detect() -> Result<Self, LoaderError> {
        Self::from_names(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Classify raw OS and architecture names; no filesystem access
    pub fn from_names(os: &str, arch: &str) -> Result<Self, LoaderError> {
        Ok(Self {
            os: Os::parse(os)?,
            arch: Arch::parse(arch)?,
        })
    }

    /// Platform-specific file name, e.g. `libsimplecble.so`
    pub fn artifact_name(&self, base_name: &str) -> String {
        format!(
            "{}{}{}",
            self.os.library_prefix(),
            base_name,
            self.os.library_suffix()
        )
    }

    /// `<root>/<arch>/<artifact>`
    pub fn resource_path(&self, root: &Path, base_name: &str) -> PathBuf {
        root.join(self.arch.dir_name())
            .join(self.artifact_name(base_name))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_mapping() {
        assert_eq!(Os::parse("Windows 11").unwrap(), Os::Windows);
        assert_eq!(Os::parse("linux").unwrap(), Os::Linux);
        assert_eq!(Os::parse("Mac OS X").unwrap(), Os::Macos);
        assert_eq!(Os::parse("macos").unwrap(), Os::Macos);
        assert!(matches!(
            Os::parse("freebsd"),
            Err(LoaderError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_arch_mapping() {
        assert_eq!(Arch::parse("amd64").unwrap(), Arch::X64);
        assert_eq!(Arch::parse("x86_64").unwrap(), Arch::X64);
        assert_eq!(Arch::parse("aarch64").unwrap(), Arch::Aarch64);
        assert_eq!(Arch::parse("i686").unwrap(), Arch::X86);
        assert!(matches!(
            Arch::parse("riscv64"),
            Err(LoaderError::UnsupportedArchitecture(_))
        ));
    }

    #[test]
    fn test_artifact_names() {
        let cases = [
            ("windows", "x86_64", "x64/simplecble.dll"),
            ("windows", "x86", "x86/simplecble.dll"),
            ("windows", "aarch64", "aarch64/simplecble.dll"),
            ("linux", "x86_64", "x64/libsimplecble.so"),
            ("linux", "x86", "x86/libsimplecble.so"),
            ("linux", "aarch64", "aarch64/libsimplecble.so"),
            ("macos", "x86_64", "x64/libsimplecble.dylib"),
            ("macos", "x86", "x86/libsimplecble.dylib"),
            ("macos", "aarch64", "aarch64/libsimplecble.dylib"),
        ];
        let root = Path::new("native");
        for (os, arch, expected) in cases {
            let platform = Platform::from_names(os, arch).unwrap();
            assert_eq!(
                platform.resource_path(root, "simplecble"),
                root.join(expected),
                "{}-{}",
                os,
                arch
            );
        }
    }

    #[test]
    fn test_detect_current_platform() {
        // CI hosts are all on the supported matrix
        let platform = Platform::detect().unwrap();
        assert_eq!(platform.to_string().split('-').count(), 2);
    }
}
