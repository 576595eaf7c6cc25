//! Hypervisor capability data shapes, shared between the probing logic
//! (which populates them) and the argument builder (which consults
//! them as a substring oracle).

use serde::{Deserialize, Serialize};

/// A parsed `major.minor.micro` version, as read from the first line of
/// a hypervisor's `-help` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Everything derived from probing a hypervisor binary: the raw help
/// and device-list text (used as substring oracles by the argument
/// builder), plus fields derived from an optional QMP monolog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HypervisorCapabilities {
    pub help_text: String,
    pub device_list_text: String,
    pub version: Option<Version>,
    /// Present iff the QMP schema contains an object member named
    /// `locking`, with a fallback of "version >= 2.10" when the QMP
    /// monolog could not be parsed.
    pub has_mandatory_file_locking: bool,
    /// Defaults to `true` when `query-kvm.return.enabled` could not be
    /// parsed out of the QMP transcript.
    pub kvm_enabled: bool,
}

impl HypervisorCapabilities {
    /// Whether `-help` mentions `flag` as a substring. This is the
    /// argument builder's sole oracle for "does this hypervisor accept
    /// option X", matching the probe's documented substring semantics.
    pub fn accepts_option(&self, flag: &str) -> bool {
        self.help_text.contains(flag)
    }

    /// Whether `-device ?` mentions `device` as a substring.
    pub fn has_device(&self, device: &str) -> bool {
        self.device_list_text.contains(device)
    }
}

/// The on-disk cache record: four text artifacts (help, devices,
/// qmp-schema, query-kvm) plus the stat line that gates their validity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStat {
    pub generation: u32,
    pub size: u64,
    pub mtime: i64,
    pub path: std::path::PathBuf,
}

impl CacheStat {
    /// Formats the `qemu-<size>-<mtime>.stat` contents:
    /// `<generation> <size> <mtime> <path>`.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.generation,
            self.size,
            self.mtime,
            self.path.display()
        )
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, ' ');
        let generation = parts.next()?.parse().ok()?;
        let size = parts.next()?.parse().ok()?;
        let mtime = parts.next()?.parse().ok()?;
        let path = parts.next()?.to_string();
        Some(Self {
            generation,
            size,
            mtime,
            path: path.into(),
        })
    }

    pub fn matches(&self, other_size: u64, other_mtime: i64, generation: u32) -> bool {
        self.size == other_size && self.mtime == other_mtime && self.generation == generation
    }
}
