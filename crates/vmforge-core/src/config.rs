//! Handle configuration: the flat bag of knobs set while a handle is in
//! `Config` state, plus the validation rules guarding each setter.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MIN_MEMSIZE_MIB: u32 = 256;
pub const MAX_SMP: u32 = 255;
pub const VIRTUAL_NIC_SUBNET: &str = "169.254.0.0/16";

/// Backend selector: a name plus an optional argument after the first
/// colon, e.g. `"direct"` or `"delegated:/run/vzd.sock"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSelector {
    pub name: String,
    pub argument: Option<String>,
}

impl BackendSelector {
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((name, arg)) => Self {
                name: name.to_string(),
                argument: Some(arg.to_string()),
            },
            None => Self {
                name: s.to_string(),
                argument: None,
            },
        }
    }
}

impl std::fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.argument {
            Some(arg) => write!(f, "{}:{}", self.name, arg),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Backend-specific settings, an ordered `key` or `key=value` list where
/// later writes of the same key overwrite earlier ones but preserve
/// position, and `clear` leaves a tombstone-free hole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    entries: Vec<(String, Option<String>)>,
}

impl BackendSettings {
    pub fn set(&mut self, key: &str, value: Option<String>) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<&str>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
            .ok_or_else(|| Error::NotSupported(format!("ESRCH: no backend setting {key:?}")))
    }

    pub fn clear(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

/// The flat configuration attributes of a handle, valid only while the
/// handle is in `Config` state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleConfig {
    pub verbose: bool,
    pub trace: bool,
    pub autosync: bool,
    pub direct_mode: bool,
    pub recovery_proc: bool,
    pub enable_network: bool,
    pub selinux: bool,
    pub process_group: bool,
    pub smp: u32,
    pub memsize_mib: u32,
    pub search_path: Vec<std::path::PathBuf>,
    pub hypervisor_binary: Option<std::path::PathBuf>,
    pub append: Option<String>,
    pub backend: BackendSelector,
    pub backend_settings: BackendSettings,
    pub program_name: String,
    identifier: String,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            trace: false,
            autosync: true,
            direct_mode: false,
            recovery_proc: true,
            enable_network: false,
            selinux: false,
            process_group: false,
            smp: 1,
            memsize_mib: MIN_MEMSIZE_MIB,
            search_path: Vec::new(),
            hypervisor_binary: None,
            append: None,
            backend: BackendSelector::parse("direct"),
            backend_settings: BackendSettings::default(),
            program_name: "vmforge".to_string(),
            identifier: String::new(),
        }
    }
}

fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl HandleConfig {
    pub fn set_smp(&mut self, smp: u32) -> Result<()> {
        if smp == 0 || smp > MAX_SMP {
            return Err(Error::InvalidConfig(format!(
                "smp must be in 1..={MAX_SMP}, got {smp}"
            )));
        }
        self.smp = smp;
        Ok(())
    }

    pub fn set_memsize(&mut self, mib: u32) -> Result<()> {
        if mib < MIN_MEMSIZE_MIB {
            return Err(Error::InvalidConfig(format!(
                "too small value for memsize: {mib} (floor is {MIN_MEMSIZE_MIB})"
            )));
        }
        self.memsize_mib = mib;
        Ok(())
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Sets the identifier iff it matches `[A-Za-z0-9_-]+`; on failure the
    /// previous identifier is left untouched.
    pub fn set_identifier(&mut self, identifier: &str) -> Result<()> {
        if !is_valid_identifier(identifier) {
            return Err(Error::InvalidConfig(
                "identifier must contain only alphanumeric characters, underscore or minus sign"
                    .to_string(),
            ));
        }
        self.identifier = identifier.to_string();
        Ok(())
    }

    /// Builds a default config then layers the environment-variable table
    /// on top, with the same "env override over bundled default" pattern
    /// hypervisor binary resolution uses elsewhere. Booleans accept
    /// yes/no/true/false/1/0 case-insensitively; an unrecognized value is
    /// fatal.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("LIBGUESTFS_TRACE") {
            cfg.trace = parse_bool("LIBGUESTFS_TRACE", &v)?;
        }
        if let Ok(v) = std::env::var("LIBGUESTFS_DEBUG") {
            cfg.verbose = parse_bool("LIBGUESTFS_DEBUG", &v)?;
        }
        if let Ok(path) = std::env::var("LIBGUESTFS_PATH") {
            cfg.search_path = path.split(':').map(std::path::PathBuf::from).collect();
        }
        if let Ok(path) = std::env::var("LIBGUESTFS_HV") {
            cfg.hypervisor_binary = Some(std::path::PathBuf::from(path));
        }
        if let Ok(append) = std::env::var("LIBGUESTFS_APPEND") {
            cfg.append = Some(append);
        }
        if let Ok(mib) = std::env::var("LIBGUESTFS_MEMSIZE") {
            let mib: u32 = mib.parse().map_err(|_| {
                Error::InvalidConfig(format!("LIBGUESTFS_MEMSIZE: not a number: {mib:?}"))
            })?;
            cfg.set_memsize(mib)?;
        }
        let backend = std::env::var("LIBGUESTFS_BACKEND")
            .or_else(|_| std::env::var("LIBGUESTFS_ATTACH_METHOD"))
            .ok();
        if let Some(backend) = backend {
            cfg.backend = BackendSelector::parse(&backend);
        }
        if let Ok(settings) = std::env::var("LIBGUESTFS_BACKEND_SETTINGS") {
            for entry in settings.split(':').filter(|e| !e.is_empty()) {
                match entry.split_once('=') {
                    Some((k, v)) => cfg.backend_settings.set(k, Some(v.to_string())),
                    None => cfg.backend_settings.set(entry, None),
                }
            }
        }
        Ok(cfg)
    }
}

/// Parses a case-insensitive yes/no/true/false/1/0 boolean, fatal on
/// anything else.
fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => Err(Error::InvalidConfig(format!(
            "{var}: invalid boolean value {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smp_bounds() {
        let mut cfg = HandleConfig::default();
        assert!(cfg.set_smp(0).is_err());
        assert!(cfg.set_smp(1).is_ok());
        assert!(cfg.set_smp(255).is_ok());
        assert!(cfg.set_smp(256).is_err());
    }

    #[test]
    fn memsize_floor() {
        let mut cfg = HandleConfig::default();
        let err = cfg.set_memsize(100).unwrap_err();
        assert!(err.to_string().contains("too small value for memsize"));
        assert!(cfg.set_memsize(MIN_MEMSIZE_MIB).is_ok());
    }

    #[test]
    fn identifier_rejects_invalid_and_preserves_previous() {
        let mut cfg = HandleConfig::default();
        cfg.set_identifier("vm-1").unwrap();
        let err = cfg.set_identifier("bad/name").unwrap_err();
        assert!(err.to_string().contains("alphanumeric"));
        assert_eq!(cfg.identifier(), "vm-1");
    }

    #[test]
    fn backend_selector_parses_name_and_argument() {
        let sel = BackendSelector::parse("delegated:/run/vzd.sock");
        assert_eq!(sel.name, "delegated");
        assert_eq!(sel.argument.as_deref(), Some("/run/vzd.sock"));
        let sel = BackendSelector::parse("direct");
        assert_eq!(sel.name, "direct");
        assert_eq!(sel.argument, None);
    }

    #[test]
    fn backend_settings_set_get_clear() {
        let mut settings = BackendSettings::default();
        settings.set("foo", Some("bar".to_string()));
        assert_eq!(settings.get("foo").unwrap(), Some("bar"));
        settings.set("foo", Some("baz".to_string()));
        assert_eq!(settings.get("foo").unwrap(), Some("baz"));
        settings.clear("foo");
        assert!(settings.get("foo").is_err());
    }

    #[test]
    fn parse_bool_accepts_known_spellings_case_insensitively() {
        for ok in ["yes", "YES", "true", "True", "1"] {
            assert_eq!(parse_bool("X", ok).unwrap(), true);
        }
        for ok in ["no", "NO", "false", "False", "0"] {
            assert_eq!(parse_bool("X", ok).unwrap(), false);
        }
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn from_env_layers_backend_settings_over_default() {
        // SAFETY: test-only, single-threaded within this process's test harness lock.
        unsafe {
            std::env::set_var("LIBGUESTFS_BACKEND_SETTINGS", "force_tcg:cachedir=/tmp/x");
        }
        let cfg = HandleConfig::from_env().unwrap();
        assert_eq!(cfg.backend_settings.get("force_tcg").unwrap(), None);
        assert_eq!(cfg.backend_settings.get("cachedir").unwrap(), Some("/tmp/x"));
        unsafe {
            std::env::remove_var("LIBGUESTFS_BACKEND_SETTINGS");
        }
    }
}
