//! The resolved appliance triple: kernel, initrd, and root filesystem.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A fully resolved, ready-to-boot appliance.
///
/// Produced by the resolver (search-path walk + cache lookup) and
/// consumed by the argument builder. Every field is an absolute,
/// canonicalized path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appliance {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub root_fs: PathBuf,
    /// Build identifier embedded by the appliance's build process, used
    /// as part of the on-disk cache key alongside mtime/size.
    pub build_id: Option<String>,
}

impl Appliance {
    pub fn new(kernel: PathBuf, initrd: PathBuf, root_fs: PathBuf) -> Self {
        Self {
            kernel,
            initrd,
            root_fs,
            build_id: None,
        }
    }

    pub fn with_build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_build_id() {
        let appliance = Appliance::new("/k".into(), "/i".into(), "/r".into())
            .with_build_id("abc123");
        assert_eq!(appliance.build_id.as_deref(), Some("abc123"));
    }
}
