//! Appliance resolver/builder (C3): walks a search path for one of
//! three known appliance layouts and, for the supermin layout, invokes
//! an external builder under a race-free lockfile.

use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use vmforge_core::appliance::Appliance;
use vmforge_core::error::{Error, Result};

use crate::supervisor::{CommandSpec, Supervisor};

/// Splits a colon-separated search path; an empty element or `.` means
/// the current directory.
pub fn split_search_path(path: &str) -> Vec<PathBuf> {
    path.split(':')
        .map(|element| {
            if element.is_empty() || element == "." {
                PathBuf::from(".")
            } else {
                PathBuf::from(element)
            }
        })
        .collect()
}

fn is_supermin_layout(dir: &Path) -> bool {
    dir.join("supermin.d/base.tar.gz").is_file() && dir.join("supermin.d/packages").is_file()
}

fn is_fixed_layout(dir: &Path) -> bool {
    dir.join("README.fixed").is_file()
        && dir.join("kernel").is_file()
        && dir.join("initrd").is_file()
        && dir.join("root").is_file()
}

fn old_layout_files(dir: &Path, host_cpu: &str) -> Option<(PathBuf, PathBuf)> {
    let kernel = dir.join(format!("vmlinuz.{host_cpu}"));
    let initrd = dir.join(format!("initramfs.{host_cpu}.img"));
    if kernel.is_file() && initrd.is_file() {
        Some((kernel, initrd))
    } else {
        None
    }
}

/// Touches `path`'s atime/mtime to the current time so a temp cleaner
/// defers reaping it.
fn touch(path: &Path) -> Result<()> {
    let now = std::time::SystemTime::now();
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .map_err(Error::Resource)?;
    file.set_modified(now).map_err(Error::Resource)?;
    Ok(())
}

struct LockGuard {
    _file: std::fs::File,
}

impl LockGuard {
    fn acquire(lock_path: &Path) -> Result<Self> {
        let file = std::fs::File::create(lock_path).map_err(Error::Resource)?;
        flock(std::os::fd::AsRawFd::as_raw_fd(&file), FlockArg::LockExclusive)
            .map_err(|e| Error::Resource(std::io::Error::from(e)))?;
        Ok(Self { _file: file })
    }
}

/// Invokes the external supermin builder with `--build --if-newer`
/// under an explicit lockfile, held only for the duration of the build.
async fn run_supermin_build(
    dir: &Path,
    cache_dir: &Path,
    lock_path: &Path,
    host_cpu: &str,
) -> Result<Appliance> {
    std::fs::create_dir_all(cache_dir).map_err(Error::Resource)?;
    let output_dir = cache_dir.join("appliance.d");

    {
        let _guard = LockGuard::acquire(lock_path)?;
        let supermin_d = dir.join("supermin.d");
        Supervisor::new(CommandSpec::Argv(vec![
            "supermin".into(),
            "--build".into(),
            "--if-newer".into(),
            "--lock".into(),
            lock_path.as_os_str().to_owned(),
            "--copy-kernel".into(),
            "-f".into(),
            "ext2".into(),
            "--host-cpu".into(),
            host_cpu.into(),
            supermin_d.into_os_string(),
            "-o".into(),
            output_dir.as_os_str().to_owned(),
        ]))
        .run()
        .await?;
    }

    let kernel = output_dir.join("kernel");
    let initrd = output_dir.join("initrd");
    let root = output_dir.join("root");
    for file in [&kernel, &initrd, &root] {
        touch(file)?;
    }
    Ok(Appliance::new(kernel, initrd, root))
}

/// Resolves an appliance by walking `search_path` in order and
/// returning the first layout match. `cache_root` holds the per-user
/// supermin build cache; `host_cpu` is used for layout 1 and 3's
/// per-architecture file naming.
pub async fn resolve(search_path: &str, cache_root: &Path, host_cpu: &str) -> Result<Appliance> {
    for dir in split_search_path(search_path) {
        if is_supermin_layout(&dir) {
            let cache_dir = cache_root.join("supermin-appliance");
            let lock_path = cache_dir.join("lock");
            std::fs::create_dir_all(&cache_dir).map_err(Error::Resource)?;
            return run_supermin_build(&dir, &cache_dir, &lock_path, host_cpu).await;
        }
        if is_fixed_layout(&dir) {
            return Ok(Appliance::new(
                dir.join("kernel"),
                dir.join("initrd"),
                dir.join("root"),
            ));
        }
        if let Some((kernel, initrd)) = old_layout_files(&dir, host_cpu) {
            // Old layout has no separate root image; the caller must cope.
            return Ok(Appliance::new(kernel, initrd, PathBuf::new()));
        }
    }

    Err(Error::ApplianceNotFound {
        search_path: search_path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_empty_and_dot_elements_mean_cwd() {
        let path = split_search_path(":/opt/appliance:.:/usr/lib/appliance");
        assert_eq!(path[0], PathBuf::from("."));
        assert_eq!(path[1], PathBuf::from("/opt/appliance"));
        assert_eq!(path[2], PathBuf::from("."));
    }

    #[tokio::test]
    async fn resolves_fixed_layout() {
        let dir = tempfile::tempdir().unwrap();
        let appliance_dir = dir.path().join("appliance1");
        std::fs::create_dir_all(&appliance_dir).unwrap();
        for name in ["README.fixed", "kernel", "initrd", "root"] {
            std::fs::write(appliance_dir.join(name), b"x").unwrap();
        }

        let search_path = appliance_dir.to_string_lossy().into_owned();
        let cache_root = dir.path().join("cache");
        let appliance = resolve(&search_path, &cache_root, "x86_64").await.unwrap();
        assert_eq!(appliance.kernel, appliance_dir.join("kernel"));
        assert_eq!(appliance.root_fs, appliance_dir.join("root"));
    }

    #[tokio::test]
    async fn resolves_old_layout_with_null_root() {
        let dir = tempfile::tempdir().unwrap();
        let appliance_dir = dir.path().join("appliance2");
        std::fs::create_dir_all(&appliance_dir).unwrap();
        std::fs::write(appliance_dir.join("vmlinuz.x86_64"), b"k").unwrap();
        std::fs::write(appliance_dir.join("initramfs.x86_64.img"), b"i").unwrap();

        let search_path = appliance_dir.to_string_lossy().into_owned();
        let cache_root = dir.path().join("cache");
        let appliance = resolve(&search_path, &cache_root, "x86_64").await.unwrap();
        assert_eq!(appliance.root_fs, PathBuf::new());
    }

    #[tokio::test]
    async fn fails_when_no_layout_matches() {
        let dir = tempfile::tempdir().unwrap();
        let empty_dir = dir.path().join("empty");
        std::fs::create_dir_all(&empty_dir).unwrap();

        let search_path = empty_dir.to_string_lossy().into_owned();
        let cache_root = dir.path().join("cache");
        let err = resolve(&search_path, &cache_root, "x86_64").await.unwrap_err();
        assert!(matches!(err, Error::ApplianceNotFound { .. }));
    }

    #[tokio::test]
    async fn search_path_priority_prefers_first_match() {
        let dir = tempfile::tempdir().unwrap();
        let fixed_dir = dir.path().join("fixed");
        std::fs::create_dir_all(&fixed_dir).unwrap();
        for name in ["README.fixed", "kernel", "initrd", "root"] {
            std::fs::write(fixed_dir.join(name), b"x").unwrap();
        }
        let old_dir = dir.path().join("old");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(old_dir.join("vmlinuz.x86_64"), b"k").unwrap();
        std::fs::write(old_dir.join("initramfs.x86_64.img"), b"i").unwrap();

        let search_path = format!(
            "{}:{}",
            old_dir.to_string_lossy(),
            fixed_dir.to_string_lossy()
        );
        let cache_root = dir.path().join("cache");
        let appliance = resolve(&search_path, &cache_root, "x86_64").await.unwrap();
        // old_dir comes first in the path and matches layout 3, so it wins.
        assert_eq!(appliance.kernel, old_dir.join("vmlinuz.x86_64"));
    }
}
