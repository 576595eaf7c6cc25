//! Hypervisor capability probing (C2): runs the configured hypervisor
//! binary with `-help` and `-device ?`, optionally a QMP monolog, and
//! memoizes the result next to the binary's size/mtime.

use std::path::{Path, PathBuf};

use vmforge_core::capabilities::{CacheStat, HypervisorCapabilities, Version};
use vmforge_core::error::{Error, Result};

use crate::supervisor::{CommandSpec, Supervisor};

const CACHE_GENERATION: u32 = 1;

fn cache_file_names(size: u64, mtime: i64) -> [String; 5] {
    [
        format!("qemu-{size}-{mtime}.help"),
        format!("qemu-{size}-{mtime}.devices"),
        format!("qemu-{size}-{mtime}.qmp-schema"),
        format!("qemu-{size}-{mtime}.query-kvm"),
        format!("qemu-{size}-{mtime}.stat"),
    ]
}

fn binary_stat(path: &Path) -> Result<(u64, i64)> {
    let meta = std::fs::metadata(path).map_err(Error::Resource)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((meta.len(), mtime))
}

/// Attempts to load a valid cached probe result for `binary`. Returns
/// `None` if any of the five artifacts is missing, or stat mismatches.
pub fn load_cache(cache_dir: &Path, binary: &Path) -> Option<HypervisorCapabilities> {
    let (size, mtime) = binary_stat(binary).ok()?;
    let [help_name, devices_name, schema_name, query_kvm_name, stat_name] =
        cache_file_names(size, mtime);

    let stat_path = cache_dir.join(&stat_name);
    let stat_contents = std::fs::read_to_string(stat_path).ok()?;
    let stat = CacheStat::parse_line(stat_contents.trim())?;
    if !stat.matches(size, mtime, CACHE_GENERATION) {
        return None;
    }

    let help_text = std::fs::read_to_string(cache_dir.join(&help_name)).ok()?;
    let device_list_text = std::fs::read_to_string(cache_dir.join(&devices_name)).ok()?;
    let qmp_schema_text = std::fs::read_to_string(cache_dir.join(&schema_name)).ok()?;
    let query_kvm_text = std::fs::read_to_string(cache_dir.join(&query_kvm_name)).ok()?;

    Some(build_capabilities(
        &help_text,
        &device_list_text,
        &qmp_schema_text,
        &query_kvm_text,
    ))
}

fn write_cache(
    cache_dir: &Path,
    binary: &Path,
    help_text: &str,
    device_list_text: &str,
    qmp_schema_text: &str,
    query_kvm_text: &str,
) -> Result<()> {
    std::fs::create_dir_all(cache_dir).map_err(Error::Resource)?;
    let (size, mtime) = binary_stat(binary)?;
    let [help_name, devices_name, schema_name, query_kvm_name, stat_name] =
        cache_file_names(size, mtime);

    std::fs::write(cache_dir.join(&help_name), help_text).map_err(Error::Resource)?;
    std::fs::write(cache_dir.join(&devices_name), device_list_text).map_err(Error::Resource)?;
    std::fs::write(cache_dir.join(&schema_name), qmp_schema_text).map_err(Error::Resource)?;
    std::fs::write(cache_dir.join(&query_kvm_name), query_kvm_text).map_err(Error::Resource)?;

    // Written last: its presence is what makes the cache entry valid.
    let stat = CacheStat {
        generation: CACHE_GENERATION,
        size,
        mtime,
        path: binary.to_path_buf(),
    };
    std::fs::write(cache_dir.join(&stat_name), stat.to_line()).map_err(Error::Resource)?;
    Ok(())
}

fn parse_version(help_text: &str) -> Option<Version> {
    let first_line = help_text.lines().next()?;
    let digits_group = first_line
        .split(|c: char| !c.is_ascii_digit() && c != '.')
        .find(|s| s.contains('.'))?;
    let mut parts = digits_group.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let micro = parts.next().unwrap_or("0").parse().unwrap_or(0);
    Some(Version::new(major, minor, micro))
}

/// Parses the `query-qmp-schema` and `query-kvm` replies out of the
/// five-line `qmp_capabilities`/`query-qmp-schema`/`query-kvm`/`quit`
/// transcript. Failure to parse is non-fatal and yields defaults
/// (`has_mandatory_file_locking` falls back to a version check;
/// `kvm_enabled` defaults true).
fn parse_qmp(qmp_schema_text: &str, query_kvm_text: &str, version: Option<Version>) -> (bool, bool) {
    let has_locking = qmp_schema_text.contains("\"locking\"");
    let fallback_locking = version.is_some_and(|v| (v.major, v.minor) >= (2, 10));
    let has_mandatory_file_locking = has_locking || fallback_locking;

    let kvm_enabled = query_kvm_text
        .find("\"enabled\"")
        .map(|idx| {
            query_kvm_text[idx..]
                .trim_start_matches("\"enabled\"")
                .contains("true")
        })
        .unwrap_or(true);

    (has_mandatory_file_locking, kvm_enabled)
}

fn build_capabilities(
    help_text: &str,
    device_list_text: &str,
    qmp_schema_text: &str,
    query_kvm_text: &str,
) -> HypervisorCapabilities {
    let version = parse_version(help_text);
    let (has_mandatory_file_locking, kvm_enabled) = parse_qmp(qmp_schema_text, query_kvm_text, version);
    HypervisorCapabilities {
        help_text: help_text.to_string(),
        device_list_text: device_list_text.to_string(),
        version,
        has_mandatory_file_locking,
        kvm_enabled,
    }
}

/// Probes `binary`, consulting `cache_dir` first. On a cache miss, runs
/// `-help` and `-device ?` (and a best-effort QMP monolog) and writes
/// the result back to the cache.
pub async fn probe(binary: &Path, cache_dir: &Path) -> Result<HypervisorCapabilities> {
    if let Some(cached) = load_cache(cache_dir, binary) {
        return Ok(cached);
    }

    let help_out = Supervisor::new(CommandSpec::Argv(vec![
        binary.as_os_str().to_owned(),
        "-help".into(),
    ]))
    .run()
    .await?;
    let help_text = help_out.stdout_text();

    let device_out = Supervisor::new(CommandSpec::Argv(vec![
        binary.as_os_str().to_owned(),
        "-machine".into(),
        "none".into(),
        "-accel".into(),
        "kvm:tcg".into(),
        "-device".into(),
        "?".into(),
    ]))
    .run()
    .await;
    let device_list_text = device_out.map(|o| o.stdout_text()).unwrap_or_default();

    // A failed QMP monolog is non-fatal; it just yields empty derived data.
    let (qmp_schema_text, query_kvm_text) = run_qmp_monolog(binary).await.unwrap_or_default();

    let capabilities = build_capabilities(&help_text, &device_list_text, &qmp_schema_text, &query_kvm_text);
    write_cache(
        cache_dir,
        binary,
        &help_text,
        &device_list_text,
        &qmp_schema_text,
        &query_kvm_text,
    )?;
    Ok(capabilities)
}

/// Runs the `qmp_capabilities`/`query-qmp-schema`/`query-kvm`/`quit`
/// monolog and splits its reply transcript: line 2 is the schema reply,
/// line 3 is the `query-kvm` reply (line 1 acks `qmp_capabilities`, line
/// 4 acks `quit`).
async fn run_qmp_monolog(binary: &Path) -> Option<(String, String)> {
    let script = format!(
        "{} -qmp stdio -display none -machine none 2>/dev/null <<'EOF'\n{{\"execute\":\"qmp_capabilities\"}}\n{{\"execute\":\"query-qmp-schema\"}}\n{{\"execute\":\"query-kvm\"}}\n{{\"execute\":\"quit\"}}\nEOF",
        shell_escape_path(binary)
    );
    let out = Supervisor::new(CommandSpec::Shell(script)).run().await.ok()?;
    let text = out.stdout_text();
    let lines: Vec<&str> = text.lines().collect();
    let schema = lines.get(1).copied().unwrap_or_default().to_string();
    let query_kvm = lines.get(2).copied().unwrap_or_default().to_string();
    Some((schema, query_kvm))
}

fn shell_escape_path(path: &Path) -> String {
    crate::supervisor::shell_quote(&path.to_string_lossy())
}

/// Per-user cache directory, shared across every handle and process for
/// the same user so the on-disk probe cache actually amortizes across
/// launches instead of living inside one handle's private temp dir.
/// Honors `LIBGUESTFS_CACHEDIR` first, falling back to
/// `$TMPDIR/vmforge-<uid>/probe-cache` (`$TMPDIR` itself defaulting to
/// `/tmp`), the usual env-override-over-bundled-default layering.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LIBGUESTFS_CACHEDIR") {
        return PathBuf::from(dir);
    }
    let tmp = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
    let uid = nix::unistd::Uid::current().as_raw();
    PathBuf::from(tmp).join(format!("vmforge-{uid}")).join("probe-cache")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_from_help_first_line() {
        let help = "QEMU emulator version 8.1.2 (Debian 1:8.1.2+ds)\nusage: ...";
        let version = parse_version(help).unwrap();
        assert_eq!(version, Version::new(8, 1, 2));
    }

    #[test]
    fn parse_qmp_detects_locking_member() {
        let schema = r#"{"return": {"name": "SchemaObjectType", "members": [{"name": "locking"}]}}"#;
        let query_kvm = r#"{"return": {"enabled": true}}"#;
        let (has_locking, kvm_enabled) = parse_qmp(schema, query_kvm, None);
        assert!(has_locking);
        assert!(kvm_enabled);
    }

    #[test]
    fn parse_qmp_falls_back_on_version_when_unparseable() {
        let (has_locking, kvm_enabled) = parse_qmp("", "", Some(Version::new(2, 12, 0)));
        assert!(has_locking);
        assert!(kvm_enabled); // default true when unparseable
    }

    #[test]
    fn parse_qmp_no_fallback_below_2_10() {
        let (has_locking, _) = parse_qmp("", "", Some(Version::new(2, 9, 0)));
        assert!(!has_locking);
    }

    #[test]
    fn cache_stat_file_names_embed_size_and_mtime() {
        let names = cache_file_names(12345, 1700000000);
        assert_eq!(names[4], "qemu-12345-1700000000.stat");
        assert_eq!(names[2], "qemu-12345-1700000000.qmp-schema");
        assert_eq!(names[3], "qemu-12345-1700000000.query-kvm");
    }

    #[tokio::test]
    async fn cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let binary_path = dir.path().join("fake-qemu");
        std::fs::write(&binary_path, b"binary-contents").unwrap();

        assert!(load_cache(dir.path(), &binary_path).is_none());

        write_cache(dir.path(), &binary_path, "help text v1.0.0", "device text", "", "")
            .unwrap();

        let cached = load_cache(dir.path(), &binary_path).unwrap();
        assert_eq!(cached.help_text, "help text v1.0.0");
        assert_eq!(cached.device_list_text, "device text");
    }

    #[tokio::test]
    async fn cache_invalidated_when_binary_changes() {
        let dir = tempfile::tempdir().unwrap();
        let binary_path = dir.path().join("fake-qemu");
        std::fs::write(&binary_path, b"v1").unwrap();
        write_cache(dir.path(), &binary_path, "help", "dev", "", "").unwrap();
        assert!(load_cache(dir.path(), &binary_path).is_some());

        // Changing size invalidates the stat match.
        std::fs::write(&binary_path, b"v2-longer-content").unwrap();
        assert!(load_cache(dir.path(), &binary_path).is_none());
    }
}
