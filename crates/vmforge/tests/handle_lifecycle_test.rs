//! End-to-end exercise of `Handle::launch` through its public API,
//! standing in for real QEMU with `/bin/echo` so the probe and argv
//! stages run for real while staying hardware-free. Matches scenario 1
//! in shape (create, configure, launch) but takes the appliance-missing
//! branch instead of a full boot, since that doesn't need a kernel/initrd.

use vmforge::handle::{Handle, HandleState};
use vmforge_core::error::Error;

#[tokio::test]
async fn launch_without_a_resolvable_appliance_leaves_the_handle_in_config_state() {
    let cache_dir = tempfile::tempdir().unwrap();
    // Safety: no other test in this process reads or writes this variable.
    unsafe {
        std::env::set_var("LIBGUESTFS_CACHEDIR", cache_dir.path());
    }

    let empty_search_path = tempfile::tempdir().unwrap();

    let mut handle = Handle::new();
    assert_eq!(handle.state(), HandleState::Config);

    {
        let config = handle.config_mut().unwrap();
        config.hypervisor_binary = Some("/bin/echo".into());
        config.search_path = vec![empty_search_path.path().to_path_buf()];
    }

    let err = handle.launch().await.unwrap_err();
    assert!(
        matches!(err, Error::ApplianceNotFound { .. }),
        "expected ApplianceNotFound, got {err:?}"
    );

    // A failed launch tears back down to Config rather than leaving the
    // handle stuck mid-transition.
    assert_eq!(handle.state(), HandleState::Config);
    assert_eq!(handle.drive_count(), 0);

    unsafe {
        std::env::remove_var("LIBGUESTFS_CACHEDIR");
    }
}
