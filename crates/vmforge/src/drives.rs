//! The drive vector (C4): append-only with holes, checkpoint/rollback,
//! and overlay materialization through a backend.

use vmforge_core::backend::HypervisorBackend;
use vmforge_core::drive::{drive_name, Drive, DriveOptions, DriveSource};
use vmforge_core::error::{Error, Result};

/// An ordered collection of drives where an entry's index is stable for
/// the life of a launch. Freed entries leave a hole (`None`) rather
/// than shifting later indices down.
#[derive(Debug, Default)]
pub struct DriveVector {
    entries: Vec<Option<Drive>>,
}

impl DriveVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Drive> {
        self.entries.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Drive)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (i, d)))
    }

    /// Appends a drive, validating uniqueness of its label against the
    /// rest of the vector (construction-time field validation is
    /// [`Drive::new`]'s job).
    pub fn add_drive(&mut self, source: DriveSource, opts: DriveOptions) -> Result<usize> {
        if let Some(label) = &opts.label {
            if self.iter().any(|(_, d)| d.options.label.as_deref() == Some(label.as_str())) {
                return Err(Error::InvalidConfig(format!(
                    "drive label {label:?} is already in use"
                )));
            }
        }
        let drive = Drive::new(source, opts)?;
        let index = self.entries.len();
        self.entries.push(Some(drive));
        Ok(index)
    }

    /// Appends a sourceless placeholder consumed only during LAUNCHING,
    /// to carry the appliance's own snapshot-on overlay.
    pub fn add_dummy_appliance_drive(&mut self) -> usize {
        let index = self.entries.len();
        self.entries.push(None);
        index
    }

    pub fn checkpoint(&self) -> usize {
        self.entries.len()
    }

    /// Frees entries at or beyond `mark`, restoring the vector to the
    /// length it had when the checkpoint was taken.
    pub fn rollback(&mut self, mark: usize) {
        self.entries.truncate(mark);
    }

    pub fn free_all(&mut self) {
        self.entries.clear();
    }

    pub fn device_letter(index: usize) -> String {
        drive_name(index as u64)
    }

    /// Materializes overlays for every readonly drive that doesn't have
    /// one yet, via the given backend. Called once at the start of
    /// launch, before the argument builder runs.
    pub async fn materialize_overlays(
        &mut self,
        backend: &dyn HypervisorBackend,
        overlay_dir: &std::path::Path,
    ) -> Result<()> {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            let Some(drive) = slot else { continue };
            if !drive.is_readonly() || drive.overlay_path.is_some() {
                continue;
            }
            let DriveSource::Local(source_path) = &drive.source else {
                continue;
            };
            let overlay_path = overlay_dir.join(format!("overlay{index}.qcow2"));
            backend.create_overlay(source_path, &overlay_path).await?;
            drive.overlay_path = Some(overlay_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmforge_core::drive::Server;

    fn local_opts(label: &str) -> (DriveSource, DriveOptions) {
        (
            DriveSource::Local("/dev/null".into()),
            DriveOptions {
                label: Some(label.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn add_drive_appends_and_preserves_index() {
        let mut drives = DriveVector::new();
        let (source, opts) = local_opts("sda");
        let index = drives.add_drive(source, opts).unwrap();
        assert_eq!(index, 0);
        assert_eq!(drives.len(), 1);
    }

    #[test]
    fn duplicate_label_rejected() {
        let mut drives = DriveVector::new();
        let (s1, o1) = local_opts("data");
        drives.add_drive(s1, o1).unwrap();
        let (s2, o2) = local_opts("data");
        assert!(drives.add_drive(s2, o2).is_err());
    }

    #[test]
    fn checkpoint_and_rollback_restores_length() {
        let mut drives = DriveVector::new();
        let (s1, o1) = local_opts("a");
        drives.add_drive(s1, o1).unwrap();
        let mark = drives.checkpoint();
        let (s2, o2) = local_opts("b");
        drives.add_drive(s2, o2).unwrap();
        assert_eq!(drives.len(), 2);
        drives.rollback(mark);
        assert_eq!(drives.len(), 1);
        assert!(drives.get(0).is_some());
    }

    #[test]
    fn rollback_leaves_holes_not_shifted_indices() {
        let mut drives = DriveVector::new();
        let (s1, o1) = local_opts("a");
        drives.add_drive(s1, o1).unwrap();
        drives.add_dummy_appliance_drive();
        let (s3, o3) = local_opts("c");
        let idx_c = drives.add_drive(s3, o3).unwrap();
        assert_eq!(idx_c, 2);
        assert!(drives.get(1).is_none());
    }

    #[test]
    fn free_all_resets_to_zero() {
        let mut drives = DriveVector::new();
        let (s1, o1) = local_opts("a");
        drives.add_drive(s1, o1).unwrap();
        drives.free_all();
        assert_eq!(drives.len(), 0);
    }

    #[test]
    fn device_letter_matches_bijection() {
        assert_eq!(DriveVector::device_letter(0), "a");
        assert_eq!(DriveVector::device_letter(26), "aa");
    }

    #[test]
    fn nbd_still_requires_one_server_through_vector() {
        let mut drives = DriveVector::new();
        let source = DriveSource::Network {
            protocol: vmforge_core::drive::NetworkProtocol::Nbd,
            servers: vec![Server::new("a"), Server::new("b")],
            username: None,
            secret: None,
            export_name: None,
        };
        assert!(drives.add_drive(source, DriveOptions::default()).is_err());
    }
}
