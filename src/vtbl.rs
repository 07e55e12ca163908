//! The volume table: an in-memory index of every volume's `reserved_pebs`/`alignment`/
//! `data_pad`/`vol_type`/`name`, with `create`/`remove`/`resize`/`rename` entry points matching
//! the distilled spec's §6 ioctl contract (minus the ioctl parsing itself, which is out of
//! scope).
//!
//! The distilled spec treats the volume table as "interface only"; this expansion gives it a
//! real implementation, because a core with no volume table cannot be attached to or exercised
//! from a CLI. Persistence reuses the teacher's `ubinize.rs` layout-volume constants
//! (`UBI_LAYOUT_VOLUME_ID`/`_TYPE`/`_EBS`) and `VolTableRecord` encode/decode machinery, writing
//! the table through EBA instead of through the one-shot image-building pipeline those constants
//! were defined for.

use crate::eba::Eba;
use crate::error::{UbiError, UbiResult};
use crate::headers::VolTableRecord;
use crate::nand::Nand;
use crate::ubinize::{UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES, UBI_VTBL_RECORD_SIZE};
use crate::wl::Wl;

/// The in-memory volume table. Slot `vol_id` is `Some` iff that volume exists.
#[derive(Debug, Clone)]
pub struct Vtbl {
    records: Vec<Option<VolTableRecord>>,
}

impl Default for Vtbl {
    fn default() -> Self {
        Self::new()
    }
}

impl Vtbl {
    pub fn new() -> Self {
        Self {
            records: vec![None; UBI_MAX_VOLUMES],
        }
    }

    /// Create a volume. If `vol_id` is `None`, the lowest free ID is assigned.
    pub fn create(&mut self, vol_id: Option<u32>, record: VolTableRecord) -> UbiResult<u32> {
        let id = match vol_id {
            Some(id) => {
                let slot = self
                    .records
                    .get(id as usize)
                    .ok_or_else(|| UbiError::BadArg(format!("volume id {id} out of range")))?;
                if slot.is_some() {
                    return Err(UbiError::BadArg(format!("volume {id} already exists")));
                }
                id
            }
            None => self
                .records
                .iter()
                .position(Option::is_none)
                .map(|x| x as u32)
                .ok_or(UbiError::NoSpace)?,
        };

        self.records[id as usize] = Some(record);
        Ok(id)
    }

    /// Remove a volume, returning its (now-former) record.
    pub fn remove(&mut self, vol_id: u32) -> UbiResult<VolTableRecord> {
        self.records
            .get_mut(vol_id as usize)
            .and_then(Option::take)
            .ok_or_else(|| UbiError::BadArg(format!("no such volume {vol_id}")))
    }

    /// Change a volume's PEB reservation.
    pub fn resize(&mut self, vol_id: u32, reserved_pebs: u32) -> UbiResult<()> {
        self.get_mut(vol_id)?.reserved_pebs = reserved_pebs;
        Ok(())
    }

    /// Rename a volume.
    pub fn rename(&mut self, vol_id: u32, name: String) -> UbiResult<()> {
        self.get_mut(vol_id)?.name = name;
        Ok(())
    }

    pub fn get(&self, vol_id: u32) -> UbiResult<&VolTableRecord> {
        self.records
            .get(vol_id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| UbiError::BadArg(format!("no such volume {vol_id}")))
    }

    fn get_mut(&mut self, vol_id: u32) -> UbiResult<&mut VolTableRecord> {
        self.records
            .get_mut(vol_id as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| UbiError::BadArg(format!("no such volume {vol_id}")))
    }

    /// Iterate over every existing volume.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &VolTableRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i as u32, r)))
    }

    fn serialize(&self) -> Vec<u8> {
        self.records
            .iter()
            .cloned()
            .flat_map(crate::headers::OptionIntoBytes::into_bytes)
            .collect()
    }

    fn deserialize(buf: &[u8]) -> Self {
        let records = buf
            .chunks(UBI_VTBL_RECORD_SIZE)
            .take(UBI_MAX_VOLUMES)
            .map(VolTableRecord::decode)
            .collect();
        Self { records }
    }

    /// Write both copies of the layout volume. Callers must have already registered
    /// `UBI_LAYOUT_VOLUME_ID` with `eba` (dynamic, `UBI_LAYOUT_VOLUME_EBS` reserved PEBs, no data
    /// pad) before calling this.
    pub fn save<N: Nand>(&self, nand: &mut N, wl: &mut Wl, eba: &Eba) -> UbiResult<()> {
        let bytes = self.serialize();
        for lnum in 0..UBI_LAYOUT_VOLUME_EBS {
            eba.write(nand, wl, UBI_LAYOUT_VOLUME_ID, lnum, 0, &bytes)?;
        }
        Ok(())
    }

    /// Load the table back from whichever copy of the layout volume reads cleanly, preferring
    /// LEB 0 and falling back to LEB 1 (mirroring the original module's redundancy rule: the two
    /// copies exist precisely so a torn write to one survives via the other). An entirely blank
    /// device (no layout volume written yet) yields an empty table.
    pub fn load<N: Nand>(nand: &mut N, wl: &mut Wl, eba: &Eba) -> UbiResult<Self> {
        let mut buf = vec![0u8; UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE];
        for lnum in 0..UBI_LAYOUT_VOLUME_EBS {
            if eba
                .read(nand, wl, UBI_LAYOUT_VOLUME_ID, lnum, 0, &mut buf, false, false)
                .is_ok()
                && buf.iter().any(|&b| b != 0xFF)
            {
                return Ok(Self::deserialize(&buf));
            }
        }
        Ok(Self::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eba::VolGeometry;
    use crate::headers::VolType;
    use crate::layout::{DeviceConfig, Layout};
    use crate::nand::{NandLayout, SimNand};

    #[test]
    fn test_create_assigns_lowest_free_id() {
        let mut vtbl = Vtbl::new();
        let a = vtbl.create(None, VolTableRecord::default()).unwrap();
        let b = vtbl.create(None, VolTableRecord::default()).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn test_create_explicit_id_conflict_rejected() {
        let mut vtbl = Vtbl::new();
        vtbl.create(Some(3), VolTableRecord::default()).unwrap();
        assert!(vtbl.create(Some(3), VolTableRecord::default()).is_err());
    }

    #[test]
    fn test_remove_frees_id() {
        let mut vtbl = Vtbl::new();
        vtbl.create(Some(0), VolTableRecord::default()).unwrap();
        vtbl.remove(0).unwrap();
        assert!(vtbl.get(0).is_err());
        assert_eq!(vtbl.create(None, VolTableRecord::default()).unwrap(), 0);
    }

    #[test]
    fn test_resize_and_rename() {
        let mut vtbl = Vtbl::new();
        vtbl.create(Some(0), VolTableRecord::default()).unwrap();
        vtbl.resize(0, 42).unwrap();
        vtbl.rename(0, "vol-a".into()).unwrap();
        let record = vtbl.get(0).unwrap();
        assert_eq!(record.reserved_pebs, 42);
        assert_eq!(record.name, "vol-a");
    }

    #[test]
    fn test_save_load_roundtrip() {
        const TEST_LAYOUT: NandLayout = NandLayout {
            blocks: 16,
            pages_per_block: 64,
            bytes_per_page: 512,
        };
        let mut nand = SimNand::new(TEST_LAYOUT);
        let layout = Layout::compute(&DeviceConfig {
            peb_size: TEST_LAYOUT.bytes_per_page as u32 * TEST_LAYOUT.pages_per_block,
            min_io_size: TEST_LAYOUT.bytes_per_page as u32,
            ..Default::default()
        })
        .unwrap();
        let eba = Eba::new(layout, 0);
        eba.register_volume(
            UBI_LAYOUT_VOLUME_ID,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: UBI_LAYOUT_VOLUME_EBS,
            },
        );
        let free = (0..TEST_LAYOUT.blocks).map(|p| (p, 0u64));
        let mut wl = Wl::new(DeviceConfig::default(), free, [], []);

        let mut vtbl = Vtbl::new();
        vtbl.create(
            Some(5),
            VolTableRecord {
                reserved_pebs: 7,
                name: "data".into(),
                vol_type: VolType::Dynamic,
                ..Default::default()
            },
        )
        .unwrap();
        vtbl.save(&mut nand, &mut wl, &eba).unwrap();

        let loaded = Vtbl::load(&mut nand, &mut wl, &eba).unwrap();
        let record = loaded.get(5).unwrap();
        assert_eq!(record.reserved_pebs, 7);
        assert_eq!(record.name, "data");
    }
}
