//! Derived on-flash geometry for a device, computed once at attach time the way
//! `ubi_attach_mtd_dev` computes `ubi->leb_start`/`ubi->vid_hdr_aloffset`/etc. in the original
//! kernel module, from a small `DeviceConfig` the caller supplies.

use crate::headers::{Ec, Vid};

/// Retries for a transient I/O error before giving up (`UBI_IO_RETRIES` in the original header).
pub const UBI_IO_RETRIES: u32 = 3;

/// Length of the protection queue, in global erase ticks (`UBI_PROT_QUEUE_LEN`).
pub const PROT_QUEUE_LEN: usize = 10;

/// Sentinel erase counter for a PEB whose EC is not yet known (`UBI_UNKNOWN`).
pub const EC_UNKNOWN: u64 = u64::MAX;

/// Sentinel EBA-table value meaning "this LEB has no PEB" (`UBI_LEB_UNMAPPED`).
pub const LEB_UNMAPPED: i64 = -1;

/// Device-wide tunables. The original header scatters the equivalents of these across
/// `struct ubi_device` fields and module parameters; this crate gathers them into one struct
/// constructed once per device, the way `DeviceConfig`-style structs appear throughout the
/// example pack (e.g. `asterinas`'s per-subsystem config structs).
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Size in bytes of one physical eraseblock.
    pub peb_size: u32,

    /// Minimum I/O unit size; header regions are padded up to a multiple of this.
    pub min_io_size: u32,

    /// Erase-counter spread (`max_ec(free) - min_ec(used)`) that triggers a wear-leveling move.
    /// Not specified numerically in the original header (module param default 4096 lives
    /// elsewhere in the kernel tree); chosen here and recorded as an open-question resolution
    /// in DESIGN.md.
    pub wl_threshold: u64,

    /// Maximum number of PEBs allowed to sit in the `erroneous` set before further EBADMSG PEBs
    /// are treated as fatal instead of quarantined.
    pub max_erroneous: usize,

    /// PEBs beyond this many observed bad blocks force the device read-only at attach.
    pub bad_peb_limit: u32,

    /// Normal level of the bad-PEB reserve (`beb_rsvd_level`).
    pub beb_rsvd_level: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            peb_size: 128 * 1024,
            min_io_size: 2048,
            wl_threshold: 4096,
            max_erroneous: 16,
            bad_peb_limit: 64,
            beb_rsvd_level: 8,
        }
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    let rem = value % align;
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}

/// Derived geometry: where headers end and user data begins, and how large a LEB is before any
/// per-volume `data_pad` is subtracted.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub peb_size: u32,
    pub vid_hdr_offset: u32,
    pub leb_start: u32,
    pub leb_size: u32,
}

impl Layout {
    pub fn compute(cfg: &DeviceConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(cfg.min_io_size > 0, "min_io_size must be nonzero");
        anyhow::ensure!(cfg.peb_size > 0, "peb_size must be nonzero");

        let ec_len = Ec::encoded_len() as u32;
        let vid_hdr_offset = align_up(ec_len, cfg.min_io_size);

        let vid_len = Vid::encoded_len() as u32;
        let leb_start = align_up(vid_hdr_offset + vid_len, cfg.min_io_size);

        anyhow::ensure!(
            leb_start < cfg.peb_size,
            "peb_size too small to hold EC/VID headers"
        );
        let leb_size = cfg.peb_size - leb_start;

        Ok(Self {
            peb_size: cfg.peb_size,
            vid_hdr_offset,
            leb_start,
            leb_size,
        })
    }

    /// The usable size of a LEB belonging to a volume with the given `data_pad`.
    pub fn usable_leb_size(&self, data_pad: u32) -> u32 {
        self.leb_size - data_pad
    }
}

#[test]
fn test_layout_alignment() {
    let cfg = DeviceConfig {
        peb_size: 128 * 1024,
        min_io_size: 2048,
        ..Default::default()
    };
    let layout = Layout::compute(&cfg).unwrap();

    assert_eq!(layout.vid_hdr_offset % cfg.min_io_size, 0);
    assert_eq!(layout.leb_start % cfg.min_io_size, 0);
    assert!(layout.vid_hdr_offset > 0);
    assert!(layout.leb_start > layout.vid_hdr_offset);
    assert_eq!(layout.leb_size, layout.peb_size - layout.leb_start);
}

#[test]
fn test_small_peb_rejected() {
    let cfg = DeviceConfig {
        peb_size: 64,
        min_io_size: 2048,
        ..Default::default()
    };
    assert!(Layout::compute(&cfg).is_err());
}
