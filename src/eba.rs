//! Eraseblock association: the `(vol_id, lnum) -> pnum` mapping, a refcounted per-LEB lock
//! tree, and the crash-safe write/atomic-change/copy primitives built over [`crate::io`] and
//! [`crate::wl`] (distilled spec §4.4).
//!
//! The lock tree mirrors the original kernel module's `ubi_ltree_entry`: an entry is created on
//! first use, its refcount rises on every acquire, and it is dropped from the tree once the
//! refcount returns to zero — except here the entry itself is an `std::sync::RwLock` instead of
//! the kernel's `rw_semaphore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{UbiError, UbiResult};
use crate::headers::{Vid, VolType};
use crate::io::{self, IoReadResult};
use crate::layout::{Layout, EC_UNKNOWN, LEB_UNMAPPED};
use crate::nand::Nand;
use crate::wl::{MoveOutcome, Wl};

struct LtreeEntry {
    lock: Arc<RwLock<()>>,
    refcount: usize,
}

#[derive(Default)]
struct Ltree {
    entries: Mutex<HashMap<(u32, u32), LtreeEntry>>,
}

impl Ltree {
    fn acquire(&self, key: (u32, u32)) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key).or_insert_with(|| LtreeEntry {
            lock: Arc::new(RwLock::new(())),
            refcount: 0,
        });
        entry.refcount += 1;
        entry.lock.clone()
    }

    fn release(&self, key: (u32, u32)) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(&key);
            }
        }
    }

    /// Entries currently tracked, for tests asserting the tree doesn't leak.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// A held `(vol_id, lnum)` lock. Dropping it releases the lock tree's reference on that entry.
struct LebHandle<'a> {
    ltree: &'a Ltree,
    key: (u32, u32),
    arc: Arc<RwLock<()>>,
}

impl LebHandle<'_> {
    fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.arc.read().unwrap()
    }

    fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.arc.write().unwrap()
    }
}

impl Drop for LebHandle<'_> {
    fn drop(&mut self) {
        self.ltree.release(self.key);
    }
}

/// Per-volume geometry EBA needs in order to build a correct VID header without round-tripping
/// through the volume table on every call.
#[derive(Debug, Clone, Copy)]
pub struct VolGeometry {
    pub vol_type: VolType,
    pub data_pad: u32,
    pub reserved_pebs: u32,
}

/// The eraseblock-association layer.
pub struct Eba {
    layout: Layout,
    tbl: Mutex<HashMap<u32, HashMap<u32, i64>>>,
    vols: Mutex<HashMap<u32, VolGeometry>>,
    corrupted: Mutex<std::collections::HashSet<u32>>,
    ltree: Ltree,
    alc_mutex: Mutex<()>,
    next_sqnum: AtomicU64,
}

impl Eba {
    /// `seed_sqnum` should be `attach_info.max_sqnum + 1` on a reattach, or 0 for a fresh device.
    pub fn new(layout: Layout, seed_sqnum: u64) -> Self {
        Self {
            layout,
            tbl: Mutex::new(HashMap::new()),
            vols: Mutex::new(HashMap::new()),
            corrupted: Mutex::new(std::collections::HashSet::new()),
            ltree: Ltree::default(),
            alc_mutex: Mutex::new(()),
            next_sqnum: AtomicU64::new(seed_sqnum),
        }
    }

    /// Flag a static volume as corrupted: every subsequent read of any LEB in it fails
    /// `UbiError::Corrupt`, regardless of the `check` argument to [`Eba::read`]. Set once, during
    /// attach, when a static-volume LEB's data fails its stored CRC (distilled spec §3).
    pub fn mark_corrupted(&self, vol_id: u32) {
        self.corrupted.lock().unwrap().insert(vol_id);
    }

    fn is_corrupted(&self, vol_id: u32) -> bool {
        self.corrupted.lock().unwrap().contains(&vol_id)
    }

    /// Atomically allocate and return the next sequence number.
    pub fn next_sqnum(&self) -> u64 {
        self.next_sqnum.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a volume's geometry (called by `vtbl.rs` on create, and once per volume found
    /// during attach).
    pub fn register_volume(&self, vol_id: u32, geometry: VolGeometry) {
        self.vols.lock().unwrap().insert(vol_id, geometry);
        self.tbl.lock().unwrap().entry(vol_id).or_default();
    }

    /// Seed a volume's LEB table from attach results.
    pub fn seed_mapping(&self, vol_id: u32, lnum: u32, pnum: u32) {
        self.tbl
            .lock()
            .unwrap()
            .entry(vol_id)
            .or_default()
            .insert(lnum, pnum as i64);
    }

    pub fn forget_volume(&self, vol_id: u32) {
        self.vols.lock().unwrap().remove(&vol_id);
        self.tbl.lock().unwrap().remove(&vol_id);
        self.corrupted.lock().unwrap().remove(&vol_id);
    }

    fn lock(&self, vol_id: u32, lnum: u32) -> LebHandle<'_> {
        let arc = self.ltree.acquire((vol_id, lnum));
        LebHandle {
            ltree: &self.ltree,
            key: (vol_id, lnum),
            arc,
        }
    }

    fn pnum_of(&self, vol_id: u32, lnum: u32) -> i64 {
        self.tbl
            .lock()
            .unwrap()
            .get(&vol_id)
            .and_then(|t| t.get(&lnum))
            .copied()
            .unwrap_or(LEB_UNMAPPED)
    }

    fn set_pnum(&self, vol_id: u32, lnum: u32, pnum: i64) {
        self.tbl
            .lock()
            .unwrap()
            .entry(vol_id)
            .or_default()
            .insert(lnum, pnum);
    }

    /// Find the `(vol_id, lnum)` currently mapped to `pnum`, if any (the executor uses this to
    /// resolve a WL move-source PEB back to the LEB it backs, since WL tracks PEBs, not LEBs).
    pub fn find_mapping(&self, pnum: u32) -> Option<(u32, u32)> {
        let tbl = self.tbl.lock().unwrap();
        tbl.iter().find_map(|(&vol_id, lebs)| {
            lebs.iter()
                .find(|&(_, &p)| p == pnum as i64)
                .map(|(&lnum, _)| (vol_id, lnum))
        })
    }

    /// Write a fresh EC header (`ec = 0`) to `pnum` if WL's bookkeeping shows it's never been
    /// erased in this attach session (its tracked ec is still [`EC_UNKNOWN`], the sentinel
    /// attach leaves on a virgin PEB). A PEB that has already gone through an erase cycle
    /// already carries a valid on-flash header courtesy of `io::sync_erase`, and rewriting page
    /// 0 a second time would violate the monotonic-write rule NAND pages enforce.
    fn ensure_ec_hdr<N: Nand>(&self, nand: &mut N, wl: &Wl, pnum: u32) -> anyhow::Result<()> {
        if wl.ec_of(pnum) == Some(EC_UNKNOWN) {
            let ec = crate::headers::Ec {
                ec: 0,
                vid_hdr_offset: self.layout.vid_hdr_offset,
                data_offset: self.layout.leb_start,
                image_seq: 0,
            };
            io::write_ec_hdr(nand, pnum, ec)?;
        }
        Ok(())
    }

    fn geometry(&self, vol_id: u32) -> UbiResult<VolGeometry> {
        self.vols
            .lock()
            .unwrap()
            .get(&vol_id)
            .copied()
            .ok_or_else(|| UbiError::BadArg(format!("no such volume {vol_id}")))
    }

    /// Unmap `lnum`. Succeeds even if it was already unmapped.
    pub fn unmap(&self, wl: &mut Wl, vol_id: u32, lnum: u32) -> UbiResult<()> {
        let handle = self.lock(vol_id, lnum);
        let _guard = handle.write();

        let old = self.pnum_of(vol_id, lnum);
        self.set_pnum(vol_id, lnum, LEB_UNMAPPED);
        if old != LEB_UNMAPPED {
            wl.put_peb(old as u32, false);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes from `lnum` at `off`. An unmapped LEB reads back as all-0xFF, unless
    /// `notify_unmapped` is set, in which case the caller is told via `UbiError::NotMapped` rather
    /// than being handed a buffer of 0xFF indistinguishable from mapped-but-blank data (distilled
    /// spec §6: "NOT_MAPPED (informational for read on unmapped LEB when the caller requested that
    /// distinction)"). A corrected bit-flip schedules scrub but still reports success; `check`
    /// additionally verifies a static volume's stored data CRC.
    pub fn read<N: Nand>(
        &self,
        nand: &mut N,
        wl: &mut Wl,
        vol_id: u32,
        lnum: u32,
        off: u32,
        buf: &mut [u8],
        check: bool,
        notify_unmapped: bool,
    ) -> UbiResult<()> {
        if self.is_corrupted(vol_id) {
            return Err(UbiError::Corrupt);
        }

        let handle = self.lock(vol_id, lnum);
        let _guard = handle.read();

        let pnum = self.pnum_of(vol_id, lnum);
        if pnum == LEB_UNMAPPED {
            if notify_unmapped {
                return Err(UbiError::NotMapped);
            }
            buf.fill(0xFF);
            return Ok(());
        }
        let pnum = pnum as u32;

        match io::read_data(nand, &self.layout, pnum, off, buf)? {
            IoReadResult::Ok | IoReadResult::Ff => {}
            IoReadResult::Bitflips | IoReadResult::FfBitflips => wl.scrub_peb(pnum),
            IoReadResult::BadHdr | IoReadResult::BadHdrEbadmsg => return Err(UbiError::Corrupt),
        }

        if check {
            let geometry = self.geometry(vol_id)?;
            if geometry.vol_type == VolType::Static {
                self.verify_static_crc(nand, pnum)?;
            }
        }

        Ok(())
    }

    fn verify_static_crc<N: Nand>(&self, nand: &mut N, pnum: u32) -> UbiResult<()> {
        let (vid_result, vid) = io::read_vid_hdr(nand, &self.layout, pnum)?;
        let vid = match (vid_result, vid) {
            (IoReadResult::Ok | IoReadResult::Bitflips, Some(v)) => v,
            _ => return Err(UbiError::Corrupt),
        };

        let mut full = vec![0u8; vid.data_size as usize];
        match io::read_data(nand, &self.layout, pnum, 0, &mut full)? {
            IoReadResult::Ok | IoReadResult::Bitflips => {}
            _ => return Err(UbiError::Corrupt),
        }
        if crate::headers::UBI_CRC.checksum(&full) != vid.data_crc {
            return Err(UbiError::Corrupt);
        }
        Ok(())
    }

    /// Overlay `buf` at `off` onto `lnum`'s existing content (all-0xFF if unmapped), relocate
    /// the whole LEB onto a fresh PEB with a new VID header (`copy_flag = 0`), and swap the
    /// table entry. On write failure the target is torture-erased and the previous mapping is
    /// preserved.
    pub fn write<N: Nand>(
        &self,
        nand: &mut N,
        wl: &mut Wl,
        vol_id: u32,
        lnum: u32,
        off: u32,
        buf: &[u8],
    ) -> UbiResult<()> {
        let geometry = self.geometry(vol_id)?;
        let leb_size = self.layout.usable_leb_size(geometry.data_pad) as usize;

        let handle = self.lock(vol_id, lnum);
        let _guard = handle.write();

        let old = self.pnum_of(vol_id, lnum);
        let mut scratch = vec![0xFFu8; leb_size];
        if old != LEB_UNMAPPED {
            io::read_data(nand, &self.layout, old as u32, 0, &mut scratch)?;
        }

        let end = off as usize + buf.len();
        if end > scratch.len() {
            return Err(UbiError::BadArg(format!(
                "write of {} bytes at offset {off} exceeds LEB size {leb_size}",
                buf.len()
            )));
        }
        scratch[off as usize..end].copy_from_slice(buf);

        self.relocate(nand, wl, vol_id, lnum, old, &scratch, geometry, false, 0, 0)
    }

    /// Write a static-volume LEB, stamping `data_size`/`data_crc`/`used_ebs` into the VID header
    /// so attach-time verification and `read(check=true)` can catch corruption.
    pub fn write_leb_st<N: Nand>(
        &self,
        nand: &mut N,
        wl: &mut Wl,
        vol_id: u32,
        lnum: u32,
        buf: &[u8],
        used_ebs: u32,
    ) -> UbiResult<()> {
        let geometry = self.geometry(vol_id)?;
        let leb_size = self.layout.usable_leb_size(geometry.data_pad) as usize;
        if buf.len() > leb_size {
            return Err(UbiError::BadArg(format!(
                "static LEB data of {} bytes exceeds LEB size {leb_size}",
                buf.len()
            )));
        }

        let handle = self.lock(vol_id, lnum);
        let _guard = handle.write();

        let old = self.pnum_of(vol_id, lnum);
        let data_crc = crate::headers::UBI_CRC.checksum(buf);
        self.relocate(
            nand,
            wl,
            vol_id,
            lnum,
            old,
            buf,
            geometry,
            true,
            data_crc,
            used_ebs,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn relocate<N: Nand>(
        &self,
        nand: &mut N,
        wl: &mut Wl,
        vol_id: u32,
        lnum: u32,
        old: i64,
        data: &[u8],
        geometry: VolGeometry,
        is_static: bool,
        data_crc: u32,
        used_ebs: u32,
    ) -> UbiResult<()> {
        let target = wl.get_peb()?;
        self.ensure_ec_hdr(nand, wl, target)?;

        let vid = Vid {
            vol_type: geometry.vol_type,
            copy_flag: false,
            vol_id,
            lnum,
            sqnum: self.next_sqnum(),
            data_pad: geometry.data_pad,
            data_size: if is_static { data.len() as u32 } else { 0 },
            data_crc: if is_static { data_crc } else { 0 },
            used_ebs: if is_static { used_ebs } else { 0 },
            ..Default::default()
        };

        match io::write_vid_hdr_and_data(nand, &self.layout, target, vid, data) {
            Ok(()) => {
                self.set_pnum(vol_id, lnum, target as i64);
                if old != LEB_UNMAPPED {
                    wl.put_peb(old as u32, false);
                }
                Ok(())
            }
            Err(e) => {
                wl.put_peb(target, true);
                Err(UbiError::Io(e))
            }
        }
    }

    /// Serialize `f` device-wide (the atomic LEB change primitive, distilled spec §4.4): this
    /// must quiesce WL's source/target selection for the whole device, not just one LEB, so it
    /// takes a coarser lock than `write`.
    pub fn atomic_leb_change<N: Nand>(
        &self,
        nand: &mut N,
        wl: &mut Wl,
        vol_id: u32,
        lnum: u32,
        buf: &[u8],
    ) -> UbiResult<()> {
        let _alc = self.alc_mutex.lock().unwrap();
        self.write(nand, wl, vol_id, lnum, 0, buf)
    }

    /// WL's move primitive: copy the LEB mapped to `from` onto `to`, with `copy_flag = 1` and a
    /// fresh sqnum, then swap the table entry. If the mapping changed between when the caller
    /// chose `from` as a source and the write lock being granted, the move is abandoned as
    /// [`MoveOutcome::CancelRace`] rather than clobbering a newer write.
    pub fn copy_leb<N: Nand>(
        &self,
        nand: &mut N,
        wl: &Wl,
        vol_id: u32,
        lnum: u32,
        from: u32,
        to: u32,
    ) -> anyhow::Result<MoveOutcome> {
        let handle = self.lock(vol_id, lnum);
        let _guard = handle.write();

        self.ensure_ec_hdr(nand, wl, to)?;

        if self.pnum_of(vol_id, lnum) != from as i64 {
            return Ok(MoveOutcome::CancelRace);
        }

        let geometry = match self.geometry(vol_id) {
            Ok(g) => g,
            Err(_) => return Ok(MoveOutcome::CancelRace),
        };

        let leb_size = self.layout.usable_leb_size(geometry.data_pad) as usize;
        let mut data = vec![0u8; leb_size];
        let source_read = io::read_data(nand, &self.layout, from, 0, &mut data)?;
        if !matches!(
            source_read,
            IoReadResult::Ok | IoReadResult::Bitflips | IoReadResult::Ff | IoReadResult::FfBitflips
        ) {
            return Ok(MoveOutcome::SourceRdErr);
        }

        let vid = Vid {
            vol_type: geometry.vol_type,
            copy_flag: true,
            vol_id,
            lnum,
            sqnum: self.next_sqnum(),
            data_pad: geometry.data_pad,
            ..Default::default()
        };

        if io::write_vid_hdr_and_data(nand, &self.layout, to, vid, &data).is_err() {
            return Ok(MoveOutcome::TargetWrErr);
        }

        let mut verify = vec![0u8; leb_size];
        match io::read_data(nand, &self.layout, to, 0, &mut verify)? {
            IoReadResult::Ok | IoReadResult::Ff => {}
            IoReadResult::Bitflips | IoReadResult::FfBitflips => return Ok(MoveOutcome::TargetBitflips),
            IoReadResult::BadHdr | IoReadResult::BadHdrEbadmsg => return Ok(MoveOutcome::TargetRdErr),
        }
        if verify != data {
            return Ok(MoveOutcome::TargetRdErr);
        }

        if self.pnum_of(vol_id, lnum) != from as i64 {
            return Ok(MoveOutcome::CancelRace);
        }
        self.set_pnum(vol_id, lnum, to as i64);
        Ok(MoveOutcome::Ok)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::DeviceConfig;
    use crate::nand::{NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 8,
        bytes_per_page: 512,
    };

    fn fresh() -> (SimNand, Layout, Eba, Wl) {
        let nand = SimNand::new(TEST_LAYOUT);
        let layout = Layout::compute(&DeviceConfig {
            peb_size: TEST_LAYOUT.bytes_per_page as u32 * TEST_LAYOUT.pages_per_block,
            min_io_size: TEST_LAYOUT.bytes_per_page as u32,
            ..Default::default()
        })
        .unwrap();
        let eba = Eba::new(layout, 0);
        let free = (0..TEST_LAYOUT.blocks).map(|p| (p, 0u64));
        let wl = Wl::new(DeviceConfig::default(), free, [], []);
        (nand, layout, eba, wl)
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (mut nand, _layout, eba, mut wl) = fresh();
        eba.register_volume(
            0,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: 4,
            },
        );

        eba.write(&mut nand, &mut wl, 0, 0, 0, b"hello world").unwrap();

        let mut buf = vec![0u8; 11];
        eba.read(&mut nand, &mut wl, 0, 0, 0, &mut buf, false, false).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_unmapped_leb_reads_ff() {
        let (mut nand, _layout, eba, mut wl) = fresh();
        eba.register_volume(
            0,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: 4,
            },
        );

        let mut buf = vec![0u8; 16];
        eba.read(&mut nand, &mut wl, 0, 0, 0, &mut buf, false, false).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_unmapped_leb_with_notify_returns_not_mapped() {
        let (mut nand, _layout, eba, mut wl) = fresh();
        eba.register_volume(
            0,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: 4,
            },
        );

        let mut buf = vec![0u8; 16];
        let err = eba
            .read(&mut nand, &mut wl, 0, 0, 0, &mut buf, false, true)
            .unwrap_err();
        assert!(matches!(err, UbiError::NotMapped));

        // A mapped LEB is unaffected by the flag.
        eba.write(&mut nand, &mut wl, 0, 0, 0, b"mapped").unwrap();
        let mut buf = vec![0u8; 6];
        eba.read(&mut nand, &mut wl, 0, 0, 0, &mut buf, false, true).unwrap();
        assert_eq!(&buf, b"mapped");
    }

    #[test]
    fn test_overwrite_frees_old_peb() {
        let (mut nand, _layout, eba, mut wl) = fresh();
        eba.register_volume(
            0,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: 4,
            },
        );

        eba.write(&mut nand, &mut wl, 0, 0, 0, b"first").unwrap();
        eba.write(&mut nand, &mut wl, 0, 0, 0, b"second").unwrap();

        assert!(wl.next_job().is_some(), "overwrite should enqueue old PEB's erase");
    }

    #[test]
    fn test_unmap_then_read_ff() {
        let (mut nand, _layout, eba, mut wl) = fresh();
        eba.register_volume(
            0,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: 4,
            },
        );
        eba.write(&mut nand, &mut wl, 0, 0, 0, b"data").unwrap();
        eba.unmap(&mut wl, 0, 0).unwrap();

        let mut buf = vec![0u8; 4];
        eba.read(&mut nand, &mut wl, 0, 0, 0, &mut buf, false, false).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_ltree_does_not_leak_entries() {
        let (mut nand, _layout, eba, mut wl) = fresh();
        eba.register_volume(
            0,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: 4,
            },
        );
        eba.write(&mut nand, &mut wl, 0, 0, 0, b"x").unwrap();
        assert_eq!(eba.ltree.len(), 0);
    }

    #[test]
    fn test_copy_leb_moves_data_and_updates_mapping() {
        let (mut nand, _layout, eba, mut wl) = fresh();
        eba.register_volume(
            0,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: 4,
            },
        );
        eba.write(&mut nand, &mut wl, 0, 0, 0, b"payload").unwrap();
        let from = eba.pnum_of(0, 0) as u32;
        let to = wl.get_peb().unwrap();

        let outcome = eba.copy_leb(&mut nand, &wl, 0, 0, from, to).unwrap();
        assert_eq!(outcome, MoveOutcome::Ok);
        assert_eq!(eba.pnum_of(0, 0), to as i64);

        let mut buf = vec![0u8; 7];
        eba.read(&mut nand, &mut wl, 0, 0, 0, &mut buf, false, false).unwrap();
        assert_eq!(&buf, b"payload");
    }
}
