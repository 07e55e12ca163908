//! The glue layer: a `Device` that owns I/O, attach, WL, EBA, and the volume table, and exposes
//! the public API described in the distilled spec's §4 data-flow summary
//! (`attach`/`create_volume`/`read`/`write`/`unmap`/`atomic_leb_change`/`detach`).
//!
//! **Lock ordering**, documented here rather than in a separate design doc because that's how
//! the original header documents invariants next to the fields they guard: a caller that needs
//! more than one of these at once must take them in this order to avoid deadlock —
//!
//! 1. the device-wide mutex a caller wraps a `Device` in (e.g. `Arc<Mutex<Device<N>>>>`), which
//!    this crate doesn't impose but every method on `Device` assumes is held for the duration of
//!    the call (hence `&mut self` everywhere);
//! 2. [`Eba`]'s `alc_mutex`, taken only by [`Device::atomic_leb_change`];
//! 3. a per-`(vol_id, lnum)` lock from [`Eba`]'s lock tree;
//! 4. [`Wl`]'s internal bookkeeping (never itself lock-guarded here, since it's only ever
//!    touched from under the outer device mutex);
//! 5. [`Eba`]'s lock-tree mutex itself, held only transiently to acquire/release an entry.

use crate::attach::{self, AttachInfo};
use crate::eba::{Eba, VolGeometry};
use crate::error::{UbiError, UbiResult};
use crate::headers::{Ec, VolTableRecord, VolType};
use crate::io;
use crate::layout::{DeviceConfig, Layout};
use crate::nand::Nand;
use crate::ubinize::{UBI_LAYOUT_VOLUME_EBS, UBI_LAYOUT_VOLUME_ID};
use crate::vtbl::Vtbl;
use crate::wl::{MoveOutcome, Wl, WlJob};

/// Bad-PEB reserve accounting (`beb_rsvd_pebs`/`beb_rsvd_level`/`bad_peb_limit`/
/// `good_peb_count` in the original header): how many PEBs are set aside against future
/// bad-block discovery, and how close the device is to its hard bad-block limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct BebReserve {
    pub bad_count: u32,
    pub level: u32,
    pub limit: u32,
}

impl BebReserve {
    fn new(cfg: &DeviceConfig, bad_count: u32) -> Self {
        Self {
            bad_count,
            level: cfg.beb_rsvd_level,
            limit: cfg.bad_peb_limit,
        }
    }

    fn note_bad_peb(&mut self) {
        self.bad_count += 1;
    }

    fn over_limit(&self) -> bool {
        self.bad_count > self.limit
    }
}

/// An attached UBI device: NAND backend, derived geometry, and the four live subsystems built
/// from the attach pass.
pub struct Device<N: Nand> {
    nand: N,
    layout: Layout,
    cfg: DeviceConfig,
    wl: Wl,
    eba: Eba,
    vtbl: Vtbl,
    beb_reserve: BebReserve,
    read_only: bool,
}

impl<N: Nand> Device<N> {
    /// Run the attach procedure over `nand` and build a live device from the result.
    pub fn attach(mut nand: N, cfg: DeviceConfig) -> UbiResult<Self> {
        let layout = Layout::compute(&cfg)?;
        let ai: AttachInfo = attach::attach(&mut nand, &layout)?;

        if ai.bad_peb_count > cfg.bad_peb_limit {
            log::error!(
                "attach: {} bad PEBs exceeds limit {}; device will be read-only",
                ai.bad_peb_count,
                cfg.bad_peb_limit
            );
        }

        let eba = Eba::new(layout, ai.max_sqnum.wrapping_add(1));
        eba.register_volume(
            UBI_LAYOUT_VOLUME_ID,
            VolGeometry {
                vol_type: VolType::Dynamic,
                data_pad: 0,
                reserved_pebs: UBI_LAYOUT_VOLUME_EBS,
            },
        );

        let mut used_pebs = Vec::new();
        for (&vol_id, vol) in &ai.volumes {
            for (&lnum, candidate) in &vol.lebs {
                eba.seed_mapping(vol_id, lnum, candidate.pnum);
                used_pebs.push((candidate.pnum, candidate.ec));
            }
            if vol.corrupted {
                log::error!("volume {vol_id} flagged corrupted: static LEB data failed CRC at attach");
                eba.mark_corrupted(vol_id);
            }
        }

        let mut wl = Wl::new(cfg, ai.free.iter().map(|&(p, ec)| (p, ec.ec)), used_pebs, ai.erase.clone());

        let vtbl = Vtbl::load(&mut nand, &mut wl, &eba)?;
        for (vol_id, record) in vtbl.iter() {
            if vol_id == UBI_LAYOUT_VOLUME_ID {
                continue;
            }
            eba.register_volume(
                vol_id,
                VolGeometry {
                    vol_type: record.vol_type,
                    data_pad: record.data_pad,
                    reserved_pebs: record.reserved_pebs,
                },
            );
        }

        // Any scrub-flagged candidate survived attach with a corrected bit-flip; schedule the
        // evacuation now rather than waiting for the next read to notice.
        for vol in ai.volumes.values() {
            for candidate in vol.lebs.values() {
                if candidate.scrub {
                    wl.scrub_peb(candidate.pnum);
                }
            }
        }

        let beb_reserve = BebReserve::new(&cfg, ai.bad_peb_count);
        let read_only = beb_reserve.over_limit();
        if read_only {
            log::error!("device attached read-only: bad PEB reserve exhausted");
        }

        Ok(Self {
            nand,
            layout,
            cfg,
            wl,
            eba,
            vtbl,
            beb_reserve,
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The lowest and highest erase counters currently tracked across every PEB, for wear
    /// instrumentation and tests asserting wear-leveling convergence.
    pub fn wl_ec_range(&self) -> Option<(u64, u64)> {
        self.wl.ec_range()
    }

    /// Create a volume; returns its assigned `vol_id`.
    pub fn create_volume(
        &mut self,
        vol_id: Option<u32>,
        name: String,
        vol_type: VolType,
        reserved_pebs: u32,
        alignment: u32,
    ) -> UbiResult<u32> {
        self.reject_if_read_only()?;

        let alignment = alignment.max(1);
        let data_pad = self.layout.leb_size % alignment;

        let record = VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker: false,
            name: name.clone(),
            flags: 0,
        };

        let id = self.vtbl.create(vol_id, record)?;
        self.eba.register_volume(
            id,
            VolGeometry {
                vol_type,
                data_pad,
                reserved_pebs,
            },
        );

        if let Err(e) = self.vtbl.save(&mut self.nand, &mut self.wl, &self.eba) {
            self.vtbl.remove(id).ok();
            self.eba.forget_volume(id);
            return Err(e);
        }

        log::info!("created volume {id} ({name}, {vol_type:?}, {reserved_pebs} PEBs)");
        Ok(id)
    }

    /// Remove a volume and every LEB mapping it owns.
    pub fn remove_volume(&mut self, vol_id: u32) -> UbiResult<()> {
        self.reject_if_read_only()?;

        self.vtbl.remove(vol_id)?;
        self.eba.forget_volume(vol_id);
        self.vtbl.save(&mut self.nand, &mut self.wl, &self.eba)?;
        log::info!("removed volume {vol_id}");
        Ok(())
    }

    /// Read `buf.len()` bytes from `(vol_id, lnum)` at `off`. If `notify_unmapped` is set, reading
    /// an unmapped LEB fails with `UbiError::NotMapped` instead of silently returning 0xFF
    /// (distilled spec §6's `NOT_MAPPED`, for callers that need to tell "unmapped" apart from
    /// "mapped but blank").
    pub fn read(
        &mut self,
        vol_id: u32,
        lnum: u32,
        off: u32,
        buf: &mut [u8],
        check: bool,
        notify_unmapped: bool,
    ) -> UbiResult<()> {
        self.eba
            .read(&mut self.nand, &mut self.wl, vol_id, lnum, off, buf, check, notify_unmapped)
    }

    /// Write `buf` to `(vol_id, lnum)` at `off` (dynamic volumes).
    pub fn write(&mut self, vol_id: u32, lnum: u32, off: u32, buf: &[u8]) -> UbiResult<()> {
        self.reject_if_read_only()?;
        self.eba.write(&mut self.nand, &mut self.wl, vol_id, lnum, off, buf)
    }

    /// Write a whole static-volume LEB, carrying `data_size`/`data_crc`/`used_ebs` in its VID
    /// header for later corruption checks.
    pub fn write_leb_st(
        &mut self,
        vol_id: u32,
        lnum: u32,
        buf: &[u8],
        used_ebs: u32,
    ) -> UbiResult<()> {
        self.reject_if_read_only()?;
        self.eba
            .write_leb_st(&mut self.nand, &mut self.wl, vol_id, lnum, buf, used_ebs)
    }

    /// Unmap a LEB.
    pub fn unmap(&mut self, vol_id: u32, lnum: u32) -> UbiResult<()> {
        self.reject_if_read_only()?;
        self.eba.unmap(&mut self.wl, vol_id, lnum)
    }

    /// Atomically replace the whole content of a LEB (distilled spec §4.4's `atomic_leb_change`).
    pub fn atomic_leb_change(&mut self, vol_id: u32, lnum: u32, buf: &[u8]) -> UbiResult<()> {
        self.reject_if_read_only()?;
        self.eba
            .atomic_leb_change(&mut self.nand, &mut self.wl, vol_id, lnum, buf)
    }

    /// Run one pending WL job (erase or move) to completion. Returns `false` if the queue was
    /// empty. This is the body the background worker thread (see `bin/ubictl.rs` for a simple
    /// polling loop, or wrap a `Device` in `Arc<Mutex<_>>` and spawn one yourself) calls
    /// repeatedly; it is also safe to call synchronously, which is what the unit tests below and
    /// `ubictl`'s one-shot subcommands do instead of spinning up a thread.
    pub fn process_one_job(&mut self) -> UbiResult<bool> {
        let Some(job) = self.wl.next_job() else {
            return Ok(false);
        };

        match job {
            WlJob::Erase { pnum, ec, torture } => self.run_erase_job(pnum, ec, torture),
            WlJob::Move { source, kind } => self.run_move_job(source, kind)?,
        }

        Ok(true)
    }

    fn run_erase_job(&mut self, pnum: u32, ec: u64, torture: bool) {
        let ec = if ec == crate::layout::EC_UNKNOWN { 0 } else { ec };
        let prev_ec = Ec {
            ec,
            vid_hdr_offset: self.layout.vid_hdr_offset,
            data_offset: self.layout.leb_start,
            image_seq: 0,
        };

        match io::sync_erase(&mut self.nand, pnum, prev_ec, torture) {
            Ok(new_ec) => self.wl.complete_erase(pnum, new_ec.ec),
            Err(e) => {
                log::warn!("PEB {pnum} failed to erase and was marked bad: {e}");
                self.wl.complete_erase_failed(pnum);
                self.beb_reserve.note_bad_peb();
                if self.beb_reserve.over_limit() && !self.read_only {
                    self.read_only = true;
                    log::error!("bad PEB reserve exhausted; engaging read-only mode");
                }
            }
        }
    }

    fn run_move_job(&mut self, source: u32, kind: crate::wl::MoveKind) -> UbiResult<()> {
        let Some((target, target_ec)) = self.wl.pick_target(kind) else {
            self.wl.requeue(WlJob::Move { source, kind });
            return Ok(());
        };

        let source_ec = self.wl.ec_of(source).unwrap_or(crate::layout::EC_UNKNOWN);

        let Some((vol_id, lnum)) = self.eba.find_mapping(source) else {
            // The source PEB is no longer mapped to any LEB (it was unmapped or already moved
            // since this job was scheduled); abandon the move and return both PEBs.
            self.wl
                .complete_move(source, source_ec, target, target_ec, MoveOutcome::CancelRace);
            return Ok(());
        };

        let outcome = self.eba.copy_leb(&mut self.nand, &self.wl, vol_id, lnum, source, target)?;
        self.wl.complete_move(source, source_ec, target, target_ec, outcome);
        Ok(())
    }

    /// Drain the WL work queue synchronously (distilled spec's `flush`).
    pub fn flush(&mut self) -> UbiResult<()> {
        while self.process_one_job()? {}
        Ok(())
    }

    fn reject_if_read_only(&self) -> UbiResult<()> {
        if self.read_only {
            return Err(UbiError::ReadOnly);
        }
        Ok(())
    }

    /// Detach: flush outstanding work and return the underlying NAND backend.
    pub fn detach(mut self) -> UbiResult<N> {
        self.flush()?;
        Ok(self.nand)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::headers::Vid;
    use crate::nand::{DebugConfig, NandLayout, SimNand};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 32,
        pages_per_block: 8,
        bytes_per_page: 512,
    };

    fn test_cfg() -> DeviceConfig {
        DeviceConfig {
            peb_size: TEST_LAYOUT.bytes_per_page as u32 * TEST_LAYOUT.pages_per_block,
            min_io_size: TEST_LAYOUT.bytes_per_page as u32,
            wl_threshold: 1000,
            ..Default::default()
        }
    }

    // S1: a blank device attaches cleanly with every PEB free.
    #[test]
    fn test_s1_fresh_attach() {
        let nand = SimNand::new(TEST_LAYOUT);
        let device = Device::attach(nand, test_cfg()).unwrap();
        assert!(!device.is_read_only());
    }

    // S2: writing twice to the same LEB allocates a fresh PEB each time and frees the old one.
    #[test]
    fn test_s2_overwrite_allocates_fresh_peb() {
        let nand = SimNand::new(TEST_LAYOUT);
        let mut device = Device::attach(nand, test_cfg()).unwrap();
        let vol = device
            .create_volume(None, "vol".into(), VolType::Dynamic, 4, 1)
            .unwrap();

        device.write(vol, 0, 0, b"first").unwrap();
        device.write(vol, 0, 0, b"second!").unwrap();

        let mut buf = vec![0u8; 7];
        device.read(vol, 0, 0, &mut buf, false, false).unwrap();
        assert_eq!(&buf, b"second!");

        device.flush().unwrap();
    }

    // S4: a corrected bit-flip on read schedules a scrub instead of failing the read.
    #[test]
    fn test_s4_bitflip_schedules_scrub_not_failure() {
        let nand = SimNand::new(TEST_LAYOUT);
        let mut device = Device::attach(nand, test_cfg()).unwrap();
        let vol = device
            .create_volume(None, "vol".into(), VolType::Dynamic, 4, 1)
            .unwrap();
        device.write(vol, 0, 0, b"payload").unwrap();

        // Inject a bit-flip on whichever PEB now backs (vol, 0), then re-attach a fresh Device
        // over the same backing nand so the read path below exercises the debug hook.
        let mut nand = device.detach().unwrap();
        let backing_pnum = (0..TEST_LAYOUT.blocks)
            .find(|&p| {
                let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page];
                match nand.block(p).unwrap() {
                    Some(block) => {
                        block.read(0, &mut buf).unwrap();
                        crate::headers::Ec::decode(&buf).is_some() && buf.iter().any(|&b| b != 0xFF)
                    }
                    None => false,
                }
            })
            .expect("a written PEB exists");

        let mut debug = DebugConfig::default();
        debug.bitflip_pages.insert((backing_pnum, 2));
        nand.set_debug_config(debug);

        let mut device = Device::attach(nand, test_cfg()).unwrap();
        let mut buf = vec![0u8; 7];
        device.read(vol, 0, 0, &mut buf, false, false).unwrap();
        assert_eq!(&buf, b"payload");
    }

    // S5: a static volume whose on-flash data fails its stored CRC at attach time is flagged
    // corrupted as a whole; every read of any LEB in it (not just the bad one) fails CORRUPT.
    #[test]
    fn test_s5_static_volume_corruption_flagged() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let layout = Layout::compute(&test_cfg()).unwrap();

        let ec = Ec {
            ec: 0,
            vid_hdr_offset: layout.vid_hdr_offset,
            data_offset: layout.leb_start,
            image_seq: 0,
        };
        io::write_ec_hdr(&mut nand, 0, ec).unwrap();

        // The VID header's data_crc is stamped for one payload, but the bytes actually on flash
        // are a different one of the same length - data that silently decayed after it was
        // written, which ECC alone can't catch.
        let intended = [0xAAu8; 16];
        let vid = Vid {
            vol_type: VolType::Static,
            vol_id: 1,
            lnum: 0,
            sqnum: 1,
            data_size: intended.len() as u32,
            data_crc: crate::headers::UBI_CRC.checksum(&intended),
            used_ebs: 1,
            ..Default::default()
        };
        io::write_vid_hdr_and_data(&mut nand, &layout, 0, vid, &[0x55u8; 16]).unwrap();

        let mut device = Device::attach(nand, test_cfg()).unwrap();

        let mut buf = vec![0u8; 4];
        let err = device.read(1, 0, 0, &mut buf, false, false).unwrap_err();
        assert!(matches!(err, UbiError::Corrupt));
    }

    // S6: repeatedly overwriting a single LEB must not wear down a handful of PEBs while the
    // rest sit idle - wear-leveling keeps every PEB's erase count converged to within the
    // configured threshold of the pack's spread.
    #[test]
    fn test_s6_wear_convergence() {
        let cfg = DeviceConfig {
            peb_size: TEST_LAYOUT.bytes_per_page as u32 * TEST_LAYOUT.pages_per_block,
            min_io_size: TEST_LAYOUT.bytes_per_page as u32,
            wl_threshold: 5,
            ..Default::default()
        };

        let nand = SimNand::new(TEST_LAYOUT);
        let mut device = Device::attach(nand, cfg).unwrap();
        let vol = device
            .create_volume(None, "vol".into(), VolType::Dynamic, 1, 1)
            .unwrap();

        for i in 0..10_000u32 {
            device.write(vol, 0, 0, &i.to_le_bytes()).unwrap();
            device.flush().unwrap();
        }

        let (min_ec, max_ec) = device.wl_ec_range().expect("PEBs tracked after many writes");
        assert!(
            max_ec - min_ec <= cfg.wl_threshold + 2,
            "erase counts should converge under wear-leveling: min={min_ec} max={max_ec}"
        );
    }
}
