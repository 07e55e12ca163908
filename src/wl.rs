//! Wear-leveling: the `free`/`used`/`scrub` PEB sets ordered by erase counter, the `erroneous`
//! quarantine, the protection queue, and the FIFO work queue that schedules erase and PEB-move
//! jobs (distilled spec §4.3).
//!
//! This module owns only the *bookkeeping*: which PEB is in which set, and what work is
//! outstanding. It has no access to flash I/O or the EBA locks a move needs, by design — the
//! background worker that actually executes a job (erasing a PEB via [`crate::io`], or copying a
//! LEB via `eba::copy_leb`) lives on `Device`, the only place both NAND access and EBA's locks
//! are available, and reports back through [`Wl::complete_erase`]/[`Wl::complete_move`]. This is
//! the same split the teacher's own `format.rs` makes between "decide what to do"
//! (`erase_action`) and "do it" (`FormatAction::execute`), generalized to a persistent queue
//! instead of a one-shot pass.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{UbiError, UbiResult};
use crate::layout::{DeviceConfig, PROT_QUEUE_LEN};

/// The outcome of a PEB-move job, mirroring the original kernel module's `MOVE_*` return codes.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum MoveOutcome {
    /// The copy completed and the EBA table now points at the target.
    Ok,
    /// The volume was deleted, or concurrent I/O raced the move; the job is abandoned.
    CancelRace,
    /// The source PEB could not be read.
    SourceRdErr,
    /// The target PEB could not be read back for verification.
    TargetRdErr,
    /// The target PEB could not be written.
    TargetWrErr,
    /// The target PEB reported a corrected bit-flip on verification; don't keep it.
    TargetBitflips,
    /// Transient failure; try the same source again.
    Retry,
}

/// Why a move job was scheduled, which decides victim/target selection and the priority it
/// competes with other pending jobs at.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum MoveKind {
    /// Routine wear-leveling: move data off a low-ec PEB onto a high-ec one.
    WearLevel,
    /// The source PEB reported a bit-flip and must be evacuated.
    Scrub,
}

/// One item of outstanding work.
#[derive(Debug, Clone)]
pub enum WlJob {
    /// Erase `pnum` (previously at `ec`) and return it to the free set.
    Erase { pnum: u32, ec: u64, torture: bool },
    /// Move the LEB currently mapped to `source` onto some free PEB (chosen by the executor).
    Move { source: u32, kind: MoveKind },
}

#[derive(Debug, Default, Clone)]
struct EcSet {
    by_ec: BTreeMap<u64, Vec<u32>>,
    ec_of: HashMap<u32, u64>,
}

impl EcSet {
    fn insert(&mut self, pnum: u32, ec: u64) {
        self.by_ec.entry(ec).or_default().push(pnum);
        self.ec_of.insert(pnum, ec);
    }

    fn remove(&mut self, pnum: u32) -> Option<u64> {
        let ec = self.ec_of.remove(&pnum)?;
        if let Some(v) = self.by_ec.get_mut(&ec) {
            v.retain(|&x| x != pnum);
            if v.is_empty() {
                self.by_ec.remove(&ec);
            }
        }
        Some(ec)
    }

    fn pop_lowest(&mut self) -> Option<(u32, u64)> {
        let (&ec, pnums) = self.by_ec.iter_mut().next()?;
        let pnum = pnums.remove(0);
        if pnums.is_empty() {
            self.by_ec.remove(&ec);
        }
        self.ec_of.remove(&pnum);
        Some((pnum, ec))
    }

    fn pop_highest(&mut self) -> Option<(u32, u64)> {
        let (&ec, pnums) = self.by_ec.iter_mut().next_back()?;
        let pnum = pnums.remove(0);
        if pnums.is_empty() {
            self.by_ec.remove(&ec);
        }
        self.ec_of.remove(&pnum);
        Some((pnum, ec))
    }

    fn min_ec(&self) -> Option<u64> {
        self.by_ec.keys().next().copied()
    }

    fn max_ec(&self) -> Option<u64> {
        self.by_ec.keys().next_back().copied()
    }

    fn len(&self) -> usize {
        self.ec_of.len()
    }

    fn contains(&self, pnum: u32) -> bool {
        self.ec_of.contains_key(&pnum)
    }
}

/// The wear-leveling engine's bookkeeping state.
#[derive(Debug)]
pub struct Wl {
    free: EcSet,
    used: EcSet,
    scrub: EcSet,
    erroneous: HashSet<u32>,
    erroneous_strikes: HashMap<u32, u32>,

    /// PEBs that have recently been (re)written and are ineligible as move sources until they
    /// age out of the queue (`PROT_QUEUE_LEN` ticks).
    prot_queue: VecDeque<Vec<u32>>,
    protected: HashSet<u32>,

    work: VecDeque<WlJob>,

    cfg: DeviceConfig,
}

impl Wl {
    /// Build a fresh WL state from attach's `free` list and the set of PEBs that need erasing
    /// before they can be reused (distilled spec §4.2's `free`/`erase` attach-info lists).
    pub fn new(
        cfg: DeviceConfig,
        free_pebs: impl IntoIterator<Item = (u32, u64)>,
        used_pebs: impl IntoIterator<Item = (u32, u64)>,
        erase_pebs: impl IntoIterator<Item = u32>,
    ) -> Self {
        let mut free = EcSet::default();
        for (pnum, ec) in free_pebs {
            free.insert(pnum, ec);
        }

        let mut used = EcSet::default();
        for (pnum, ec) in used_pebs {
            used.insert(pnum, ec);
        }

        let mut work = VecDeque::new();
        for pnum in erase_pebs {
            work.push_back(WlJob::Erase {
                pnum,
                ec: crate::layout::EC_UNKNOWN,
                torture: false,
            });
        }

        Self {
            free,
            used,
            scrub: EcSet::default(),
            erroneous: HashSet::new(),
            erroneous_strikes: HashMap::new(),
            prot_queue: std::iter::repeat_with(Vec::new).take(PROT_QUEUE_LEN).collect(),
            protected: HashSet::new(),
            work,
            cfg,
        }
    }

    /// Number of PEBs immediately available for allocation.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pop the lowest-ec free PEB for use as a new LEB mapping. The caller is responsible for
    /// writing a fresh EC header before handing the PEB to a writer, and for retrying via
    /// [`Wl::next_job`]/[`Wl::complete_erase`] first if this returns [`UbiError::NoSpace`].
    pub fn get_peb(&mut self) -> UbiResult<u32> {
        let (pnum, ec) = self.free.pop_lowest().ok_or(UbiError::NoSpace)?;
        self.used.insert(pnum, ec);
        self.protect(pnum);
        self.maybe_schedule_wl_move();
        Ok(pnum)
    }

    /// Return a PEB to the erase queue, from whichever set it currently belongs to.
    pub fn put_peb(&mut self, pnum: u32, torture: bool) {
        let ec = self
            .used
            .remove(pnum)
            .or_else(|| self.scrub.remove(pnum))
            .unwrap_or(crate::layout::EC_UNKNOWN);
        self.erroneous.remove(&pnum);
        self.erroneous_strikes.remove(&pnum);
        self.unprotect(pnum);
        self.work.push_back(WlJob::Erase { pnum, ec, torture });
    }

    /// Move a PEB from `used` into `scrub` (no-op if already there or unknown) and schedule an
    /// evacuation move.
    pub fn scrub_peb(&mut self, pnum: u32) {
        if let Some(ec) = self.used.remove(pnum) {
            self.scrub.insert(pnum, ec);
        }
        if self.scrub.contains(pnum) {
            self.work.push_back(WlJob::Move {
                source: pnum,
                kind: MoveKind::Scrub,
            });
        }
    }

    /// Is there no outstanding work? `flush()` in the distilled spec is "block until this is
    /// true"; the blocking itself is the executor's job (see `device.rs`).
    pub fn is_idle(&self) -> bool {
        self.work.is_empty()
    }

    /// Pop the next job for the executor to run.
    pub fn next_job(&mut self) -> Option<WlJob> {
        self.work.pop_front()
    }

    /// Push a job back onto the tail of the queue (used when the executor can't service it yet,
    /// e.g. a move with no free PEB to target).
    pub fn requeue(&mut self, job: WlJob) {
        self.work.push_back(job);
    }

    /// The erase counter of a PEB still resident in `used` or `scrub` (a move source, looked up
    /// by the executor before calling `eba::copy_leb`).
    pub fn ec_of(&self, pnum: u32) -> Option<u64> {
        self.used
            .ec_of
            .get(&pnum)
            .or_else(|| self.scrub.ec_of.get(&pnum))
            .copied()
    }

    /// Report that an erase job for `pnum` succeeded, producing a fresh `new_ec`. Returns the PEB
    /// to `free` and advances the protection queue tick.
    pub fn complete_erase(&mut self, pnum: u32, new_ec: u64) {
        self.free.insert(pnum, new_ec);
        self.advance_tick();
    }

    /// Report that an erase job for `pnum` failed (the executor has already marked it bad via
    /// the NAND layer). The PEB is simply dropped from every WL set.
    pub fn complete_erase_failed(&mut self, pnum: u32) {
        self.used.remove(pnum);
        self.scrub.remove(pnum);
        self.free.remove(pnum);
        self.erroneous.remove(&pnum);
        self.erroneous_strikes.remove(&pnum);
    }

    /// React to the outcome of a move job, per the distilled spec's reaction table.
    pub fn complete_move(&mut self, source: u32, source_ec: u64, target: u32, target_ec: u64, outcome: MoveOutcome) {
        match outcome {
            MoveOutcome::Ok => {
                self.used.insert(target, target_ec);
                self.unprotect(source);
                self.work.push_back(WlJob::Erase {
                    pnum: source,
                    ec: source_ec,
                    torture: false,
                });
            }
            MoveOutcome::CancelRace => {
                self.used.insert(source, source_ec);
                self.free.insert(target, target_ec);
            }
            MoveOutcome::SourceRdErr => {
                self.free.insert(target, target_ec);
                let strikes = self.erroneous_strikes.entry(source).or_insert(0);
                *strikes += 1;
                if (*strikes as usize) >= self.cfg.max_erroneous {
                    self.work.push_back(WlJob::Erase {
                        pnum: source,
                        ec: source_ec,
                        torture: true,
                    });
                } else {
                    self.erroneous.insert(source);
                }
            }
            MoveOutcome::TargetRdErr | MoveOutcome::TargetWrErr => {
                self.work.push_back(WlJob::Erase {
                    pnum: target,
                    ec: target_ec,
                    torture: true,
                });
                self.work.push_back(WlJob::Move {
                    source,
                    kind: MoveKind::WearLevel,
                });
            }
            MoveOutcome::TargetBitflips => {
                self.scrub.insert(target, target_ec);
                self.work.push_back(WlJob::Move {
                    source,
                    kind: MoveKind::WearLevel,
                });
            }
            MoveOutcome::Retry => {
                self.used.insert(source, source_ec);
                self.free.insert(target, target_ec);
                self.work.push_back(WlJob::Move {
                    source,
                    kind: MoveKind::WearLevel,
                });
            }
        }
    }

    /// Choose a target PEB for a move of the given kind: the highest-ec free PEB for a routine
    /// wear-leveling move (so low-wear data lands on a high-wear block), or any free PEB for a
    /// scrub (urgency outweighs wear optimality).
    pub fn pick_target(&mut self, kind: MoveKind) -> Option<(u32, u64)> {
        match kind {
            MoveKind::WearLevel => self.free.pop_highest(),
            MoveKind::Scrub => self.free.pop_lowest(),
        }
    }

    /// PEBs currently marked erroneous (quarantined after a source read error, not yet retired).
    pub fn erroneous_pebs(&self) -> impl Iterator<Item = u32> + '_ {
        self.erroneous.iter().copied()
    }

    /// The lowest and highest erase counters currently tracked across every PEB set (free, used,
    /// and scrub). `None` if WL isn't tracking any PEB at all.
    pub fn ec_range(&self) -> Option<(u64, u64)> {
        let min = [self.free.min_ec(), self.used.min_ec(), self.scrub.min_ec()]
            .into_iter()
            .flatten()
            .min()?;
        let max = [self.free.max_ec(), self.used.max_ec(), self.scrub.max_ec()]
            .into_iter()
            .flatten()
            .max()?;
        Some((min, max))
    }

    fn protect(&mut self, pnum: u32) {
        self.protected.insert(pnum);
        self.prot_queue.back_mut().expect("nonempty queue").push(pnum);
    }

    fn unprotect(&mut self, pnum: u32) {
        self.protected.remove(&pnum);
        for slot in &mut self.prot_queue {
            slot.retain(|&x| x != pnum);
        }
    }

    /// Is `pnum` ineligible as a move source because it was only just written?
    pub fn is_protected(&self, pnum: u32) -> bool {
        self.protected.contains(&pnum)
    }

    /// Advance the global erase tick: drop the oldest protection-queue slot back into general
    /// eligibility and open a fresh slot at the tail.
    fn advance_tick(&mut self) {
        if let Some(expired) = self.prot_queue.pop_front() {
            for pnum in expired {
                self.protected.remove(&pnum);
            }
        }
        self.prot_queue.push_back(Vec::new());
    }

    /// If the wear skew between the lowest-ec used PEB and the highest-ec free PEB exceeds
    /// `wl_threshold`, schedule a routine wear-leveling move sourced from that used PEB (unless
    /// it's still protected).
    fn maybe_schedule_wl_move(&mut self) {
        let Some(max_free) = self.free.max_ec() else {
            return;
        };
        let Some(min_used) = self.used.min_ec() else {
            return;
        };
        if max_free.saturating_sub(min_used) <= self.cfg.wl_threshold {
            return;
        }

        let Some(&source) = self
            .used
            .by_ec
            .get(&min_used)
            .and_then(|v| v.iter().find(|&&p| !self.protected.contains(&p)))
        else {
            return;
        };

        let already_queued = self.work.iter().any(|job| {
            matches!(job, WlJob::Move { source: s, .. } if *s == source)
        });
        if !already_queued {
            self.work.push_back(WlJob::Move {
                source,
                kind: MoveKind::WearLevel,
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg() -> DeviceConfig {
        DeviceConfig {
            wl_threshold: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_get_peb_picks_lowest_ec() {
        let mut wl = Wl::new(cfg(), [(0, 10), (1, 2), (2, 7)], [], []);
        assert_eq!(wl.get_peb().unwrap(), 1);
        assert_eq!(wl.get_peb().unwrap(), 2);
        assert_eq!(wl.get_peb().unwrap(), 0);
        assert!(matches!(wl.get_peb(), Err(UbiError::NoSpace)));
    }

    #[test]
    fn test_put_peb_enqueues_erase() {
        let mut wl = Wl::new(cfg(), [(0, 10)], [], []);
        let pnum = wl.get_peb().unwrap();
        wl.put_peb(pnum, false);
        assert!(matches!(
            wl.next_job(),
            Some(WlJob::Erase { pnum: 0, .. })
        ));
    }

    #[test]
    fn test_complete_erase_returns_to_free() {
        let mut wl = Wl::new(cfg(), [(0, 10)], [], []);
        let pnum = wl.get_peb().unwrap();
        wl.put_peb(pnum, false);
        wl.next_job();
        wl.complete_erase(pnum, 11);
        assert_eq!(wl.free_count(), 1);
        assert_eq!(wl.get_peb().unwrap(), 0);
    }

    #[test]
    fn test_wear_skew_schedules_move() {
        let mut wl = Wl::new(cfg(), [(1, 100)], [(0, 1)], []);
        wl.maybe_schedule_wl_move();
        assert!(matches!(
            wl.next_job(),
            Some(WlJob::Move {
                source: 0,
                kind: MoveKind::WearLevel
            })
        ));
    }

    #[test]
    fn test_scrub_peb_schedules_move() {
        let mut wl = Wl::new(cfg(), [], [(5, 3)], []);
        wl.scrub_peb(5);
        assert!(matches!(
            wl.next_job(),
            Some(WlJob::Move {
                source: 5,
                kind: MoveKind::Scrub
            })
        ));
    }

    #[test]
    fn test_ec_range_spans_free_and_used() {
        let wl = Wl::new(cfg(), [(1, 100), (2, 4)], [(0, 1)], []);
        assert_eq!(wl.ec_range(), Some((1, 100)));
    }

    #[test]
    fn test_move_ok_enqueues_source_erase_and_keeps_target_used() {
        let mut wl = Wl::new(cfg(), [(1, 50)], [(0, 1)], []);
        wl.complete_move(0, 1, 1, 50, MoveOutcome::Ok);
        assert!(matches!(
            wl.next_job(),
            Some(WlJob::Erase { pnum: 0, ec: 1, .. })
        ));
    }
}
