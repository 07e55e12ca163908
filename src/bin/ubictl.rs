//! A command-line front-end exercising the UBI core end-to-end, the way `test_flashing.rs`
//! exercises the BMC installer's flashing code: everything here is a thin wrapper around the
//! library, so this binary is a worked example of the public API, not where any logic lives.
//!
//! Two families of subcommand are offered:
//!
//! - Bulk provisioning (`ubi-overview`, `ubi-format`, `ubi-write`) drives `scan`/`provision`/
//!   `ubinize` directly, exactly as the teacher's CLI does, to turn a blank or foreign NAND into
//!   something [`ubi_core::Device::attach`] can mount.
//! - Live-device commands (`create-volume`, `read`, `write`, `unmap`, `atomic-change`, ...)
//!   attach a [`ubi_core::Device`], run one operation, flush the WL work queue, and detach.
//!   Because this binary is one-shot rather than long-lived, there is no background WL thread
//!   here; `Device::flush` drains the queue synchronously before the process exits.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use ubi_core::nand::mtd::MtdNand;
use ubi_core::{
    device::Device,
    layout::DeviceConfig,
    nand::{Nand, NandLayout, SimNand},
    provision::{format, write_volumes},
    scan::scan_blocks,
    ubinize::{BasicVolume, Volume},
    VolType,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(mut sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

/// Device-level tunables not implied by the NAND's own geometry (distilled-spec §3's
/// wear-leveling/bad-block knobs, gathered as CLI flags so scenarios S1-S6 can be reproduced
/// from the command line instead of only from unit tests).
#[derive(Args, Debug, Clone)]
struct DeviceOptions {
    /// Erase-counter spread that triggers a wear-leveling move
    #[clap(long, default_value_t = DeviceConfig::default().wl_threshold)]
    wl_threshold: u64,

    /// Maximum PEBs allowed in the `erroneous` quarantine set
    #[clap(long, default_value_t = DeviceConfig::default().max_erroneous)]
    max_erroneous: usize,

    /// Bad PEBs beyond this count force the device read-only at attach
    #[clap(long, default_value_t = DeviceConfig::default().bad_peb_limit)]
    bad_peb_limit: u32,

    /// Normal level of the bad-PEB reserve
    #[clap(long, default_value_t = DeviceConfig::default().beb_rsvd_level)]
    beb_rsvd_level: u32,
}

impl DeviceOptions {
    fn to_config(&self, layout: NandLayout) -> DeviceConfig {
        DeviceConfig {
            peb_size: layout.bytes_per_page as u32 * layout.pages_per_block,
            min_io_size: layout.bytes_per_page as u32,
            wl_threshold: self.wl_threshold,
            max_erroneous: self.max_erroneous,
            bad_peb_limit: self.bad_peb_limit,
            beb_rsvd_level: self.beb_rsvd_level,
        }
    }
}

#[derive(Args, Debug, Clone)]
#[group(required = true, id = "vol-type")]
struct UbiVolume {
    /// The type of the volume
    #[clap(long, group = "vol-type")]
    r#static: bool,
    #[clap(long, group = "vol-type")]
    dynamic: bool,

    /// The volume ID
    #[clap(long)]
    id: Option<u32>,

    /// The name of the volume
    #[clap(long)]
    name: Option<String>,

    /// The path to the image
    #[clap(long)]
    image: Option<PathBuf>,
}

/// Volume-type selector shared by `create-volume` and `ubi-write`'s underlying volume spec.
#[derive(Args, Debug, Clone)]
#[group(required = true, id = "vol-type")]
struct VolTypeArg {
    #[clap(long, group = "vol-type")]
    r#static: bool,
    #[clap(long, group = "vol-type")]
    dynamic: bool,
}

impl From<VolTypeArg> for VolType {
    fn from(value: VolTypeArg) -> Self {
        match value.dynamic {
            true => VolType::Dynamic,
            false => VolType::Static,
        }
    }
}

impl From<UbiVolume> for BasicVolume<'static> {
    fn from(value: UbiVolume) -> Self {
        let vol_type = match value.dynamic {
            true => VolType::Dynamic,
            false => VolType::Static,
        };

        let mut volume = BasicVolume::new(vol_type);
        if let Some(id) = value.id {
            volume = volume.id(id);
        }
        if let Some(name) = value.name {
            volume = volume.name(name);
        }
        if let Some(image) = value.image {
            let file = File::open(image).expect("could not open image file");
            volume = volume.size(
                file.metadata()
                    .expect("could not get image file metadata")
                    .len(),
            );
            let boxed = Box::new(file);
            let leaked = Box::leak(boxed);
            volume = volume.image(leaked);
        }
        volume
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a summary of the content of each PEB; this is a read-only scan, not an attach
    UbiOverview,

    /// Reformat every non-bad PEB with a fresh EC header; does not write the layout volume
    UbiFormat,

    /// Format, then write a single UBI volume from an image (or a blank volume of the given
    /// size)
    UbiWrite(UbiVolume),

    /// Attach the device and create a volume
    CreateVolume {
        #[clap(flatten)]
        device: DeviceOptions,

        #[clap(long)]
        id: Option<u32>,

        #[clap(long, default_value = "")]
        name: String,

        #[clap(flatten)]
        vol_type: VolTypeArg,

        #[clap(long)]
        reserved_pebs: u32,

        #[clap(long, default_value_t = 1)]
        alignment: u32,
    },

    /// Attach the device and remove a volume
    RemoveVolume {
        #[clap(flatten)]
        device: DeviceOptions,

        vol_id: u32,
    },

    /// Attach the device and read a LEB, writing the result to stdout or a file
    Read {
        #[clap(flatten)]
        device: DeviceOptions,

        vol_id: u32,
        lnum: u32,

        #[clap(long, default_value_t = 0)]
        off: u32,

        len: u32,

        /// Verify the static-volume data CRC against the VID header
        #[clap(long)]
        check: bool,

        /// Fail with an explicit "not mapped" error on an unmapped LEB instead of silently
        /// returning a buffer of 0xFF
        #[clap(long)]
        notify_unmapped: bool,

        /// Where to write the data (defaults to stdout)
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Attach the device and write a dynamic-volume LEB from a file
    Write {
        #[clap(flatten)]
        device: DeviceOptions,

        vol_id: u32,
        lnum: u32,

        #[clap(long, default_value_t = 0)]
        off: u32,

        input: PathBuf,
    },

    /// Attach the device and write a whole static-volume LEB from a file
    WriteStatic {
        #[clap(flatten)]
        device: DeviceOptions,

        vol_id: u32,
        lnum: u32,
        used_ebs: u32,

        input: PathBuf,
    },

    /// Attach the device and unmap a LEB
    Unmap {
        #[clap(flatten)]
        device: DeviceOptions,

        vol_id: u32,
        lnum: u32,
    },

    /// Attach the device and atomically replace a LEB's whole content from a file
    AtomicChange {
        #[clap(flatten)]
        device: DeviceOptions,

        vol_id: u32,
        lnum: u32,

        input: PathBuf,
    },
}

impl Command {
    /// Commands that only read block content and never need to attach a `Device`.
    fn execute_readonly(&self, nand: &mut NandImpl) -> Result<bool> {
        match self {
            Command::UbiOverview => {
                let ebt = match nand {
                    NandImpl::Sim(nand) => scan_blocks(nand)?,

                    #[cfg(target_os = "linux")]
                    NandImpl::Mtd(nand) => scan_blocks(nand)?,
                };

                for (i, content) in ebt.iter().enumerate() {
                    println!("{i:4} => {content:?}");
                }
                Ok(true)
            }

            Command::UbiFormat => {
                let mut ebt = match nand {
                    NandImpl::Sim(nand) => scan_blocks(nand)?,

                    #[cfg(target_os = "linux")]
                    NandImpl::Mtd(nand) => scan_blocks(nand)?,
                };

                match nand {
                    NandImpl::Sim(nand) => format(nand, &mut ebt)?,

                    #[cfg(target_os = "linux")]
                    NandImpl::Mtd(nand) => format(nand, &mut ebt)?,
                }
                Ok(true)
            }

            Command::UbiWrite(volume) => {
                let volume: BasicVolume<'static> = volume.clone().into();
                let volume: Box<dyn Volume> = Box::new(volume);

                let mut ebt = match nand {
                    NandImpl::Sim(nand) => scan_blocks(nand)?,

                    #[cfg(target_os = "linux")]
                    NandImpl::Mtd(nand) => scan_blocks(nand)?,
                };

                match nand {
                    NandImpl::Sim(nand) => {
                        format(nand, &mut ebt)?;
                        write_volumes(nand, &mut ebt, [volume])?;
                    }

                    #[cfg(target_os = "linux")]
                    NandImpl::Mtd(nand) => {
                        format(nand, &mut ebt)?;
                        write_volumes(nand, &mut ebt, [volume])?;
                    }
                }
                Ok(true)
            }

            _ => Ok(false),
        }
    }
}

/// Attach a `Device` over `nand`, run `body`, then flush and detach, handing the NAND backend
/// back to the caller regardless of whether `body` succeeded.
fn with_device<N: Nand>(
    nand: N,
    cfg: DeviceConfig,
    body: impl FnOnce(&mut Device<N>) -> Result<()>,
) -> Result<N> {
    let mut device = Device::attach(nand, cfg)?;
    if device.is_read_only() {
        log::warn!("device attached read-only");
    }

    let result = body(&mut device);
    device.flush()?;
    let nand = device.detach()?;
    result?;
    Ok(nand)
}

fn run_device_command(nand: NandImpl, cmd: Command) -> Result<NandImpl> {
    macro_rules! dispatch {
        ($device:expr, $body:expr) => {
            match nand {
                NandImpl::Sim(n) => {
                    let cfg = $device.to_config(n.get_layout());
                    NandImpl::Sim(with_device(n, cfg, $body)?)
                }

                #[cfg(target_os = "linux")]
                NandImpl::Mtd(n) => {
                    let cfg = $device.to_config(n.get_layout());
                    NandImpl::Mtd(with_device(n, cfg, $body)?)
                }
            }
        };
    }

    match cmd {
        Command::CreateVolume {
            device,
            id,
            name,
            vol_type,
            reserved_pebs,
            alignment,
        } => {
            let vol_type: VolType = vol_type.into();
            Ok(dispatch!(device, |dev: &mut Device<_>| {
                let vol_id = dev.create_volume(id, name.clone(), vol_type, reserved_pebs, alignment)?;
                println!("created volume {vol_id}");
                Ok(())
            }))
        }

        Command::RemoveVolume { device, vol_id } => Ok(dispatch!(device, |dev: &mut Device<_>| {
            dev.remove_volume(vol_id)?;
            Ok(())
        })),

        Command::Read {
            device,
            vol_id,
            lnum,
            off,
            len,
            check,
            notify_unmapped,
            out,
        } => Ok(dispatch!(device, |dev: &mut Device<_>| {
            let mut buf = vec![0u8; len as usize];
            dev.read(vol_id, lnum, off, &mut buf, check, notify_unmapped)?;
            match &out {
                Some(path) => File::create(path)?.write_all(&buf)?,
                None => std::io::stdout().write_all(&buf)?,
            }
            Ok(())
        })),

        Command::Write {
            device,
            vol_id,
            lnum,
            off,
            input,
        } => Ok(dispatch!(device, |dev: &mut Device<_>| {
            let mut buf = Vec::new();
            File::open(&input)?.read_to_end(&mut buf)?;
            dev.write(vol_id, lnum, off, &buf)?;
            Ok(())
        })),

        Command::WriteStatic {
            device,
            vol_id,
            lnum,
            used_ebs,
            input,
        } => Ok(dispatch!(device, |dev: &mut Device<_>| {
            let mut buf = Vec::new();
            File::open(&input)?.read_to_end(&mut buf)?;
            dev.write_leb_st(vol_id, lnum, &buf, used_ebs)?;
            Ok(())
        })),

        Command::Unmap { device, vol_id, lnum } => Ok(dispatch!(device, |dev: &mut Device<_>| {
            dev.unmap(vol_id, lnum)?;
            Ok(())
        })),

        Command::AtomicChange {
            device,
            vol_id,
            lnum,
            input,
        } => Ok(dispatch!(device, |dev: &mut Device<_>| {
            let mut buf = Vec::new();
            File::open(&input)?.read_to_end(&mut buf)?;
            dev.atomic_leb_change(vol_id, lnum, &buf)?;
            Ok(())
        })),

        Command::UbiOverview | Command::UbiFormat | Command::UbiWrite(_) => unreachable!(
            "read-only commands are handled by Command::execute_readonly before this is called"
        ),
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut nand = args.nand.open()?;
    let nand = if args.cmd.execute_readonly(&mut nand)? {
        nand
    } else {
        run_device_command(nand, args.cmd)?
    };
    args.nand.cleanup(nand)?;
    Ok(())
}
