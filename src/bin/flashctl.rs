//! Maintenance and exercise tool for cinderfs devices.
//!
//! Works against either a real MTD device (Linux) or a file-backed simulated
//! flash, so filesystem behavior can be poked at interactively without
//! hardware.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use cinderfs::flash::mtd::MtdFlash;
use cinderfs::summary::{read_summary, EbhNode, EBH_NODE_SIZE};
use cinderfs::{
    Error, Filesystem, FlashDevice, FlashLayout, MountOptions, NodeInfo, NodeLoc, SimFlash,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct DeviceOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "device-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "device-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the flash image file to use
    #[clap(long, group = "device-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the flash to simulate, as BLOCKSxBYTES
    #[clap(long)]
    sim_layout: Option<FlashLayout>,

    /// Write back the flash image file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl DeviceOptions {
    fn open(&self) -> Result<FlashImpl> {
        let device = if let Some(layout) = self.sim_layout {
            let mut sim = SimFlash::new(layout);
            if let Some(path) = &self.sim_path {
                if path.exists() {
                    sim.load(&mut File::open(path)?)?;
                }
            }

            FlashImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdFlash::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdFlash::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                FlashImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(device)
    }

    fn cleanup(&self, device: FlashImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let FlashImpl::Sim(sim) = device {
                    sim.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

enum FlashImpl {
    Sim(SimFlash),

    #[cfg(target_os = "linux")]
    Mtd(MtdFlash),
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Erase every block and stamp fresh erase-block headers, preserving
    /// erase counts where they can still be read
    Format {
        /// Bytes to reserve for each block's header; 0 writes none
        #[clap(long, default_value_t = EBH_NODE_SIZE)]
        ebh_size: u32,
    },

    /// Mount read-only and print space and wear statistics
    Stats,

    /// Print a one-line classification of every erase block; read-only
    Overview,

    /// Random write/delete workload to exercise GC and wear leveling
    Churn {
        /// Number of write attempts
        #[clap(long, default_value_t = 10_000)]
        rounds: u32,

        /// RNG seed, for reproducible runs
        #[clap(long, default_value_t = 0)]
        seed: u64,

        /// Largest node payload to write
        #[clap(long, default_value_t = 1024)]
        max_node: u32,
    },
}

impl Command {
    fn execute(self, device: FlashImpl) -> Result<FlashImpl> {
        Ok(match device {
            FlashImpl::Sim(flash) => FlashImpl::Sim(self.run(flash)?),

            #[cfg(target_os = "linux")]
            FlashImpl::Mtd(flash) => FlashImpl::Mtd(self.run(flash)?),
        })
    }

    fn run<F: FlashDevice + Send + 'static>(self, mut flash: F) -> Result<F> {
        match self {
            Command::Format { ebh_size } => {
                format(&mut flash, ebh_size)?;
                Ok(flash)
            }
            Command::Stats => stats(flash),
            Command::Overview => {
                overview(&mut flash)?;
                Ok(flash)
            }
            Command::Churn {
                rounds,
                seed,
                max_node,
            } => churn(flash, rounds, seed, max_node),
        }
    }
}

fn format<F: FlashDevice>(flash: &mut F, ebh_size: u32) -> Result<()> {
    let layout = flash.layout();
    let rpt = howudoin::new()
        .label("Formatting")
        .set_len(u64::from(layout.blocks));

    for index in 0..layout.blocks {
        rpt.inc();
        let offset = layout.block_offset(index);
        if flash.is_bad(offset)? {
            continue;
        }

        // Keep wear history across reformats when a header is still legible
        let mut buf = [0u8; EBH_NODE_SIZE as usize];
        flash.read(offset, &mut buf)?;
        let erase_count = EbhNode::decode(&buf).map_or(0, |n| n.erase_count);

        if let Err(e) = flash.erase(offset) {
            eprintln!("block {index}: erase failed ({e}), marking bad");
            flash.mark_bad(offset)?;
            continue;
        }

        if ebh_size > 0 {
            let span = ebh_size.max(EBH_NODE_SIZE);
            let mut bytes = vec![0xFFu8; span as usize];
            EbhNode::new(erase_count + 1).encode(&mut bytes)?;
            flash.write(offset, &bytes)?;
        }
    }

    rpt.close();
    Ok(())
}

fn overview<F: FlashDevice>(flash: &mut F) -> Result<()> {
    let layout = flash.layout();
    let mut buf = vec![0u8; layout.block_size as usize];

    for index in 0..layout.blocks {
        let offset = layout.block_offset(index);
        if flash.is_bad(offset)? {
            println!("{index:4} => bad");
            continue;
        }
        if let Some(parsed) = read_summary(flash, offset, layout.block_size)? {
            println!("{index:4} => summarized, {} entries", parsed.entries.len());
            continue;
        }

        flash.read(offset, &mut buf)?;
        let watermark = buf.iter().rposition(|&b| b != 0xFF).map_or(0, |p| p + 1);
        let header = EbhNode::decode(&buf[..EBH_NODE_SIZE as usize]);
        match (header, watermark) {
            (None, 0) => println!("{index:4} => erased"),
            (Some(h), w) if w <= EBH_NODE_SIZE as usize => {
                println!("{index:4} => erased, erase count {}", h.erase_count)
            }
            (Some(h), w) => println!(
                "{index:4} => {w} bytes of unsummarized data, erase count {}",
                h.erase_count
            ),
            (None, w) => println!("{index:4} => {w} bytes of unrecognized data"),
        }
    }

    Ok(())
}

fn stats<F: FlashDevice + Send + 'static>(flash: F) -> Result<F> {
    let opts = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    let fs = Filesystem::mount(flash, opts)?;
    let stats = fs.stats();

    println!("free:      {:>12} bytes ({} blocks)", stats.space.free, stats.nr_free_blocks);
    println!("used:      {:>12} bytes", stats.space.used);
    println!("dirty:     {:>12} bytes", stats.space.dirty);
    println!("wasted:    {:>12} bytes", stats.space.wasted);
    println!("unchecked: {:>12} bytes", stats.space.unchecked);
    println!("erasing:   {:>12} blocks", stats.nr_erasing_blocks);
    println!("bad:       {:>12} blocks", stats.nr_bad_blocks);
    println!(
        "wear:      {:>12} total erases, max {} on one block",
        stats.total_erase_count, stats.max_erase_count
    );

    Ok(fs.unmount()?)
}

fn churn<F: FlashDevice + Send + 'static>(
    flash: F,
    rounds: u32,
    seed: u64,
    max_node: u32,
) -> Result<F> {
    let fs = Filesystem::mount(flash, MountOptions::default())?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<NodeLoc> = Vec::new();
    let mut written = 0u64;
    let mut out_of_space = 0u32;

    let rpt = howudoin::new().label("Churning").set_len(u64::from(rounds));
    for round in 0..rounds {
        rpt.inc();
        let len = rng.gen_range(16..=max_node) as usize;
        match fs.write_node(NodeInfo::Inode { ino: round + 1, version: 1 }, &vec![0xC5; len]) {
            Ok(loc) => {
                written += u64::from(loc.len);
                live.push(loc);
            }
            Err(Error::OutOfSpace) => out_of_space += 1,
            Err(e) => return Err(e.into()),
        }

        if !live.is_empty() && rng.gen_bool(0.5) {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            fs.mark_obsolete(victim)?;
        }
    }
    rpt.close();

    let stats = fs.stats();
    println!("wrote {written} bytes, {out_of_space} writes hit ENOSPC");
    println!(
        "wear: {} total erases, max {} on one block",
        stats.total_erase_count, stats.max_erase_count
    );

    Ok(fs.unmount()?)
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash device to use
    #[clap(flatten)]
    device: DeviceOptions,

    /// The command to run against this device
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let device = args.device.open()?;
    let device = args.cmd.execute(device)?;
    args.device.cleanup(device)?;
    Ok(())
}
