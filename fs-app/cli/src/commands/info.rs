//! Info command: print volume metadata without checking anything

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::path::PathBuf;

use ufsck::blockdev::FileBackedBlockDevice;
use ufsck::cache::CacheOptions;
use ufsck::format::superblock::{FS_DOSOFTDEP, FS_METACKHASH, FS_NEEDSFSCK, FS_SUJ, FS_UNCLEAN};
use ufsck::format::CgSummary;
use ufsck::volume::Volume;

/// Print the superblock and cylinder group summaries
#[derive(Parser, Debug)]
#[command(about = "Print superblock, geometry and group summaries")]
pub struct InfoArgs {
    /// Device or image file to inspect
    pub device: PathBuf,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

struct GroupInfo {
    index: u32,
    magic_ok: bool,
    summary: CgSummary,
}

fn flag_names(flags: u32) -> Vec<&'static str> {
    [
        (FS_UNCLEAN, "unclean"),
        (FS_DOSOFTDEP, "soft-updates"),
        (FS_NEEDSFSCK, "needs-fsck"),
        (FS_SUJ, "journal"),
        (FS_METACKHASH, "check-hashes"),
    ]
    .iter()
    .filter(|(bit, _)| flags & bit != 0)
    .map(|(_, name)| *name)
    .collect()
}

pub fn run(args: InfoArgs) -> Result<()> {
    let device = FileBackedBlockDevice::open(&args.device, true)
        .with_context(|| format!("Failed to open device: {}", args.device.display()))?;
    let options = CacheOptions {
        read_only: true,
        ..CacheOptions::default()
    };
    let mut vol = Volume::open(Box::new(device), options)
        .map_err(|e| anyhow!("{}: no usable superblock: {}", args.device.display(), e))?;

    let mut groups = Vec::with_capacity(vol.geo.ncg as usize);
    for c in 0..vol.geo.ncg {
        let h = vol.cg_get(c)?;
        let cg = vol.cg_view(&h);
        groups.push(GroupInfo {
            index: c,
            magic_ok: cg.is_magic_valid() && cg.cgx() == c,
            summary: cg.summary(),
        });
        vol.cache.release(h);
    }

    let sb = &vol.sb;
    let geo = &vol.geo;
    let volname = String::from_utf8_lossy(&sb.volname)
        .trim_end_matches('\0')
        .to_string();
    let mtime = Utc
        .timestamp_opt(sb.mtime, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| sb.mtime.to_string());

    if args.json {
        let value = json!({
            "device": args.device.display().to_string(),
            "volname": volname,
            "format": format!("{:?}", geo.format),
            "bsize": geo.bsize,
            "fsize": geo.fsize,
            "frag": geo.frag,
            "size": geo.size,
            "ncg": geo.ncg,
            "ipg": geo.ipg,
            "fpg": geo.fpg,
            "clean": sb.clean != 0,
            "flags": flag_names(sb.flags),
            "metackhash": sb.metackhash,
            "sujinode": sb.sujinode,
            "mtime": mtime,
            "cstotal": {
                "ndir": sb.cstotal.ndir,
                "nbfree": sb.cstotal.nbfree,
                "nifree": sb.cstotal.nifree,
                "nffree": sb.cstotal.nffree,
            },
            "groups": groups.iter().map(|g| json!({
                "cg": g.index,
                "magic_ok": g.magic_ok,
                "summary": g.summary,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Volume:        {}", args.device.display());
    println!("Name:          {}", volname);
    println!("Format:        {:?}", geo.format);
    println!("Block size:    {} (fragment {}, {} per block)", geo.bsize, geo.fsize, geo.frag);
    println!("Size:          {} fragments", geo.size);
    println!("Groups:        {} x {} fragments, {} inodes each", geo.ncg, geo.fpg, geo.ipg);
    println!(
        "Layout:        sblkno {} cblkno {} iblkno {} dblkno {}",
        geo.sblkno, geo.cblkno, geo.iblkno, geo.dblkno
    );
    println!("Clean:         {}", if sb.clean != 0 { "yes" } else { "no" });
    println!("Flags:         {}", flag_names(sb.flags).join(", "));
    println!("Check-hashes:  {:#x}", sb.metackhash);
    if sb.sujinode != 0 {
        println!("Journal inode: {}", sb.sujinode);
    }
    println!("Last mounted:  {}", mtime);
    println!(
        "Totals:        {} dirs, {} free blocks, {} free frags, {} free inodes",
        sb.cstotal.ndir, sb.cstotal.nbfree, sb.cstotal.nffree, sb.cstotal.nifree
    );
    println!();
    println!("{:>5} {:>6} {:>8} {:>8} {:>8}  ", "cg", "ndir", "nbfree", "nffree", "nifree");
    for g in &groups {
        println!(
            "{:>5} {:>6} {:>8} {:>8} {:>8}{}",
            g.index,
            g.summary.ndir,
            g.summary.nbfree,
            g.summary.nffree,
            g.summary.nifree,
            if g.magic_ok { "" } else { "  BAD MAGIC" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_names() {
        assert!(flag_names(0).is_empty());
        assert_eq!(flag_names(FS_SUJ | FS_UNCLEAN), vec!["unclean", "journal"]);
    }
}
