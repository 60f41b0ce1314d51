#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use h2::{
    CrcPolicy, DirEntry, FreemapSummary, HeaderCandidate, MountOptions, Pfs, PfsInfo, PfsStats, Stat,
    Volume, list_pfs, scan_freemap,
};
use h2_chain::{LookupFlags, scan_range};
use h2_ondisk::check::method_name;
use h2_ondisk::compress::comp_name;
use h2_types::HAMMER2_KEY_MAX;
use serde::Serialize;
use std::env::VarError;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "H2_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

#[derive(Parser)]
#[command(name = "h2", about = "Read-only HAMMER2 image inspector")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `H2_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

/// Image and mount tuning shared by every command.
#[derive(Debug, Args)]
struct MountArgs {
    /// Path to the HAMMER2 image or block device.
    image: PathBuf,
    /// PFS to mount.
    #[arg(long, default_value = "ROOT", env = "H2_PFS")]
    pfs: String,
    /// Unreferenced metadata chains kept for reuse.
    #[arg(long)]
    lru_limit: Option<usize>,
    /// Buffer wrappers kept before batch eviction.
    #[arg(long)]
    dio_soft_limit: Option<usize>,
    /// Physical buffers read ahead on a cache miss.
    #[arg(long)]
    readahead: Option<usize>,
    /// Accept a volume header copy whose CRCs fail.
    #[arg(long)]
    lenient_crc: bool,
    /// Cluster members per inode.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=8))]
    cluster_width: Option<u8>,
}

impl MountArgs {
    fn options(&self) -> MountOptions {
        let defaults = MountOptions::default();
        MountOptions {
            pfs: self.pfs.clone(),
            lru_limit: self.lru_limit.unwrap_or(defaults.lru_limit),
            dio_soft_limit: self.dio_soft_limit.unwrap_or(defaults.dio_soft_limit),
            readahead: self.readahead.unwrap_or(defaults.readahead),
            crc_policy: if self.lenient_crc {
                CrcPolicy::Lenient
            } else {
                CrcPolicy::Strict
            },
            cluster_width: self
                .cluster_width
                .map_or(defaults.cluster_width, usize::from),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show the selected volume header, every header candidate and the PFS list.
    Info {
        #[command(flatten)]
        mount: MountArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        #[command(flatten)]
        mount: MountArgs,
        /// Directory path inside the PFS.
        #[arg(default_value = "/")]
        path: String,
        /// Include size, mode and mtime.
        #[arg(long, short = 'l')]
        long: bool,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Write a file's contents to stdout.
    Cat {
        #[command(flatten)]
        mount: MountArgs,
        /// File path inside the PFS.
        path: String,
    },
    /// Show an inode's metadata.
    Stat {
        #[command(flatten)]
        mount: MountArgs,
        /// Path inside the PFS.
        #[arg(default_value = "/")]
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Dump the blockrefs under an inode plus chain cache statistics.
    Chains {
        #[command(flatten)]
        mount: MountArgs,
        /// Path inside the PFS.
        #[arg(default_value = "/")]
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Summarize the freemap leaves.
    Freemap {
        #[command(flatten)]
        mount: MountArgs,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Info { .. } => "info",
            Self::Ls { .. } => "ls",
            Self::Cat { .. } => "cat",
            Self::Stat { .. } => "stat",
            Self::Chains { .. } => "chains",
            Self::Freemap { .. } => "freemap",
        }
    }
}

// ── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HeaderSummary {
    version: u32,
    volu_size: u64,
    total_size: u64,
    allocator_size: u64,
    allocator_free: u64,
    allocator_beg: u64,
    mirror_tid: u64,
    freemap_tid: u64,
    nvolumes: u8,
    fsid: String,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    image: String,
    zone: usize,
    header: HeaderSummary,
    candidates: Vec<HeaderCandidate>,
    pfs: Vec<PfsInfo>,
}

#[derive(Debug, Serialize)]
struct LsEntry {
    #[serde(flatten)]
    entry: DirEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat: Option<Stat>,
}

#[derive(Debug, Serialize)]
struct LsOutput {
    pfs: String,
    path: String,
    entries: Vec<LsEntry>,
}

#[derive(Debug, Serialize)]
struct BrefRow {
    btype: String,
    key: u64,
    keybits: u8,
    data_offset: u64,
    data_bytes: u64,
    comp: &'static str,
    check: &'static str,
}

#[derive(Debug, Serialize)]
struct ChainsOutput {
    pfs: String,
    path: String,
    inum: u64,
    brefs: Vec<BrefRow>,
    error: String,
    stats: PfsStats,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "h2::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();

    let result = match cli.command {
        Command::Info { mount, json } => {
            info_output(&mount).and_then(|out| emit(&out, json, print_info))
        }
        Command::Ls {
            mount,
            path,
            long,
            json,
        } => ls_output(&mount, &path, long)
            .and_then(|out| emit(&out, json, |out| print_ls(out, long))),
        Command::Cat { mount, path } => cat(&mount, &path),
        Command::Stat { mount, path, json } => {
            stat_output(&mount, &path).and_then(|out| emit(&out, json, print_stat))
        }
        Command::Chains { mount, path, json } => {
            chains_output(&mount, &path).and_then(|out| emit(&out, json, print_chains))
        }
        Command::Freemap { mount, json } => {
            freemap_output(&mount).and_then(|out| emit(&out, json, print_freemap))
        }
    };

    let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    info!(
        target: "h2::cli",
        command = command_name,
        ok = result.is_ok(),
        elapsed_us,
        "command_done"
    );
    result
}

fn emit<T: Serialize>(out: &T, json: bool, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(out).context("serialize output")?
        );
    } else {
        human(out);
    }
    Ok(())
}

fn open_volume(mount: &MountArgs) -> Result<Arc<Volume>> {
    let options = mount.options();
    let volume = Volume::open_path(&mount.image, &options)
        .with_context(|| format!("failed to open HAMMER2 image {}", mount.image.display()))?;
    Ok(Arc::new(volume))
}

fn mount_pfs(mount: &MountArgs) -> Result<Pfs> {
    let volume = open_volume(mount)?;
    Pfs::mount(volume, &mount.pfs).with_context(|| format!("failed to mount PFS {}", mount.pfs))
}

fn display_path(image: &Path) -> String {
    image.display().to_string()
}

// ── Commands ────────────────────────────────────────────────────────────────

fn info_output(mount: &MountArgs) -> Result<InfoOutput> {
    let volume = open_volume(mount)?;
    let h = volume.header();
    let header = HeaderSummary {
        version: h.version,
        volu_size: h.volu_size,
        total_size: h.total_size,
        allocator_size: h.allocator_size,
        allocator_free: h.allocator_free,
        allocator_beg: h.allocator_beg,
        mirror_tid: h.mirror_tid,
        freemap_tid: h.freemap_tid,
        nvolumes: h.nvolumes,
        fsid: h.fsid.iter().map(|b| format!("{b:02x}")).collect(),
    };
    let pfs = list_pfs(&volume).context("failed to scan the super-root")?;
    Ok(InfoOutput {
        image: display_path(&mount.image),
        zone: volume.zone(),
        header,
        candidates: volume.candidates().to_vec(),
        pfs,
    })
}

fn print_info(out: &InfoOutput) {
    println!("HAMMER2 volume {}", out.image);
    println!("header zone: {}", out.zone);
    println!("version: {}", out.header.version);
    println!("volu_size: {}", out.header.volu_size);
    println!(
        "allocator: {} free of {}",
        out.header.allocator_free, out.header.allocator_size
    );
    println!("mirror_tid: {:#x}", out.header.mirror_tid);
    println!("freemap_tid: {:#x}", out.header.freemap_tid);
    println!("fsid: {}", out.header.fsid);
    for cand in &out.candidates {
        let status = match (&cand.error, cand.crc_ok) {
            (Some(err), _) => err.clone(),
            (None, true) => "ok".to_owned(),
            (None, false) => "crc mismatch".to_owned(),
        };
        println!(
            "  zone {} @ {:#x}: tid={} {status}",
            cand.zone,
            cand.offset,
            cand.mirror_tid.map_or_else(|| "-".to_owned(), |tid| format!("{tid:#x}"))
        );
    }
    println!("pfs:");
    for pfs in &out.pfs {
        println!(
            "  {:<16} key={:016x} type={} next_inum={}",
            pfs.name, pfs.key, pfs.pfs_type, pfs.next_inum
        );
    }
}

fn ls_output(mount: &MountArgs, path: &str, long: bool) -> Result<LsOutput> {
    let pfs = mount_pfs(mount)?;
    let dir = pfs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    let entries = pfs
        .readdir(&dir)
        .with_context(|| format!("failed to read directory {path}"))?;
    let entries = entries
        .into_iter()
        .map(|entry| {
            let stat = if long {
                let ip = pfs
                    .nresolve(&dir, entry.name.as_bytes())
                    .with_context(|| format!("failed to resolve {}", entry.name))?;
                Some(pfs.stat(&ip))
            } else {
                None
            };
            Ok(LsEntry { entry, stat })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(LsOutput {
        pfs: mount.pfs.clone(),
        path: path.to_owned(),
        entries,
    })
}

fn print_ls(out: &LsOutput, long: bool) {
    for item in &out.entries {
        let e = &item.entry;
        match (&item.stat, long) {
            (Some(st), true) => println!(
                "{}{:04o} {:>8} {:>12} {:>16x} {}",
                e.kind.tag(),
                st.mode & 0o7777,
                e.inum,
                st.size,
                st.mtime,
                e.name
            ),
            _ => println!("{} {:>8} {}", e.kind.tag(), e.inum, e.name),
        }
    }
}

fn cat(mount: &MountArgs, path: &str) -> Result<()> {
    let pfs = mount_pfs(mount)?;
    let ip = pfs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    copy_file(&pfs, &ip, &mut out).with_context(|| format!("failed to read {path}"))?;
    out.flush().context("flush stdout")
}

fn copy_file(pfs: &Pfs, ip: &h2::InodeRef, out: &mut impl Write) -> Result<u64> {
    let mut buf = vec![0_u8; 1 << 16];
    let mut offset = 0_u64;
    loop {
        let got = pfs.read(ip, offset, &mut buf)?;
        if got == 0 {
            return Ok(offset);
        }
        out.write_all(&buf[..got])?;
        offset += got as u64;
    }
}

fn stat_output(mount: &MountArgs, path: &str) -> Result<Stat> {
    let pfs = mount_pfs(mount)?;
    let ip = pfs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    Ok(pfs.stat(&ip))
}

fn print_stat(st: &Stat) {
    println!("inum: {}", st.inum);
    println!("type: {:?}", st.kind);
    println!("mode: {:04o}", st.mode & 0o7777);
    println!("nlinks: {}", st.nlinks);
    println!("size: {}", st.size);
    println!("iparent: {}", st.iparent);
    println!("ctime: {:#x}", st.ctime);
    println!("mtime: {:#x}", st.mtime);
    println!("comp: {}", st.comp);
    println!("check: {}", st.check);
    if st.direct_data {
        println!("data: direct");
    }
    if st.pfs_root {
        println!("pfs root: yes");
    }
}

fn chains_output(mount: &MountArgs, path: &str) -> Result<ChainsOutput> {
    let pfs = mount_pfs(mount)?;
    let ip = pfs
        .resolve_path(path)
        .with_context(|| format!("failed to resolve {path}"))?;
    let Some(id) = ip.cluster().focus_chain() else {
        bail!("inode {} has no backing chain", ip.inum());
    };
    let flags = LookupFlags::SHARED | LookupFlags::NODATA | LookupFlags::NODIRECT;
    let (brefs, error) = scan_range(pfs.store(), id, 0, HAMMER2_KEY_MAX, flags);
    let brefs = brefs
        .iter()
        .map(|bref| BrefRow {
            btype: bref.btype.to_string(),
            key: bref.key,
            keybits: bref.keybits,
            data_offset: bref.data_offset().0,
            data_bytes: if bref.has_media() { bref.data_bytes() } else { 0 },
            comp: comp_name(bref.comp_method()),
            check: method_name(bref.check_method()),
        })
        .collect();
    Ok(ChainsOutput {
        pfs: mount.pfs.clone(),
        path: path.to_owned(),
        inum: ip.inum(),
        brefs,
        error: error.to_string(),
        stats: pfs.stats(),
    })
}

fn print_chains(out: &ChainsOutput) {
    println!("{}:{} (inode {})", out.pfs, out.path, out.inum);
    for row in &out.brefs {
        println!(
            "  {:<10} key={:016x}/{:<2} off={:#014x} bytes={:<6} comp={:<8} check={}",
            row.btype, row.key, row.keybits, row.data_offset, row.data_bytes, row.comp, row.check
        );
    }
    println!("scan: {}", out.error);
    let c = &out.stats.chains;
    println!(
        "chains: live={} lru={} allocated={} freed={} loads={} check_failures={}",
        c.live, c.lru, c.allocated, c.freed, c.loads, c.check_failures
    );
    let d = &out.stats.dio;
    println!(
        "dio: wrappers={} hits={} misses={} evicted={}",
        d.wrappers, d.hits, d.misses, d.evicted
    );
    let x = &out.stats.xops;
    println!("xops: allocs={} reuses={}", x.allocs, x.reuses);
}

fn freemap_output(mount: &MountArgs) -> Result<FreemapSummary> {
    let volume = open_volume(mount)?;
    scan_freemap(&volume).context("failed to scan the freemap")
}

fn print_freemap(out: &FreemapSummary) {
    for leaf in &out.leaves {
        println!(
            "leaf {:#014x}/{}: avail={} allocated={} {}",
            leaf.key, leaf.keybits, leaf.avail, leaf.allocated_bytes, leaf.error
        );
    }
    println!("avail: {}", out.avail);
    println!("allocated: {}", out.allocated_bytes);
    println!("header free: {}", out.header_free);
    if !out.consistent() {
        println!("WARNING: freemap and volume header disagree");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2_harness::{BuildOptions, ImageBuilder};
    use tempfile::TempDir;

    fn image() -> (TempDir, PathBuf) {
        let mut b = ImageBuilder::with_options(BuildOptions {
            header_tids: vec![2, 5],
            ..BuildOptions::default()
        });
        let root = b.root();
        let etc = b.mkdir(root, "etc");
        b.file(etc, "motd", b"welcome\n".to_vec());
        b.file(root, "blob", vec![0x5A_u8; 100_000]);
        let extra = b.add_pfs("LOCAL");
        b.file(extra, "note", b"local".to_vec());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("h2.img");
        b.build().write_to_file(&path).expect("write image");
        (dir, path)
    }

    fn mount_args(argv: &[&str]) -> MountArgs {
        let cli = Cli::try_parse_from(argv).expect("parse");
        match cli.command {
            Command::Info { mount, .. }
            | Command::Ls { mount, .. }
            | Command::Cat { mount, .. }
            | Command::Stat { mount, .. }
            | Command::Chains { mount, .. }
            | Command::Freemap { mount, .. } => mount,
        }
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!(LogFormat::parse("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse(" human ").unwrap(), LogFormat::Human);
        assert!(LogFormat::parse("xml").is_err());
    }

    #[test]
    fn flags_map_onto_mount_options() {
        let m = mount_args(&[
            "h2",
            "ls",
            "img",
            "--pfs",
            "LOCAL",
            "--lru-limit",
            "16",
            "--readahead",
            "2",
            "--lenient-crc",
            "--cluster-width",
            "3",
        ]);
        let opts = m.options();
        assert_eq!(opts.pfs, "LOCAL");
        assert_eq!(opts.lru_limit, 16);
        assert_eq!(opts.readahead, 2);
        assert_eq!(opts.dio_soft_limit, MountOptions::default().dio_soft_limit);
        assert_eq!(opts.crc_policy, CrcPolicy::Lenient);
        assert_eq!(opts.cluster_width, 3);

        assert!(Cli::try_parse_from(["h2", "info", "img", "--cluster-width", "9"]).is_err());
    }

    #[test]
    fn info_reports_newest_header_and_every_pfs() {
        let (_dir, path) = image();
        let m = mount_args(&["h2", "info", path.to_str().unwrap()]);
        let out = info_output(&m).unwrap();
        assert_eq!(out.zone, 1);
        assert_eq!(out.header.mirror_tid, 5);
        assert_eq!(out.candidates.len(), 2);
        let names: Vec<&str> = out.pfs.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"ROOT") && names.contains(&"LOCAL"));
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["header"]["mirror_tid"], 5);
    }

    #[test]
    fn ls_long_stats_every_entry() {
        let (_dir, path) = image();
        let m = mount_args(&["h2", "ls", path.to_str().unwrap(), "/", "-l"]);
        let out = ls_output(&m, "/", true).unwrap();
        let names: Vec<&str> = out.entries.iter().map(|e| e.entry.name.as_str()).collect();
        assert_eq!(&names[..2], &[".", ".."]);
        assert!(names.contains(&"etc") && names.contains(&"blob"));
        let blob = out.entries.iter().find(|e| e.entry.name == "blob").unwrap();
        assert_eq!(blob.stat.as_ref().unwrap().size, 100_000);
    }

    #[test]
    fn cat_copies_whole_files() {
        let (_dir, path) = image();
        let m = mount_args(&["h2", "cat", path.to_str().unwrap(), "blob"]);
        let pfs = mount_pfs(&m).unwrap();
        let ip = pfs.resolve_path("blob").unwrap();
        let mut sink = Vec::new();
        assert_eq!(copy_file(&pfs, &ip, &mut sink).unwrap(), 100_000);
        assert_eq!(sink, vec![0x5A_u8; 100_000]);
    }

    #[test]
    fn other_pfs_is_selected_by_flag() {
        let (_dir, path) = image();
        let m = mount_args(&["h2", "stat", path.to_str().unwrap(), "note", "--pfs", "LOCAL"]);
        let st = stat_output(&m, "note").unwrap();
        assert_eq!(st.size, 5);
        assert_eq!(st.kind, h2::ObjType::Regular);
    }

    #[test]
    fn chains_lists_inode_children() {
        let (_dir, path) = image();
        let m = mount_args(&["h2", "chains", path.to_str().unwrap(), "blob"]);
        let out = chains_output(&m, "blob").unwrap();
        assert_eq!(out.error, "ok");
        assert_eq!(out.brefs.len(), 2);
        assert!(out.brefs.iter().all(|b| b.btype == "data"));
        assert_eq!(out.brefs[1].key, 0x1_0000);
    }

    #[test]
    fn freemap_summary_is_consistent() {
        let (_dir, path) = image();
        let m = mount_args(&["h2", "freemap", path.to_str().unwrap()]);
        let out = freemap_output(&m).unwrap();
        assert!(out.consistent());
        assert!(out.avail > 0);
    }
}
