use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hcg_codecs::default_codec;
use hcg_core::{
    ArchiveReader, ArchiveWriter, ImageSource, ImageState, IndexChoice, IndexCopy, Pack, PackConfig,
    ReadOptions, Sizing,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "hcg",
    about = "HCG001 image archives: pack near-duplicate images as deltas, list, verify, extract",
    version
)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack image files (or directory trees) into an archive
    Pack {
        /// Destination archive
        output: PathBuf,
        /// Image files or directories; directory contents are keyed by
        /// their path relative to the directory
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Archive comment (defaults to the package comment)
        #[arg(long)]
        comment: Option<String>,
        /// Keep a delta only if it is smaller than this fraction of the
        /// original payload
        #[arg(short, long, default_value_t = hcg_core::DEFAULT_THRESHOLD)]
        threshold: f64,
        /// Sampling worker threads (default: available parallelism)
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        /// Spawn extra sampling workers instead of waiting for a free one
        #[arg(long)]
        growable: bool,
        /// Store every image as is
        #[arg(long)]
        no_deltas: bool,
    },
    /// Print the archive comment and its images
    List {
        archive: PathBuf,
        /// Print per-entry details
        #[arg(long)]
        entries: bool,
        #[arg(long, value_enum, default_value_t = IndexArg::Auto)]
        index: IndexArg,
    },
    /// Extract images into a directory
    Extract {
        archive: PathBuf,
        /// Destination directory
        dest: PathBuf,
        /// Only extract these keys
        #[arg(short, long)]
        key: Vec<String>,
        #[arg(long, value_enum, default_value_t = IndexArg::Auto)]
        index: IndexArg,
    },
    /// Check both index copies and every payload checksum
    Verify { archive: PathBuf },
    /// Rewrite an archive, for example one readable only through its tail
    /// index, with both index copies healthy
    Repack {
        input: PathBuf,
        output: PathBuf,
        /// New comment (defaults to the input's comment)
        #[arg(long)]
        comment: Option<String>,
        #[arg(long, value_enum, default_value_t = IndexArg::Auto)]
        index: IndexArg,
    },
}

/// Which index copy to enumerate images from.
#[derive(Clone, Copy, ValueEnum)]
enum IndexArg {
    /// Head copy, falling back to the tail copy
    Auto,
    Head,
    Tail,
}

impl From<IndexArg> for ReadOptions {
    fn from(arg: IndexArg) -> Self {
        let index = match arg {
            IndexArg::Auto => IndexChoice::Auto,
            IndexArg::Head => IndexChoice::Head,
            IndexArg::Tail => IndexChoice::Tail,
        };
        ReadOptions { index }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn open_archive(path: &Path, index: IndexArg) -> anyhow::Result<ArchiveReader> {
    ArchiveReader::open_with(path, default_codec(), index.into())
        .with_context(|| format!("opening archive {:?}", path))
}

/// Archive key for `path` relative to `root`, with `/` separators.
fn key_for(path: &Path, root: &Path) -> anyhow::Result<String> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        anyhow::bail!("cannot derive a key for {:?}", path);
    }
    Ok(parts.join("/"))
}

/// All files under `dir`, depth first, in directory-name order.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {:?}", dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    children.sort();
    for child in children {
        if child.is_dir() {
            collect_files(&child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_pack(output: PathBuf, inputs: Vec<PathBuf>, config: PackConfig) -> anyhow::Result<()> {
    let t0 = Instant::now();
    let mut pack = Pack::new(default_codec());
    let mut raw_size = 0u64;

    for input in &inputs {
        let (root, files) = if input.is_dir() {
            let mut files = Vec::new();
            collect_files(input, &mut files)?;
            (input.clone(), files)
        } else {
            let root = input.parent().map(Path::to_path_buf).unwrap_or_default();
            (root, vec![input.clone()])
        };
        for file in files {
            let key = key_for(&file, &root)?;
            debug!(key = %key, path = %file.display(), "adding image");
            pack.add_file(key.as_str(), &file)
                .with_context(|| format!("adding {:?}", file))?;
            raw_size += pack.get(&key).map_or(0, |i| u64::from(i.size()));
        }
    }

    let plan = if config.deltas && pack.len() > 1 {
        let pool = config.build_pool();
        let plan = pack.plan_deltas(&pool, config.threshold)?;
        info!(
            groups = plan.groups,
            attempts = plan.attempts,
            committed = plan.committed,
            "delta planning done"
        );
        Some(plan)
    } else {
        None
    };

    let summary = ArchiveWriter::create(&output)
        .with_context(|| format!("creating output file {:?}", output))?
        .with_comment(config.comment)
        .write(&pack)?;
    let elapsed = t0.elapsed();

    eprintln!("  images      : {}", summary.images);
    eprintln!("  deltas      : {}", summary.deltas);
    if let Some(plan) = plan {
        eprintln!(
            "  groups      : {} ({} attempts, {} skipped)",
            plan.groups, plan.attempts, plan.skipped
        );
    }
    eprintln!("  source size : {}", human_bytes(raw_size));
    eprintln!("  data heap   : {}", human_bytes(summary.data_bytes));
    eprintln!("  archive     : {}", human_bytes(summary.total_bytes));
    if summary.total_bytes > 0 {
        eprintln!("  ratio       : {:.2}x", raw_size as f64 / summary.total_bytes as f64);
    }
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_list(archive: PathBuf, show_entries: bool, index: IndexArg) -> anyhow::Result<()> {
    let reader = open_archive(&archive, index)?;
    let file_size = std::fs::metadata(&archive)?.len();
    let deltas = reader.images().iter().filter(|i| i.is_delta()).count();

    println!("=== HCG001 archive: {:?} ===", archive);
    println!();
    println!("  index copy     : {}", reader.loaded_from());
    println!("  images         : {}", reader.len());
    println!("  delta-encoded  : {}", deltas);
    println!("  file on disk   : {}", human_bytes(file_size));
    println!("  comment        :");
    for line in String::from_utf8_lossy(reader.comment()).lines() {
        println!("    {}", line);
    }
    println!();

    if show_entries {
        let copy = reader.loaded_from();
        println!(
            "  {:>12}  {:>12}  {:>12}  {:>10}  key",
            "record", "data offset", "ref", "checksum"
        );
        println!("  {}", "-".repeat(60));
        for (record, entry) in reader.index_entries(copy)? {
            println!(
                "  {:>12}  {:>12}  {:>12}  {:08x}  {}",
                record, entry.data_offset, entry.ref_pointer, entry.checksum, entry.key
            );
        }
    } else {
        for image in reader.images() {
            match image.state() {
                ImageState::SelfContained => {
                    println!("  {:>12}  {}", human_bytes(u64::from(image.size())), image.key())
                }
                ImageState::DeltaEncoded { reference } => println!(
                    "  {:>12}  {}  (delta of {})",
                    human_bytes(u64::from(image.size())),
                    image.key(),
                    reader.image(reference)?.key()
                ),
            }
        }
    }
    Ok(())
}

fn run_extract(
    archive: PathBuf,
    dest: PathBuf,
    keys: Vec<String>,
    index: IndexArg,
) -> anyhow::Result<()> {
    let reader = open_archive(&archive, index)?;
    let selected: Vec<&hcg_core::Image> = if keys.is_empty() {
        reader.images().iter().collect()
    } else {
        keys.iter()
            .map(|k| reader.get(k).with_context(|| format!("no image with key {:?}", k)))
            .collect::<anyhow::Result<_>>()?
    };

    let t0 = Instant::now();
    let mut failed = 0;
    for image in &selected {
        if let Err(e) = image.extract_to(&reader, &dest) {
            warn!(key = image.key(), error = %e, "extraction failed");
            eprintln!("  failed      : {:?}: {:#}", image.key(), e);
            failed += 1;
        } else {
            debug!(key = image.key(), "extracted");
        }
    }
    eprintln!("  extracted   : {}", selected.len() - failed);
    eprintln!("  elapsed     : {:.3}s", t0.elapsed().as_secs_f64());
    if failed > 0 {
        anyhow::bail!("{} of {} images could not be extracted", failed, selected.len());
    }
    Ok(())
}

fn run_verify(archive: PathBuf) -> anyhow::Result<()> {
    let reader = open_archive(&archive, IndexArg::Auto)?;
    let mut failures = 0;

    for (copy, result) in [
        (IndexCopy::Head, reader.validate_head_index()),
        (IndexCopy::Tail, reader.validate_tail_index()),
    ] {
        match result {
            Ok(()) => println!("  {} index  : ok", copy),
            Err(e) => {
                println!("  {} index  : FAILED ({})", copy, e);
                failures += 1;
            }
        }
    }

    let mut bad_payloads = 0;
    for image in reader.images() {
        if let Err(e) = image.verify(&reader) {
            println!("  payload     : FAILED {}", e);
            bad_payloads += 1;
        }
    }
    println!(
        "  payloads    : {} of {} ok",
        reader.len() - bad_payloads,
        reader.len()
    );

    failures += bad_payloads;
    if failures > 0 {
        anyhow::bail!("{} integrity check(s) failed in {:?}", failures, archive);
    }
    Ok(())
}

fn run_repack(
    input: PathBuf,
    output: PathBuf,
    comment: Option<String>,
    index: IndexArg,
) -> anyhow::Result<()> {
    let reader = open_archive(&input, index)?;
    let comment = comment.map_or_else(|| reader.comment().to_vec(), String::into_bytes);
    let summary = ArchiveWriter::create(&output)
        .with_context(|| format!("creating output file {:?}", output))?
        .with_comment(comment)
        .write(&reader)?;

    eprintln!("  read from   : {} index", reader.loaded_from());
    eprintln!("  images      : {}", summary.images);
    eprintln!("  deltas      : {}", summary.deltas);
    eprintln!("  archive     : {}", human_bytes(summary.total_bytes));
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Pack {
            output,
            inputs,
            comment,
            threshold,
            threads,
            growable,
            no_deltas,
        } => {
            let mut config = PackConfig {
                threshold,
                threads,
                sizing: if growable { Sizing::Growable } else { Sizing::Fixed },
                deltas: !no_deltas,
                ..PackConfig::default()
            };
            if let Some(comment) = comment {
                config.comment = comment.into_bytes();
            }
            run_pack(output, inputs, config)
        }
        Commands::List { archive, entries, index } => run_list(archive, entries, index),
        Commands::Extract {
            archive,
            dest,
            key,
            index,
        } => run_extract(archive, dest, key, index),
        Commands::Verify { archive } => run_verify(archive),
        Commands::Repack {
            input,
            output,
            comment,
            index,
        } => run_repack(input, output, comment, index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_forward_slashes_relative_to_root() {
        let root = Path::new("shots");
        assert_eq!(key_for(&root.join("a").join("b.png"), root).unwrap(), "a/b.png");
        assert_eq!(key_for(Path::new("c.png"), Path::new("")).unwrap(), "c.png");
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
    }
}
