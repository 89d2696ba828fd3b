use std::error::Error as StdError;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use memmap2::Mmap;
use mirror_arena::{Arena, ArenaDesc, ChangeBuffer, ChangeKind, Usage, HEADER_LEN};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let ReplayCommand {
        base_address,
        action,
    } = ReplayCommand::parse();

    if let Err(err) = run(base_address, action) {
        eprintln!("mirror-replay: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser)]
#[command(about = "Produce, inspect and apply change buffers of memory images")]
struct ReplayCommand {
    /// Where to place the working arena.
    ///
    /// Must be a multiple of the required arena alignment (128 MiB) and not otherwise mapped.
    #[arg(long, global = true, default_value = "0x3f0000000000", value_parser = parse_address)]
    base_address: usize,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Print the header, and for diffs the page numbers, of a change buffer.
    Inspect {
        changes: PathBuf,
        /// Page size the diff was recorded with, defaults to this system's.
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Record the pages in which two equally sized memory images differ.
    Diff {
        old: PathBuf,
        new: PathBuf,
        #[arg(short, long, help = "Where to write the page diff")]
        output: PathBuf,
    },
    /// Replay a change buffer on top of a memory image.
    Apply {
        image: PathBuf,
        changes: PathBuf,
        #[arg(short, long, help = "Where to write the resulting image")]
        output: PathBuf,
    },
}

fn run(base_address: usize, action: Action) -> Result<(), Box<dyn StdError>> {
    match action {
        Action::Inspect { changes, page_size } => inspect(&changes, page_size),
        Action::Diff { old, new, output } => diff(base_address, &old, &new, &output),
        Action::Apply {
            image,
            changes,
            output,
        } => apply(base_address, &image, &changes, &output),
    }
}

fn inspect(changes: &Path, page_size: Option<usize>) -> Result<(), Box<dyn StdError>> {
    let map = map_file(changes)?;
    let buffer = ChangeBuffer::parse(&map)?;

    let mut out = std::io::stdout().lock();
    writeln!(out, "kind: {}", buffer.kind())?;
    writeln!(out, "payload: {} bytes", buffer.payload().len())?;

    if buffer.kind() == ChangeKind::Diff {
        let page_size = page_size.unwrap_or_else(|| mirror_vm::Mapper::new().page_size());
        let pages: Vec<String> = buffer
            .diff_pages(page_size)?
            .map(|(page, _)| page.to_string())
            .collect();
        writeln!(out, "pages: {}", pages.join(" "))?;
    }

    Ok(())
}

fn diff(base_address: usize, old: &Path, new: &Path, output: &Path) -> Result<(), Box<dyn StdError>> {
    let old = map_file(old)?;
    let new = map_file(new)?;
    if old.len() != new.len() {
        return Err(format!("images differ in size, {} and {} bytes", old.len(), new.len()).into());
    }

    let arena = Arena::new(&ArenaDesc {
        base_address,
        size: old.len(),
        usage: Usage::ReadWriteDiff,
    })?;

    arena.write_at(0, &old)?;
    // Loading dirtied everything, only what changes from here on is of interest.
    arena.retrieve_changes_vec()?;

    let page_size = arena.page_size();
    let mut changed = 0;
    for (idx, (before, after)) in old.chunks(page_size).zip(new.chunks(page_size)).enumerate() {
        if before != after {
            arena.write_at(idx * page_size, after)?;
            changed += 1;
        }
    }

    tracing::info!(changed, pages = arena.page_count(), "recorded differing pages");
    debug_assert_eq!(arena.dirty_page_count(), changed);

    let changes = arena.retrieve_changes_vec()?;
    persist(output, &changes)
}

fn apply(
    base_address: usize,
    image: &Path,
    changes: &Path,
    output: &Path,
) -> Result<(), Box<dyn StdError>> {
    let image = map_file(image)?;
    let changes = map_file(changes)?;

    let arena = Arena::new(&ArenaDesc {
        base_address,
        size: image.len(),
        usage: Usage::ReadWrite,
    })?;

    arena.write_at(0, &image)?;
    arena.apply_changes(&changes)?;
    tracing::info!(len = changes.len(), "applied change buffer");

    let snapshot = arena.retrieve_changes_vec()?;
    persist(output, &snapshot[HEADER_LEN..])
}

fn map_file(path: &Path) -> Result<Mmap, Box<dyn StdError>> {
    let file = File::open(path).map_err(|err| format!("{}: {err}", path.display()))?;
    // Safety: we only read, and nobody is expected to truncate our inputs while we run.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map)
}

/// Write everything into a temporary file first, then move it in place.
fn persist(path: &Path, data: &[u8]) -> Result<(), Box<dyn StdError>> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut pending = tempfile::NamedTempFile::new_in(parent)?;
    pending.write_all(data)?;
    pending.as_file().sync_data()?;
    pending.persist(path)?;

    tracing::debug!(path = %path.display(), len = data.len(), "persisted");
    Ok(())
}

fn parse_address(arg: &str) -> Result<usize, String> {
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => arg.parse(),
    };

    parsed.map_err(|err| format!("invalid address {arg}: {err}"))
}
