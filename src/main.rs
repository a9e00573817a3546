use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::{fmt, EnvFilter};

use binpatcher::{Archive, BundleReader, DiffOptions, Distribution, Generator, Patcher};

#[derive(Parser)]
#[command(name = "binpatcher", about = "Multi-distribution binary patch bundles")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff clean/dirty directory pairs into one bundle
    Diff {
        /// Output bundle file
        #[arg(long, short)]
        output: PathBuf,
        #[arg(long)]
        client_clean: Option<PathBuf>,
        #[arg(long)]
        client_dirty: Option<PathBuf>,
        #[arg(long)]
        server_clean: Option<PathBuf>,
        #[arg(long)]
        server_dirty: Option<PathBuf>,
        #[arg(long)]
        joined_clean: Option<PathBuf>,
        #[arg(long)]
        joined_dirty: Option<PathBuf>,
    },
    /// Apply bundles, in order, to a base directory
    Patch {
        /// Base directory
        #[arg(long)]
        base: PathBuf,
        /// Output directory, replaced if it exists
        #[arg(long, short)]
        output: PathBuf,
        /// Distribution of the base
        #[arg(long, env = "BINPATCHER_DIST")]
        dist: Distribution,
        /// Only load bundles below this prefix of a patch set directory
        #[arg(long)]
        prefix: Option<String>,
        /// Leave untouched base files out of the output
        #[arg(long)]
        no_unpatched: bool,
        /// Bundle files or patch set directories
        #[arg(required = true)]
        patches: Vec<PathBuf>,
    },
    /// Print the records of a bundle
    List {
        patch: PathBuf,
    },
}

impl Cli {
    fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }
        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().as_str()));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Commands::Diff {
            output,
            client_clean,
            client_dirty,
            server_clean,
            server_dirty,
            joined_clean,
            joined_dirty,
        } => {
            let pairs = [
                (Distribution::Client, client_clean, client_dirty),
                (Distribution::Server, server_clean, server_dirty),
                (Distribution::Joined, joined_clean, joined_dirty),
            ];
            let mut sets = Vec::new();
            for (dist, clean, dirty) in pairs {
                match (clean, dirty) {
                    (Some(clean), Some(dirty)) => sets.push((dist, clean, dirty)),
                    (None, None) => {}
                    _ => bail!("--{dist}-clean and --{dist}-dirty must be given together"),
                }
            }
            if sets.is_empty() {
                bail!("At least one --<dist>-clean/--<dist>-dirty pair is required");
            }

            println!("Creating bundle...");
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let summary = tokio::task::spawn_blocking(move || -> Result<_> {
                let mut generator = Generator::new(DiffOptions::default());
                for (dist, clean, dirty) in sets {
                    println!("  {dist}: {} -> {}", clean.display(), dirty.display());
                    let clean = Archive::load_dir(&clean)
                        .with_context(|| format!("Failed to load {}", clean.display()))?;
                    let dirty = Archive::load_dir(&dirty)
                        .with_context(|| format!("Failed to load {}", dirty.display()))?;
                    generator.add_set(dist, clean, dirty)?;
                }
                write_atomically(&output, |file| {
                    let (_, summary) = generator.write_bundle(file)?;
                    Ok(summary)
                })
            })
            .await??;

            println!("\nBundle created successfully!");
            println!("  Files created: {}", summary.created);
            println!("  Files modified: {}", summary.modified);
            println!("  Files removed: {}", summary.removed);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Patch {
            base,
            output,
            dist,
            prefix,
            no_unpatched,
            patches,
        } => {
            println!("Applying patches...");
            println!("  Base: {} ({dist})", base.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let summary = tokio::task::spawn_blocking(move || -> Result<_> {
                let base_archive = Archive::load_dir(&base)
                    .with_context(|| format!("Failed to load base: {}", base.display()))?;
                let mut patcher = Patcher::new(dist).include_unpatched(!no_unpatched);
                for patch in &patches {
                    let kept = patcher
                        .load_patch_set(patch, prefix.as_deref())
                        .with_context(|| format!("Failed to load patch: {}", patch.display()))?;
                    println!("  Patch: {} ({kept} records)", patch.display());
                }
                let (patched, summary) = patcher.apply(&base_archive)?;
                patched
                    .write_dir(&output)
                    .with_context(|| format!("Failed to write output: {}", output.display()))?;
                Ok(summary)
            })
            .await??;

            println!("\nPatches applied successfully!");
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files deleted: {}", summary.files_deleted);
            println!("  Files unpatched: {}", summary.files_unpatched);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::List { patch } => {
            tokio::task::spawn_blocking(move || list_bundle(&patch)).await??;
        }
    }

    Ok(())
}

/// Write `output` through a temporary sibling file that replaces it only
/// once `write` succeeded.
fn write_atomically<T>(
    output: &Path,
    write: impl FnOnce(std::io::BufWriter<&std::fs::File>) -> binpatcher::Result<T>,
) -> Result<T> {
    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    let value = write(std::io::BufWriter::new(temp.as_file()))?;
    temp.persist(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    Ok(value)
}

fn list_bundle(path: &Path) -> Result<()> {
    let mut reader = BundleReader::open(path)
        .with_context(|| format!("Failed to open bundle: {}", path.display()))?;
    let declared = reader.declared_distributions();

    let mut rows = Vec::new();
    while let Some(record) = reader.read_entry()? {
        rows.push((record.target_path.clone(), record.operation, record.distributions));
        reader.recycle(record);
    }

    let width = rows
        .iter()
        .map(|(p, _, _)| p.len())
        .max()
        .unwrap_or(0)
        .max("PATH".len());

    println!(
        "{} entries, distributions: {}",
        reader.entry_count(),
        declared
    );
    print!("{:<width$}  {:<6}", "PATH", "OP");
    for dist in declared.iter() {
        print!("  {:<6}", dist.name().to_uppercase());
    }
    println!();
    for (target_path, op, dists) in rows {
        print!("{target_path:<width$}  {:<6}", op.name());
        for dist in declared.iter() {
            let mark = if dists.contains(dist) { "x" } else { "" };
            print!("  {mark:<6}");
        }
        println!();
    }

    Ok(())
}
