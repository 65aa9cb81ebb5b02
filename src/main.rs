use clap::{Parser, Subcommand};
use spcarc::archive::{Archive, SaveOptions};
use spcarc::codec::DEFAULT_COMPRESSION_LEVEL;
use spcarc::entry::CompressionState;
use spcarc::retry::RetryPolicy;
use spcarc::srd::{BlockPayload, SrdOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spc", about = "Inspect and edit SPC archives")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List archive contents
    List {
        input: PathBuf,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Extract named subfiles
    Extract {
        input: PathBuf,
        #[arg(required = true, num_args = 1..)]
        names: Vec<String>,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Extract every subfile
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Insert (replace or append) files, then save the archive in place
    Insert {
        input: PathBuf,
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        /// Subfile name (single file only; defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
        /// Storage for new entries: compressed (default) or uncompressed
        #[arg(short, long)]
        state: Option<String>,
        /// Keep retrying a locked source for this many milliseconds
        #[arg(long, default_value = "0")]
        wait_ms: u64,
        /// Deflate level 0-9
        #[arg(short, long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
        level: u32,
    },
    /// Remove the first subfile with the given name
    Remove {
        input: PathBuf,
        name: String,
    },
    /// Print the SRD block tree stored in a subfile
    Srd {
        input: PathBuf,
        name: String,
        /// Reject out-of-domain flags and non-zero padding
        #[arg(long)]
        strict: bool,
    },
    /// Load and re-save, recompressing every compressed entry
    Repack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "9")]
        level: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let ar = Archive::open(&input)?;
            let infos = ar.list_subfiles();
            if json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
                return Ok(());
            }
            println!("Archive: {}", input.display());
            println!("{:<40} {:>12} {:>12}  State", "Name", "Size", "Stored");
            for info in infos {
                let stored = info.compressed_size
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{:<40} {:>12} {:>12}  {}",
                    info.name, info.uncompressed_size, stored, info.state);
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, names, output_dir } => {
            let ar = Archive::open(&input)?;
            for name in &names {
                let n = ar.extract(name, &output_dir)?;
                println!("  extracted  {name} ({n} B)");
            }
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir } => {
            let ar = Archive::open(&input)?;
            let total = ar.extract_all(&output_dir)?;
            println!("Unpacked {} subfile(s), {total} B to: {}", ar.len(), output_dir.display());
        }

        // ── Insert ───────────────────────────────────────────────────────────
        Commands::Insert { input, files, name, state, wait_ms, level } => {
            if name.is_some() && files.len() > 1 {
                return Err("--name can only be used with a single file".into());
            }
            let state = match state {
                Some(s) => Some(CompressionState::from_name(&s)
                    .ok_or_else(|| format!("unknown state '{s}'"))?),
                None => None,
            };
            let policy = RetryPolicy::with_timeout(Duration::from_millis(wait_ms));

            let mut ar = Archive::open(&input)?;
            for path in &files {
                let subfile_name = match &name {
                    Some(n) => n.clone(),
                    None => file_name(path)?,
                };
                match state {
                    Some(st) => ar.insert_retrying_with_state(&subfile_name, path, st, &policy)?,
                    None => ar.insert_retrying(&subfile_name, path, &policy)?,
                }
                println!("  inserted  {subfile_name}");
            }
            ar.save(&input, &SaveOptions { compression_level: level })?;
            println!("Saved: {}", input.display());
        }

        // ── Remove ───────────────────────────────────────────────────────────
        Commands::Remove { input, name } => {
            let mut ar = Archive::open(&input)?;
            ar.remove(&name)?;
            ar.save(&input, &SaveOptions::default())?;
            println!("Removed {name}; {} subfile(s) remain", ar.len());
        }

        // ── Srd ──────────────────────────────────────────────────────────────
        Commands::Srd { input, name, strict } => {
            let ar = Archive::open(&input)?;
            let srd = ar.read_srd(&name, &SrdOptions { strict })?;
            srd.walk(|block, depth| {
                let summary = match block.payload() {
                    BlockPayload::FileHeader => String::new(),
                    BlockPayload::Terminator => String::new(),
                    BlockPayload::ResourceFolder(rsf) => format!("folder={}", rsf.folder_name),
                    BlockPayload::Texture(t) => format!("{}x{} format={:#04x}",
                        t.display_width, t.display_height, t.format),
                    BlockPayload::Opaque(bytes) => format!("{} B opaque", bytes.len()),
                };
                let aux = block.aux().map(|a| format!(" aux={} B", a.len())).unwrap_or_default();
                println!("{:indent$}{} flag={} {summary}{aux}",
                    "", block.tag(), block.flag(), indent = depth * 2);
            });
        }

        // ── Repack ───────────────────────────────────────────────────────────
        Commands::Repack { input, output, level } => {
            let mut ar = Archive::open(&input)?;
            ar.save(&output, &SaveOptions { compression_level: level })?;
            println!("Repacked → {}", output.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn file_name(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("{} has no file name", path.display()).into())
}
