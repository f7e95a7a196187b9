use clap::Parser;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tensorkeys::model::total_params;
use tensorkeys::{ExtractError, Format, extract, report};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tensorkeys")]
#[command(about = "Write the name, precision and shape of every tensor in model files")]
struct Cli {
    #[arg(help = "Folder of .ckpt/.safetensors files, or a single model file")]
    path: PathBuf,
    #[arg(short, long, default_value_t = 1, help = "Number of files to process at once")]
    jobs: usize,
    #[arg(short, long, help = "Regex pattern to filter tensor names")]
    regex: Option<String>,
    #[arg(
        short,
        long,
        help = "Folder for the .keys.log files (defaults to next to each model)"
    )]
    output_dir: Option<PathBuf>,
}

struct Summary {
    written: usize,
    params: u64,
    log_name: String,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}

fn process(
    path: &Path,
    output_dir: Option<&Path>,
    filter: Option<&Regex>,
) -> Result<Summary, ExtractError> {
    let records = extract(path, Format::from_path(path)?)?;
    let log = report::log_path(path, output_dir);
    let written = report::write_log(&log, &records, filter).map_err(|e| {
        ExtractError::Unreadable {
            path: path.to_path_buf(),
            cause: anyhow::Error::new(e).context(format!("writing {}", log.display())),
        }
    })?;
    Ok(Summary {
        written,
        params: total_params(&records),
        log_name: file_name(&log),
    })
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,tensorkeys=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let filter = cli.regex.as_deref().map(Regex::new).transpose()?;

    let paths = if cli.path.is_dir() {
        let files = report::find_model_files(&cli.path)?;
        if files.is_empty() {
            println!(
                "No .ckpt or .safetensors files found in {}",
                cli.path.display()
            );
            return Ok(());
        }
        println!("Found {} model file(s) to process", files.len());
        files
    } else if cli.path.is_file() && report::is_model_file(&cli.path) {
        vec![cli.path.clone()]
    } else {
        println!("Error: {} is not a valid directory", cli.path.display());
        std::process::exit(1);
    };

    if let Some(dir) = &cli.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_for_ctrlc = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_for_ctrlc.store(true, Ordering::SeqCst);
    })?;

    let results = tensorkeys::extract::for_each_file(&paths, cli.jobs, &cancel, |path| {
        println!("Processing {}...", file_name(path));
        let result = process(path, cli.output_dir.as_deref(), filter.as_ref());
        match &result {
            Ok(summary) => println!(
                "  Extracted {} keys with precision to {} ({} params)",
                summary.written,
                summary.log_name,
                human_format::Formatter::new().format(summary.params as f64)
            ),
            Err(e) => println!("  Error processing {}: {}", file_name(path), e.cause()),
        }
        result
    });

    let mut failed = 0;
    for e in results.iter().filter_map(|r| r.as_ref().err()) {
        failed += 1;
        if let ExtractError::Cancelled { .. } = e {
            warn!(file = %e.path().display(), "skipped after interrupt");
        }
    }
    let extracted: usize = results.iter().flatten().map(|s| s.written).sum();
    info!(files = results.len(), failed, keys = extracted, "done");
    Ok(())
}
