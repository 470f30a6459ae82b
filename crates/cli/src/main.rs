use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cdr_core::config::{
    data_file_from_env_value, gc_batch_size_from_env_value, local_zone_from_env_value,
};
use cdr_core::constants::{
    DATA_FILE_ENV, DEFAULT_PROGRESS_INTERVAL_SECS, GC_BATCH_SIZE_ENV, LOCAL_TIMEZONE_ENV,
};
use cdr_core::{
    CdrService, CoreConfig, DiagnosisSystem, IngestOutcome, IngestRequest, Mrn, ProblemFilter,
    ProgressReporter,
};

#[derive(Parser)]
#[command(name = "cdr")]
#[command(about = "Clinical data repository CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one converted CCDA request for a patient
    Ingest {
        /// Medical record number
        mrn: String,
        /// Ingestion request JSON file
        request: PathBuf,
    },
    /// Ingest every `<mrn>.json` request in a directory
    Import {
        /// Directory of ingestion requests
        dir: PathBuf,
    },
    /// Print a patient's current problem list as JSON
    ProblemList {
        /// Medical record number
        mrn: String,
        /// Filter JSON, e.g. '{"filter": {"icd9": {"code": ["296.2*"]}}}'
        #[arg(long)]
        filter: Option<String>,
    },
    /// List the ICD codes used by current documents
    Codes {
        /// icd9 or icd10
        system: String,
    },
    /// List patients with a matching diagnosis code
    Diagnosis {
        /// icd9 or icd10
        system: String,
        /// Exact code, or a prefix ending in `*`
        code: String,
    },
    /// Remove a patient's document
    Remove {
        /// Medical record number
        mrn: String,
    },
    /// Purge orphaned observations and statuses
    Gc {
        /// Only report what would be purged
        #[arg(long)]
        preview: bool,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("cdr=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("Use 'cdr --help' for commands");
        return Ok(());
    };

    let cfg = Arc::new(CoreConfig::new(
        local_zone_from_env_value(std::env::var(LOCAL_TIMEZONE_ENV).ok())?,
        data_file_from_env_value(std::env::var(DATA_FILE_ENV).ok()),
        gc_batch_size_from_env_value(std::env::var(GC_BATCH_SIZE_ENV).ok())?,
        Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
    )?);
    if cfg.data_file().is_none() {
        tracing::warn!("{DATA_FILE_ENV} is not set; nothing will be persisted");
    }
    let service = CdrService::open(cfg)?;

    match command {
        Commands::Ingest { mrn, request } => {
            let mrn = Mrn::new(&mrn)?;
            let outcome = service.ingest(&mrn, read_request(&request)?)?;
            print_outcome(&mrn, &outcome);
        }
        Commands::Import { dir } => import(&service, &dir)?,
        Commands::ProblemList { mrn, filter } => {
            let mrn = Mrn::new(&mrn)?;
            let filter = filter
                .as_deref()
                .map(ProblemFilter::from_json_str)
                .transpose()?;
            match service.problem_list(&mrn, filter.as_ref())? {
                Some(list) => println!("{}", serde_json::to_string_pretty(&list)?),
                None => eprintln!("No document stored for MRN {mrn}"),
            }
        }
        Commands::Codes { system } => {
            let system: DiagnosisSystem = system.parse()?;
            let codes = service.codes(system)?;
            if codes.codes.is_empty() {
                println!("No {system} codes in use.");
            }
            for code in codes.codes {
                println!("{}\t{}\t{}", code.code, code.code_system_name, code.display);
            }
        }
        Commands::Diagnosis { system, code } => {
            let system: DiagnosisSystem = system.parse()?;
            for mrn in service.diagnosis_patients(system, &code)?.patients {
                println!("{mrn}");
            }
        }
        Commands::Remove { mrn } => {
            let mrn = Mrn::new(&mrn)?;
            if service.remove_document(&mrn)? {
                println!("Removed document for MRN {mrn}");
            } else {
                eprintln!("No document stored for MRN {mrn}");
            }
        }
        Commands::Gc { preview } => {
            let report = service.collect_garbage(preview, None)?;
            let verb = if preview { "Would purge" } else { "Purged" };
            println!(
                "{verb} {} observations and {} statuses",
                report.observations_purged, report.statuses_purged
            );
        }
    }

    Ok(())
}

fn read_request(path: &Path) -> anyhow::Result<IngestRequest> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("decoding {}", path.display()))
}

fn print_outcome(mrn: &Mrn, outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Accepted {
            observations,
            replaced,
        } => println!("Accepted document for MRN {mrn}: {observations} observations ({replaced} replaced)"),
        IngestOutcome::Obsolete => println!("Document for MRN {mrn} is obsolete"),
    }
}

/// Ingest every `<mrn>.json` file in `dir`, in file-name order.
///
/// A failing file is reported and skipped; the remaining files are still ingested.
fn import(service: &CdrService, dir: &Path) -> anyhow::Result<()> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();

    let total = files.len();
    let mut progress = ProgressReporter::new(service.config().progress_interval());
    let (mut accepted, mut obsolete, mut failed) = (0usize, 0usize, 0usize);

    for (done, path) in files.iter().enumerate() {
        let result = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .context("file name is not valid UTF-8")
            .and_then(|stem| Ok(Mrn::new(stem)?))
            .and_then(|mrn| Ok(service.ingest(&mrn, read_request(path)?)?));

        match result {
            Ok(IngestOutcome::Accepted { .. }) => accepted += 1,
            Ok(IngestOutcome::Obsolete) => obsolete += 1,
            Err(e) => {
                failed += 1;
                eprintln!("Error importing {}: {e:#}", path.display());
            }
        }

        if progress.due() {
            println!("Imported {}/{total} files", done + 1);
        }
    }

    println!("Imported {total} files: {accepted} accepted, {obsolete} obsolete, {failed} failed");
    Ok(())
}
