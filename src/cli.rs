use std::error::Error;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, error::ErrorKind};
use tracing_subscriber::EnvFilter;

use crate::config::{DateRangeDescriptor, MaterializerConfig};
use crate::materializer::Materializer;
use crate::partition::PartitionKey;
use crate::reader::MaterializedDatasetReader;

#[derive(Debug, Parser)]
#[command(
    name = "lakefetch",
    disable_help_subcommand = true,
    about = "Materialize year/month partitioned remote datasets",
    long_about = "Discover, download, and validate numbered batch files for every month of a date range, then read them back as one dataset.",
    after_help = "Values are resolved in order: explicit flags, then --config, then built-in defaults. Set RUST_LOG to control log output."
)]
struct LakefetchCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download and validate every partition of a date range.
    Materialize(MaterializeArgs),
    /// Report what is currently materialized for a dataset.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
struct MaterializeArgs {
    #[arg(long, value_name = "NAME", help = "Dataset name (remote and local path segment)")]
    dataset: Option<String>,
    #[arg(
        long,
        value_name = "YYYY-MM",
        help = "First month to materialize (inclusive)"
    )]
    start: Option<PartitionKey>,
    #[arg(
        long,
        value_name = "YYYY-MM",
        help = "Last month to materialize (inclusive); defaults to the current month when --start is given"
    )]
    end: Option<PartitionKey>,
    #[arg(
        long = "range-descriptor",
        value_name = "PATH",
        conflicts_with_all = ["start", "end"],
        help = "JSON file with start_year, start_month, end_year, end_month"
    )]
    range_descriptor: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "JSON config file")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Local root directory")]
    root: Option<PathBuf>,
    #[arg(long = "base-url", value_name = "URL", help = "Remote host prefix")]
    base_url: Option<String>,
    #[arg(
        long,
        value_parser = parse_positive_usize,
        help = "Partitions materialized concurrently"
    )]
    workers: Option<usize>,
    #[arg(
        long = "max-retries",
        help = "Retries after the first attempt for transient faults"
    )]
    max_retries: Option<u32>,
    #[arg(long = "backoff-seconds", help = "Base delay between attempts")]
    backoff_seconds: Option<f64>,
    #[arg(long = "timeout-seconds", help = "Wall-clock budget per partition")]
    timeout_seconds: Option<u64>,
    #[arg(long = "max-batches", help = "Hard cap on batches per partition")]
    max_batches: Option<u32>,
    #[arg(long, short, help = "Log at debug level unless RUST_LOG is set")]
    verbose: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(long, value_name = "NAME", help = "Dataset name")]
    dataset: String,
    #[arg(long, value_name = "DIR", help = "Local root directory")]
    root: Option<PathBuf>,
    #[arg(long, help = "Artifact extension")]
    extension: Option<String>,
    #[arg(long, short, help = "Log at debug level unless RUST_LOG is set")]
    verbose: bool,
}

/// Parse `args_iter` (without the program name) and run the selected command.
pub fn run_cli<I>(args_iter: I) -> Result<(), Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let Some(cli) =
        parse_cli::<LakefetchCli, _>(std::iter::once("lakefetch".to_string()).chain(args_iter))?
    else {
        return Ok(());
    };

    match cli.command {
        Command::Materialize(args) => {
            init_tracing(args.verbose);
            run_materialize(args)
        }
        Command::Inspect(args) => {
            init_tracing(args.verbose);
            run_inspect(args)
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run_materialize(args: MaterializeArgs) -> Result<(), Box<dyn Error>> {
    let config = build_config(args)?;
    let materializer = Materializer::new(config)?;
    let report = materializer.run()?;
    let elapsed = report.finished_at - report.started_at;
    println!(
        "Materialized '{}': {} partition(s), {} file(s), {} bytes in {:.1}s (peak {} concurrent)",
        report.dataset,
        report.partitions.len(),
        report.artifacts.len(),
        report.summary.bytes,
        elapsed.num_milliseconds() as f64 / 1000.0,
        report.peak_in_flight
    );
    if let Some(busiest) = &report.summary.busiest {
        println!(
            "Busiest partition {} with {} batch(es) ({:.1}%); {} empty partition(s)",
            busiest.partition,
            busiest.batches,
            busiest.share * 100.0,
            report.summary.empty_partitions
        );
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<(), Box<dyn Error>> {
    let mut config = MaterializerConfig::for_dataset(args.dataset);
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if let Some(extension) = args.extension {
        config.extension = extension;
    }
    config.validate()?;
    let reader = MaterializedDatasetReader::new(config.layout());
    match reader.load()? {
        None => println!(
            "No artifacts materialized for '{}' under {}",
            config.dataset_name,
            config.layout().dataset_dir().display()
        ),
        Some(dataset) => {
            println!(
                "'{}': {} artifact(s), {} row(s), {} partition(s)",
                config.dataset_name,
                dataset.len(),
                dataset.num_rows(),
                dataset.partitions().len()
            );
            println!("Columns: {}", dataset.columns().join(", "));
        }
    }
    Ok(())
}

fn build_config(args: MaterializeArgs) -> Result<MaterializerConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => MaterializerConfig::from_json_file(path)?,
        None => MaterializerConfig::default(),
    };
    if let Some(dataset) = args.dataset {
        config.dataset_name = dataset;
    }
    if let Some(path) = &args.range_descriptor {
        let descriptor = DateRangeDescriptor::from_json(&fs::read_to_string(path)?)?;
        config = config.with_descriptor(&descriptor);
    }
    if let Some(start) = args.start {
        let end = match args.end {
            Some(end) => end,
            None => PartitionKey::from_date(Utc::now().date_naive())?,
        };
        config.start_year = Some(start.year());
        config.start_month = Some(start.month());
        config.end_year = Some(end.year());
        config.end_month = Some(end.month());
    } else if let Some(end) = args.end {
        config.end_year = Some(end.year());
        config.end_month = Some(end.month());
    }
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(backoff_seconds) = args.backoff_seconds {
        config.backoff_seconds = backoff_seconds;
    }
    if let Some(timeout_seconds) = args.timeout_seconds {
        config.per_partition_timeout_seconds = timeout_seconds;
    }
    if let Some(max_batches) = args.max_batches {
        config.max_batches_per_partition = max_batches;
    }
    config.validate()?;
    Ok(config)
}

fn parse_positive_usize(raw: &str) -> Result<usize, String> {
    let parsed = raw
        .parse::<usize>()
        .map_err(|_| format!("Could not parse '{raw}' as a positive integer"))?;
    if parsed == 0 {
        return Err("value must be greater than zero".to_string());
    }
    Ok(parsed)
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> LakefetchCli {
        parse_cli::<LakefetchCli, _>(std::iter::once("lakefetch").chain(args.iter().copied()))
            .unwrap()
            .unwrap()
    }

    fn materialize_args(args: &[&str]) -> MaterializeArgs {
        match parse(args).command {
            Command::Materialize(args) => args,
            Command::Inspect(_) => panic!("expected materialize"),
        }
    }

    #[test]
    fn flags_override_config_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        fs::write(
            &path,
            r#"{"dataset_name": "rides", "max_workers": 8, "max_retries": 5}"#,
        )
        .unwrap();
        let args = materialize_args(&[
            "materialize",
            "--config",
            path.to_str().unwrap(),
            "--start",
            "2022-03",
            "--end",
            "2022-04",
            "--workers",
            "2",
        ]);
        let config = build_config(args).unwrap();
        assert_eq!(config.dataset_name, "rides");
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.date_range().unwrap().months(), 2);
    }

    #[test]
    fn range_descriptor_supplies_the_months() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("range.json");
        fs::write(
            &path,
            r#"{"start_year": 2022, "start_month": 3, "end_year": 2024, "end_month": 12}"#,
        )
        .unwrap();
        let args = materialize_args(&[
            "materialize",
            "--dataset",
            "rides",
            "--range-descriptor",
            path.to_str().unwrap(),
        ]);
        assert_eq!(build_config(args).unwrap().date_range().unwrap().months(), 34);
    }

    #[test]
    fn missing_start_is_reported_by_range_validation() {
        let args = materialize_args(&["materialize", "--dataset", "rides"]);
        let config = build_config(args).unwrap();
        assert!(config.date_range().is_err());
    }

    #[test]
    fn bad_values_are_rejected_at_parse_time() {
        let result = parse_cli::<LakefetchCli, _>(["lakefetch", "materialize", "--start", "2022-13"]);
        assert!(result.is_err());
        let result = parse_cli::<LakefetchCli, _>(["lakefetch", "materialize", "--workers", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn inspect_of_missing_dataset_succeeds() {
        let temp = tempdir().unwrap();
        let root = temp.path().to_str().unwrap().to_string();
        let args = ["inspect", "--dataset", "rides", "--root", root.as_str()]
            .into_iter()
            .map(String::from);
        run_cli(args).unwrap();
    }
}
