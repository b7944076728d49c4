//! motocount - count motorcycles in an image, a local video or a YouTube video
//!
//! Each run writes an annotated copy of the media into a scratch directory,
//! stores the per-frame counts, and prints a summary. The annotated output is
//! copied to `--output` when given and deleted otherwise.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use moto_counter::error::StartupError;
use moto_counter::stats::{query_stats, Granularity, StatsSummary, TimeFilter};
use moto_counter::storage::{ResultStore, SqliteResultStore};
use moto_counter::ui::Ui;
use moto_counter::{AppConfig, Processor, RunReport};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "MOTO_CONFIG")]
    config: Option<PathBuf>,
    /// Output style: auto, plain or pretty.
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count motorcycles in a still image.
    Image {
        path: PathBuf,
        /// Where to copy the annotated image.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Count motorcycles in a local video file.
    Video {
        path: String,
        /// Where to copy the annotated mp4.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Download a YouTube video with yt-dlp and count motorcycles in it.
    Youtube {
        url: String,
        /// Where to copy the annotated mp4.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print stored totals grouped by hour, day or month.
    Stats {
        #[arg(long, value_enum, default_value_t = GranularityArg::Day)]
        granularity: GranularityArg,
        /// Restrict to one day (YYYY-MM-DD).
        #[arg(long, conflicts_with_all = ["month", "year"])]
        date: Option<String>,
        /// Restrict to one month (YYYY-MM).
        #[arg(long, conflicts_with = "year")]
        month: Option<String>,
        /// Restrict to one year (YYYY).
        #[arg(long)]
        year: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GranularityArg {
    Hour,
    Day,
    Month,
}

impl From<GranularityArg> for Granularity {
    fn from(value: GranularityArg) -> Self {
        match value {
            GranularityArg::Hour => Granularity::Hour,
            GranularityArg::Day => Granularity::Day,
            GranularityArg::Month => Granularity::Month,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let ui = Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());
    let config = {
        let _stage = ui.stage("Load configuration");
        AppConfig::load_from(args.config.as_deref())?
    };
    let store: Arc<dyn ResultStore> = Arc::new(open_store(&config)?);

    match args.command {
        Command::Stats {
            granularity,
            date,
            month,
            year,
            json,
        } => {
            let filter = match (date, month, year) {
                (Some(day), _, _) => TimeFilter::parse_day(&day)?,
                (_, Some(month), _) => TimeFilter::parse_month(&month)?,
                (_, _, Some(year)) => TimeFilter::parse_year(&year)?,
                _ => TimeFilter::All,
            };
            print_stats(store.as_ref(), granularity.into(), filter, json)
        }
        Command::Image { path, output } => {
            let mut processor = build_processor(&ui, &config, store)?;
            let report = {
                let _stage = ui.stage("Process image");
                processor.process_image(&path)?
            };
            finish(report, output.as_deref(), &mut std::io::stdout(), &mut std::io::stderr())
        }
        Command::Video { path, output } => {
            let mut processor = build_processor(&ui, &config, store)?;
            let mut progress = ui.frames();
            let report = processor.process_video(&path, &mut |p| progress.update(&p))?;
            drop(progress);
            finish(report, output.as_deref(), &mut std::io::stdout(), &mut std::io::stderr())
        }
        Command::Youtube { url, output } => {
            let mut processor = build_processor(&ui, &config, store)?;
            let mut progress = ui.frames();
            let report = processor.process_youtube(&url, &mut |p| progress.update(&p))?;
            drop(progress);
            finish(report, output.as_deref(), &mut std::io::stdout(), &mut std::io::stderr())
        }
    }
}

fn open_store(config: &AppConfig) -> Result<SqliteResultStore, StartupError> {
    SqliteResultStore::open(&config.db_path).map_err(|e| StartupError::Store {
        path: config.db_path.clone(),
        reason: format!("{:#}", e),
    })
}

fn build_processor(ui: &Ui, config: &AppConfig, store: Arc<dyn ResultStore>) -> Result<Processor> {
    let _stage = ui.stage("Prepare detector");
    Ok(Processor::from_config(config, store)?)
}

/// Prints the run, then copies the output. Warnings are printed even when
/// the copy fails.
fn finish(
    report: RunReport,
    output: Option<&Path>,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<()> {
    let run = &report.run;
    writeln!(out, "run:          {}", run.run_id)?;
    writeln!(out, "kind:         {}", run.kind.as_str())?;
    writeln!(out, "status:       {}", run.status.as_str())?;
    writeln!(out, "frames read:  {}", report.frames_read)?;
    writeln!(out, "sampled:      {}", run.frame_results.len())?;
    writeln!(out, "motorcycles:  {}", run.total_count)?;
    for line in report.warning_summary() {
        writeln!(err, "warning: {}", line)?;
    }

    match (output, &report.artifact) {
        (Some(dest), Some(artifact)) => {
            artifact.persist_to(dest)?;
            writeln!(out, "output:       {}", dest.display())?;
        }
        (Some(_), None) => return Err(anyhow!("run produced no output to copy")),
        (None, _) => {}
    }
    Ok(())
}

fn print_stats(
    store: &dyn ResultStore,
    granularity: Granularity,
    filter: TimeFilter,
    json: bool,
) -> Result<()> {
    let buckets = query_stats(store, granularity, filter)?;
    let summary = StatsSummary::from_buckets(&buckets);
    if json {
        let body = serde_json::json!({ "buckets": buckets, "summary": summary });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }
    if buckets.is_empty() {
        println!("no motorcycles recorded for this period");
        return Ok(());
    }
    for bucket in &buckets {
        println!("{:<16} {:>8}", bucket.label, bucket.total_count);
    }
    println!("total {}  mean {:.1}", summary.total, summary.mean);
    if let Some(max) = &summary.max {
        println!("peak  {} ({})", max.label, max.total_count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use moto_counter::{InferenceRun, OutputArtifact, RunId, RunKind, RunWarning};

    fn report(artifact: Option<OutputArtifact>) -> RunReport {
        RunReport {
            run: InferenceRun::from_frames(RunId::generate(), RunKind::Video, Vec::new(), None),
            warnings: vec![RunWarning::PersistenceFailed {
                reason: "database is locked".into(),
            }],
            artifact,
            frames_read: 0,
            stored: false,
        }
    }

    #[test]
    fn warnings_are_printed_when_the_copy_fails() {
        let work = tempfile::tempdir().unwrap();
        // Nothing was written at the artifact path, so the copy fails.
        let artifact = OutputArtifact::create(Some(work.path()), "annotated.mp4").unwrap();
        let dest = work.path().join("out.mp4");
        let (mut out, mut err) = (Vec::new(), Vec::new());

        assert!(finish(report(Some(artifact)), Some(&dest), &mut out, &mut err).is_err());
        let err = String::from_utf8(err).unwrap();
        assert_eq!(err, "warning: result not stored: database is locked\n");
        assert!(!String::from_utf8(out).unwrap().contains("output:"));
    }

    #[test]
    fn warnings_are_printed_when_there_is_no_output() {
        let dest = std::env::temp_dir().join("never-written.mp4");
        let (mut out, mut err) = (Vec::new(), Vec::new());

        assert!(finish(report(None), Some(&dest), &mut out, &mut err).is_err());
        assert!(String::from_utf8(err).unwrap().contains("result not stored"));
    }
}
