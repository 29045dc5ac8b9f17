use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tcm::clean::{CleanOptions, clean_file};
use tcm::core::{DEFAULT_PATH_SEPARATOR, DEFAULT_RECURRING_CATEGORY, TracingSink};
use tcm::output::ReportFormat;
use tcm::report::{read_report, summarize_file};
use tcm::summary::SummaryOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tcm",
    about = "TaskCoach task-file tooling: period reset and daily effort reports",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Remove completed tasks and all efforts for a fresh tracking period.
    Clean(CleanArgs),

    /// Build a per-day effort summary with reconstructed timelines.
    Summary(SummaryArgs),
}

#[derive(Debug, Args)]
struct CleanArgs {
    /// Task file (.tsk) to clean. It is never modified.
    input: PathBuf,
    /// Where to write the cleaned file. Defaults to <input>_cleaned.tsk.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Category whose completed tasks are kept.
    #[arg(long, default_value = DEFAULT_RECURRING_CATEGORY)]
    recurring: String,
}

#[derive(Debug, Args)]
struct SummaryArgs {
    /// Task file to summarize.
    input: PathBuf,
    /// Where to write the report. Defaults to <input>_summary.<format>.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Report format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,
    /// Category paths counted as NO-WORK (repeatable).
    #[arg(long = "no-work", default_values_t = ["Pause".to_string()])]
    no_work: Vec<String>,
    /// Administrative category left out of the report rows.
    #[arg(long, default_value = DEFAULT_RECURRING_CATEGORY)]
    recurring: String,
    /// Keep tasks that have no effort in the report.
    #[arg(long)]
    keep_idle_tasks: bool,
    /// Print the summary and timelines as JSON instead of writing a report file.
    #[arg(long)]
    json: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Csv,
    Xlsx,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Csv => ReportFormat::Csv,
            OutputFormat::Xlsx => ReportFormat::Xlsx,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Clean(args) => handle_clean(args),
        Commands::Summary(args) => handle_summary(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "tcm=debug,info"
    } else {
        "tcm=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_clean(args: CleanArgs) -> Result<()> {
    let CleanArgs {
        input,
        output,
        recurring,
    } = args;
    let options = CleanOptions {
        recurring_category: recurring,
    };

    let (written, outcome) = clean_file(&input, output.as_deref(), &options)?;
    println!(
        "{}: removed {} done tasks and {} efforts",
        written.display(),
        outcome.removed_tasks,
        outcome.removed_efforts
    );
    Ok(())
}

fn handle_summary(args: SummaryArgs) -> Result<()> {
    let options = summary_options(&args);
    let SummaryArgs {
        input,
        output,
        format,
        json,
        ..
    } = args;

    let mut sink = TracingSink;
    if json {
        let report = read_report(&input, &options, &mut sink)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let written = summarize_file(&input, output.as_deref(), format.into(), &options, &mut sink)?;
    println!("{}", written.display());
    Ok(())
}

fn summary_options(args: &SummaryArgs) -> SummaryOptions {
    SummaryOptions {
        recurring_category: args.recurring.clone(),
        no_work_categories: args.no_work.clone(),
        drop_tasks_without_effort: !args.keep_idle_tasks,
        path_separator: DEFAULT_PATH_SEPARATOR.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse args")
    }

    #[test]
    fn summary_defaults_match_library_defaults() {
        let cli = parse(&["tcm", "summary", "week.tsk"]);
        let Commands::Summary(args) = cli.command else {
            panic!("expected summary subcommand");
        };
        assert!(matches!(args.format, OutputFormat::Csv));
        assert!(!args.json);
        assert_eq!(summary_options(&args), SummaryOptions::default());
    }

    #[test]
    fn summary_flags_override_options() {
        let cli = parse(&[
            "tcm",
            "--verbose",
            "summary",
            "week.tsk",
            "--format",
            "xlsx",
            "--no-work",
            "Pause",
            "--no-work",
            "Private->Sport",
            "--recurring",
            "daily",
            "--keep-idle-tasks",
        ]);
        assert!(cli.verbose);
        let Commands::Summary(args) = cli.command else {
            panic!("expected summary subcommand");
        };
        assert!(matches!(args.format, OutputFormat::Xlsx));
        let options = summary_options(&args);
        assert_eq!(options.no_work_categories, vec!["Pause", "Private->Sport"]);
        assert_eq!(options.recurring_category, "daily");
        assert!(!options.drop_tasks_without_effort);
    }

    #[test]
    fn clean_accepts_output_and_verbose_after_subcommand() {
        let cli = parse(&["tcm", "clean", "week.tsk", "-o", "out/next.tsk", "--verbose"]);
        assert!(cli.verbose);
        let Commands::Clean(args) = cli.command else {
            panic!("expected clean subcommand");
        };
        assert_eq!(args.output, Some(PathBuf::from("out/next.tsk")));
        assert_eq!(args.recurring, DEFAULT_RECURRING_CATEGORY);
    }

    #[test]
    fn clean_handler_writes_next_to_input() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let input = tmp.path().join("week.tsk");
        fs::write(
            &input,
            "<tasks>\n<task id=\"a\" percentageComplete=\"100\" subject=\"Done\">\n</task>\n</tasks>\n",
        )
        .expect("write input");

        handle_clean(CleanArgs {
            input: input.clone(),
            output: None,
            recurring: DEFAULT_RECURRING_CATEGORY.to_string(),
        })
        .expect("clean");

        let cleaned = fs::read_to_string(tmp.path().join("week_cleaned.tsk")).expect("read output");
        assert_eq!(cleaned, "<tasks>\n</tasks>\n");
    }
}
