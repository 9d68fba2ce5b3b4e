mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{CommandFactory, Parser};
use colored::*;
use commands::{AnalyzeArgs, Cli, Commands, ShowRunArgs};
use dotenv::dotenv;
use progress::CliReporter;
use simcheck_core::storage::models::RunStatus;
use simcheck_core::storage::Database;
use simcheck_core::{AppConfig, FsBlobStore, RunConfig, RunEngine, ScoreWeights};
use tracing::{error, info};

// Stand-in owner until auth exists; every storage call takes the owner
// explicitly so swapping in a real session context is a call-site change.
const TEMP_OWNER_ID: &str = "00000000-0000-0000-0000-000000000001";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match simcheck_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    match args.command {
        Some(Commands::Analyze(analyze_args)) => {
            if let Err(err) = run_analyze(&config, analyze_args) {
                error!("Error: {}", err);
                process::exit(1);
            }
        }
        Some(Commands::ShowRun(show_args)) => {
            if let Err(err) = run_show(&config, show_args) {
                error!("Error: {}", err);
                process::exit(1);
            }
        }
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:?}", config);
        }
        Some(Commands::TruncateDb) => {
            match prompt_confirm(
                "Are you SURE you want to COMPLETELY DELETE the database?",
                Some(false),
            ) {
                Ok(true) => match Database::open(&config.db_path) {
                    Ok(db) => {
                        if let Err(e) = db.truncate_all() {
                            error!("Error truncating database: {}", e);
                        } else {
                            println!("All tables truncated");
                        }
                    }
                    Err(e) => error!("Error opening database: {}", e),
                },
                _ => {
                    process::exit(0);
                }
            }
        }
        None => {
            let _ = Cli::command().print_long_help();
        }
    }

    Ok(())
}

fn run_analyze(config: &AppConfig, args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(&config.db_path)?;
    let blobs = FsBlobStore::new(config.blob_root.as_str());

    let dataset_name = args.dataset.clone().unwrap_or_else(|| {
        let dir_name = args
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{dir_name}-{epoch_secs}")
    });

    let mut run_config = RunConfig::default();
    if let Some(k) = args.k {
        run_config.k = k;
    }
    if let Some(w) = args.w {
        run_config.w = w;
    }
    if args.fingerprint_weight.is_some() || args.ast_weight.is_some() {
        run_config.weights = ScoreWeights {
            fingerprint: args.fingerprint_weight.unwrap_or(0.5),
            ast: args.ast_weight.unwrap_or(0.5),
        };
    }
    run_config.strict = args.strict;

    let (dataset_id, summary) = simcheck_core::ingest::ingest_directory(
        &db,
        &blobs,
        TEMP_OWNER_ID,
        &args.collection,
        &dataset_name,
        &args.root,
    )?;
    info!(
        "Dataset {}: {} submissions, {} files, {} skipped",
        dataset_id,
        format!("{}", summary.submissions).cyan(),
        format!("{}", summary.files).cyan(),
        format!("{}", summary.skipped).yellow(),
    );

    let engine = RunEngine::new(&db, &blobs);
    let run_id = engine.submit(dataset_id, &run_config)?;
    let reporter = CliReporter::new();
    let outcome = engine.execute(run_id, &reporter)?;

    println!();
    info!(
        "Tokens: {}, Fingerprint: {}, AST: {}, Report: {}",
        format!("{:.2}s", outcome.tokens_duration.as_secs_f64()).green(),
        format!("{:.2}s", outcome.fingerprint_duration.as_secs_f64()).green(),
        format!("{:.2}s", outcome.ast_duration.as_secs_f64()).green(),
        format!("{:.2}s", outcome.report_duration.as_secs_f64()).green(),
    );
    info!(
        "{} candidate pairs, {} compared, {} skipped, {} evidence rows",
        format!("{}", outcome.candidate_pairs).red(),
        format!("{}", outcome.pairs_compared).red(),
        format!("{}", outcome.pairs_skipped).yellow(),
        format!("{}", outcome.evidence_rows).cyan(),
    );
    if outcome.files_skipped > 0 {
        info!(
            "{} of {} files were skipped",
            format!("{}", outcome.files_skipped).yellow(),
            outcome.files_total,
        );
    }

    print_top_pairs(&db, run_id, args.top)?;

    if let Some(report) = db.get_run_report(run_id)? {
        if let Some(key) = report.csv_storage_key {
            info!("Report stored at {}", key.cyan());
        }
    }

    Ok(())
}

fn run_show(config: &AppConfig, args: ShowRunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open(&config.db_path)?;
    let run = db.get_run(args.run_id)?;

    println!(
        "Run {} — {} (stage {}, {}%)",
        run.id,
        run.status.as_str(),
        run.stage.as_str(),
        run.progress_pct
    );
    println!("  created:  {}", run.created_at);
    if let Some(started) = &run.started_at {
        println!("  started:  {}", started);
    }
    if let Some(finished) = &run.finished_at {
        println!("  finished: {}", finished);
    }
    if let Some(message) = &run.error_message {
        println!("  error:    {}", message.red());
    }

    if run.status == RunStatus::Done {
        print_top_pairs(&db, run.id, args.top)?;
    }

    Ok(())
}

fn print_top_pairs(
    db: &Database,
    run_id: i64,
    top: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows = db.get_pair_results_with_paths(run_id)?;
    if rows.is_empty() {
        println!("No scored pairs for run {}", run_id);
        return Ok(());
    }

    println!("Top pairs for run {}:", run_id);
    for row in rows.iter().take(top) {
        let score = format!("{:.3}", row.result.final_score);
        let colored_score = if row.result.final_score >= 0.8 {
            score.red()
        } else if row.result.final_score >= 0.5 {
            score.yellow()
        } else {
            score.normal()
        };
        println!(
            "  {}  (fp {:.3}, ast {:.3})  {} <-> {}",
            colored_score,
            row.result.fingerprint_score,
            row.result.ast_score,
            row.file_a,
            row.file_b
        );
    }
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
