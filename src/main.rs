// The batch-scoring orchestrator. Its sole responsibility is to wire the
// library's pipeline together for offline use: load the fitted artifacts,
// read one CSV dataset, run the full ensemble over every row, and write
// the scored rows next to the input. The serving surface for interactive
// callers lives in the library's service module; this binary exists for
// scoring files without standing up a transport.

use clap::Parser;
use polars::prelude::*;
use premia::artifact::ArtifactSet;
use premia::assemble::RepairPolicy;
use premia::ensemble::EnsembleDispatcher;
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(
    name = "premia",
    version,
    about = "An inference engine for insurance risk model serving."
)]
struct Args {
    /// Directory holding the fitted models, encoder, scaler and schema
    /// contracts.
    artifacts_dir: PathBuf,

    /// CSV dataset to score.
    input: PathBuf,

    /// Output path for the scored rows. Defaults to the input path with
    /// a `.predictions.csv` suffix.
    #[clap(long)]
    out: Option<PathBuf>,

    /// Maximum feature-width drift the claim pipeline repairs before
    /// failing closed. Unlimited when omitted.
    #[clap(long)]
    repair_tolerance: Option<usize>,
}

fn main() {
    env_logger::init();
    let start_time = Instant::now();
    let args = Args::parse();

    // --- Phase 1: Load the fitted artifacts ---
    eprintln!("> Loading artifacts from {}", args.artifacts_dir.display());
    let artifacts = match ArtifactSet::load(&args.artifacts_dir) {
        Ok(artifacts) => artifacts,
        Err(e) => {
            eprintln!("Fatal error loading artifacts: {e}");
            process::exit(1);
        }
    };
    let policy = match args.repair_tolerance {
        Some(columns) => RepairPolicy::with_tolerance(columns),
        None => RepairPolicy::lenient(),
    };
    let dispatcher = EnsembleDispatcher::new(artifacts, policy);

    // --- Phase 2: Read the dataset ---
    eprintln!("> Reading dataset {}", args.input.display());
    let df = match read_csv(&args.input) {
        Ok(df) => df,
        Err(e) => {
            eprintln!("Fatal error reading '{}': {e}", args.input.display());
            process::exit(1);
        }
    };
    eprintln!("> {} rows, {} columns", df.height(), df.width());

    // --- Phase 3: Score every row ---
    let rows = match dispatcher.predict(&df) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Fatal error during prediction: {e}");
            process::exit(1);
        }
    };

    // --- Phase 4: Write the scored rows ---
    let out_path = args
        .out
        .unwrap_or_else(|| args.input.with_extension("predictions.csv"));
    if let Err(e) = write_predictions(&out_path, &rows) {
        eprintln!("Fatal error writing '{}': {e}", out_path.display());
        process::exit(1);
    }

    eprintln!(
        "> Scored {} rows in {:.2?} -> {}",
        rows.len(),
        start_time.elapsed(),
        out_path.display()
    );
}

fn read_csv(path: &PathBuf) -> PolarsResult<DataFrame> {
    CsvReadOptions::default()
        .with_infer_schema_length(Some(1000))
        .with_has_header(true)
        .into_reader_with_file_handle(File::open(path)?)
        .finish()
}

fn write_predictions(
    path: &PathBuf,
    rows: &[premia::ensemble::PredictionRow],
) -> PolarsResult<()> {
    let record_ids: Vec<Option<i64>> = rows.iter().map(|r| r.record_id).collect();
    let cover_ids: Vec<Option<i64>> = rows.iter().map(|r| r.underwritten_cover_id).collect();
    let policy_ids: Vec<Option<i64>> = rows.iter().map(|r| r.policy_id).collect();
    let months: Vec<Option<String>> = rows.iter().map(|r| r.transaction_month.clone()).collect();
    let probabilities: Vec<f64> = rows.iter().map(|r| r.claim_probability).collect();
    let classes: Vec<u32> = rows.iter().map(|r| u32::from(r.claim_class)).collect();
    let severities: Vec<f64> = rows.iter().map(|r| r.claim_severity).collect();
    let premiums: Vec<f64> = rows.iter().map(|r| r.premium_prediction).collect();

    let mut df = DataFrame::new(vec![
        Column::new("RecordID".into(), record_ids),
        Column::new("UnderwrittenCoverID".into(), cover_ids),
        Column::new("PolicyID".into(), policy_ids),
        Column::new("TransactionMonth".into(), months),
        Column::new("ClaimProbability".into(), probabilities),
        Column::new("ClaimClass".into(), classes),
        Column::new("ClaimSeverity".into(), severities),
        Column::new("PremiumPrediction".into(), premiums),
    ])?;
    let file = File::create(path)?;
    CsvWriter::new(file).finish(&mut df)?;
    Ok(())
}
