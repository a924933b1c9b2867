//! Streaming evaluation of an incremental learner on a CSV interaction
//! table, either test-then-train or with per-segment checkpoints and
//! holdouts.
extern crate clap;
extern crate serde;
extern crate serde_json;
extern crate streamrec;
extern crate tracing;
extern crate tracing_subscriber;
#[macro_use]
extern crate serde_derive;

#[macro_use]
mod common;

use std::error::Error;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tracing::info;

use streamrec::data::InteractionStore;
use streamrec::datasets::{load_csv, Columns};
use streamrec::evaluation::checkpoint::{evaluate_and_store, CheckpointConfig};
use streamrec::evaluation::prequential::{self, PrequentialConfig, PrequentialResult};
use streamrec::evaluation::{HoldoutRecord, ResultsMatrix};
use streamrec::models::DefaultUser;
use streamrec::IncrementalModel;

#[derive(Clone, Copy, Debug, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum Protocol {
    /// Score each interaction, then train on it.
    Prequential,
    /// Divert a sample of each segment into a holdout and snapshot the model.
    Checkpoint,
}

#[derive(Debug, Parser)]
#[command(about = "Evaluate a learner over a chronological interaction stream")]
struct Args {
    /// CSV file with a header row.
    input: PathBuf,

    #[arg(long, value_enum, default_value_t = Protocol::Prequential)]
    protocol: Protocol,

    /// User id column.
    #[arg(long, default_value = "user_id")]
    user_col: String,

    /// Item id column.
    #[arg(long, default_value = "item_id")]
    item_col: String,

    /// Timestamp column.
    #[arg(long, default_value = "timestamp")]
    time_col: String,

    #[arg(long, value_enum, default_value_t = common::ModelKind::Isgd)]
    model: common::ModelKind,

    /// JSON file with learner hyperparameters; missing fields keep their defaults.
    #[arg(long)]
    hyperparameters: Option<PathBuf>,

    /// Length of the scored recommendation lists.
    #[arg(long, default_value_t = 20)]
    top_n: usize,

    /// First stream position eligible for scoring.
    #[arg(long, default_value_t = 0)]
    start_eval: usize,

    /// Leading interactions that are only trained on.
    #[arg(long, default_value_t = 100)]
    warm_up: usize,

    /// Process at most this many interactions.
    #[arg(long)]
    count: Option<usize>,

    /// Score each eligible interaction with probability 1/N (prequential).
    #[arg(long, default_value_t = 1)]
    interleaved: usize,

    /// Do not score interactions with an item the user already knows (prequential).
    #[arg(long)]
    skip_known_items: bool,

    /// Record per-step timings (prequential).
    #[arg(long)]
    record_timings: bool,

    /// Number of segments, holdouts and checkpoints (checkpoint).
    #[arg(long, default_value_t = 20)]
    n_holdouts: usize,

    /// Probability of diverting an interaction into its segment's holdout (checkpoint).
    #[arg(long, default_value_t = 0.1)]
    holdout_probability: f64,

    /// Also score test-then-train while storing checkpoints (checkpoint).
    #[arg(long)]
    score_stream: bool,

    /// Cold-start policy: none, random, average or median.
    #[arg(long, default_value = "none")]
    default_user: DefaultUser,

    /// Keep already known items in recommendation lists.
    #[arg(long)]
    include_known_items: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the report here instead of standard output.
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct CheckpointReport {
    positions: Vec<usize>,
    holdout_sizes: Vec<usize>,
    results: ResultsMatrix,
    holdouts: Vec<HoldoutRecord>,
    prequential: Option<PrequentialResult>,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Prequential(PrequentialResult),
    Checkpoint(CheckpointReport),
}

#[derive(Serialize)]
struct Report {
    protocol: Protocol,
    model: common::ModelKind,
    hyperparameters: serde_json::Value,
    interactions: usize,
    elapsed_secs: f64,
    #[serde(flatten)]
    outcome: Outcome,
}

fn evaluate<M>(mut model: M, stream: &InteractionStore<String, String>, args: &Args) -> Result<Outcome, Box<dyn Error>>
where
    M: IncrementalModel<User = String, Item = String> + Clone + Sync,
{
    match args.protocol {
        Protocol::Prequential => {
            let mut config = PrequentialConfig::new()
                .top_n(args.top_n)
                .start_eval(args.start_eval)
                .warm_up(args.warm_up)
                .interleaved(args.interleaved)
                .skip_known_items(args.skip_known_items)
                .record_timings(args.record_timings)
                .exclude_known_items(!args.include_known_items)
                .default_user(args.default_user)
                .seed(args.seed);
            if let Some(count) = args.count {
                config = config.count(count);
            }

            let result = prequential::evaluate(&mut model, stream, &config, None)?;

            Ok(Outcome::Prequential(result))
        }
        Protocol::Checkpoint => {
            let mut config = CheckpointConfig::new()
                .n_holdouts(args.n_holdouts)
                .top_n(args.top_n)
                .start_eval(args.start_eval)
                .warm_up(args.warm_up)
                .holdout_probability(args.holdout_probability)
                .store_only(!args.score_stream)
                .exclude_known_items(!args.include_known_items)
                .default_user(args.default_user)
                .seed(args.seed);
            if let Some(count) = args.count {
                config = config.count(count);
            }

            let run = evaluate_and_store(&mut model, stream, &config, None)?;
            let (results, holdouts) = run.evaluate_holdouts(&config);

            Ok(Outcome::Checkpoint(CheckpointReport {
                positions: run.checkpoints.iter().map(|checkpoint| checkpoint.position()).collect(),
                holdout_sizes: run.holdouts.iter().map(|holdout| holdout.len()).collect(),
                results,
                holdouts,
                prequential: run.prequential,
            }))
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    common::init_logging();

    let args = Args::parse();

    let columns = Columns {
        user: args.user_col.clone(),
        item: args.item_col.clone(),
        time: args.time_col.clone(),
    };
    let stream = load_csv(&args.input, &columns)?.to_store();
    info!(interactions = stream.len(), path = %args.input.display(), "loaded interaction stream");

    let start = Instant::now();
    let path = args.hyperparameters.as_deref();
    let (hyperparameters, outcome) = with_model!(args.model, path, |model| evaluate(model, &stream, &args)?);

    let report = Report {
        protocol: args.protocol,
        model: args.model,
        hyperparameters,
        interactions: stream.len(),
        elapsed_secs: start.elapsed().as_secs_f64(),
        outcome,
    };

    common::write_report(args.output.as_deref(), &report)
}
