//! Bucket-based evaluation of an incremental learner on a CSV interaction
//! table.
//!
//! The table is cut into temporal buckets, frequent users contribute
//! holdouts, and the learner is scored against every holdout after each
//! bucket. The report is written as JSON.
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

use clap::Parser;
use tracing::info;

use streamrec::datasets::{load_csv, Columns};
use streamrec::evaluation::buckets::{train_evaluate, BucketConfig, BucketRun};
use streamrec::models::DefaultUser;
use streamrec::partition::{frequent_users, IntervalScheme, Partition, Partitioner};
use streamrec::IncrementalModel;

#[derive(Debug, Parser)]
#[command(about = "Train a learner bucket by bucket and score it against every holdout")]
struct Args {
    /// CSV file with a header row.
    input: PathBuf,

    /// User id column.
    #[arg(long, default_value = "user_id")]
    user_col: String,

    /// Item id column.
    #[arg(long, default_value = "item_id")]
    item_col: String,

    /// Timestamp column.
    #[arg(long, default_value = "timestamp")]
    time_col: String,

    /// Interval scheme: W (weeks), M (months), QS (date ranges) or F (row ranges).
    #[arg(long, default_value = "W")]
    interval_type: String,

    /// Explicit interval as START..END, repeatable; required for QS and F.
    #[arg(long = "interval")]
    intervals: Vec<String>,

    /// Minimum fraction of buckets a user must appear in to contribute holdouts.
    #[arg(long, default_value_t = 0.8)]
    frequency_threshold: f32,

    /// Leading buckets used for training only.
    #[arg(long, default_value_t = 1)]
    cold_start_buckets: usize,

    #[arg(long, value_enum, default_value_t = common::ModelKind::Isgd)]
    model: common::ModelKind,

    /// JSON file with learner hyperparameters; missing fields keep their defaults.
    #[arg(long)]
    hyperparameters: Option<PathBuf>,

    /// Length of the scored recommendation lists.
    #[arg(long, default_value_t = 20)]
    top_n: usize,

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
struct Report {
    model: common::ModelKind,
    hyperparameters: serde_json::Value,
    frequent_users: usize,
    bucket_sizes: Vec<usize>,
    holdout_sizes: Vec<usize>,
    #[serde(flatten)]
    run: BucketRun,
}

fn parse_intervals(intervals: &[String]) -> Result<Vec<(String, String)>, Box<dyn Error>> {
    intervals
        .iter()
        .map(|interval| match interval.split_once("..") {
            Some((start, end)) => Ok((start.trim().to_owned(), end.trim().to_owned())),
            None => Err(format!("interval `{}` is not of the form START..END", interval).into()),
        })
        .collect()
}

fn evaluate<M>(mut model: M, partition: &Partition<String, String>, config: &BucketConfig) -> Result<BucketRun, Box<dyn Error>>
where
    M: IncrementalModel<User = String, Item = String> + Sync,
{
    Ok(train_evaluate(&mut model, &partition.buckets, &partition.holdouts, config, None)?)
}

fn main() -> Result<(), Box<dyn Error>> {
    common::init_logging();

    let args = Args::parse();

    let columns = Columns {
        user: args.user_col.clone(),
        item: args.item_col.clone(),
        time: args.time_col.clone(),
    };
    let log = load_csv(&args.input, &columns)?;
    info!(rows = log.len(), path = %args.input.display(), "loaded interaction table");

    let scheme = IntervalScheme::from_code(&args.interval_type, &parse_intervals(&args.intervals)?)?;
    let frequent = frequent_users(&log, &scheme, args.frequency_threshold)?;
    info!(frequent_users = frequent.len(), "selected frequent users");

    let partition = Partitioner::new(scheme)
        .cold_start_buckets(args.cold_start_buckets)
        .partition(&log, &frequent)?;

    let config = BucketConfig::new()
        .top_n(args.top_n)
        .exclude_known_items(!args.include_known_items)
        .default_user(args.default_user)
        .seed(args.seed);

    let path = args.hyperparameters.as_deref();
    let (hyperparameters, run) = with_model!(args.model, path, |model| evaluate(model, &partition, &config)?);

    let report = Report {
        model: args.model,
        hyperparameters,
        frequent_users: frequent.len(),
        bucket_sizes: partition.buckets.iter().map(|bucket| bucket.len()).collect(),
        holdout_sizes: partition.holdouts.iter().map(|holdout| holdout.len()).collect(),
        run,
    };

    common::write_report(args.output.as_deref(), &report)
}
