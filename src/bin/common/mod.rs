//! Pieces shared by the evaluation drivers.
use std::error::Error;
use std::fs::File;
use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Learner selected on the command line.
#[derive(Clone, Copy, Debug, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Isgd,
    Rsisgd,
    Bprmf,
    UserKnn,
}

/// Log to standard error, filtered by `RUST_LOG` and defaulting to `info`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
}

/// Hyperparameters from a JSON file, or the defaults.
pub fn read_hyperparameters<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T, Box<dyn Error>> {
    match path {
        Some(path) => Ok(serde_json::from_reader(File::open(path)?)?),
        None => Ok(T::default()),
    }
}

/// Pretty-print `report` as JSON to `path`, or to standard output.
pub fn write_report<T: Serialize>(path: Option<&Path>, report: &T) -> Result<(), Box<dyn Error>> {
    match path {
        Some(path) => serde_json::to_writer_pretty(File::create(path)?, report)?,
        None => serde_json::to_writer_pretty(io::stdout(), report)?,
    }

    Ok(())
}

/// Build the learner named by `$kind` from the hyperparameters at `$path`,
/// bind it to `$model` and evaluate `$body`.
///
/// Yields the hyperparameters as JSON together with the value of `$body`.
macro_rules! with_model {
    ($kind:expr, $path:expr, |$model:ident| $body:expr) => {
        match $kind {
            common::ModelKind::Isgd => with_model!(@build streamrec::models::isgd::Hyperparameters, $path, $model, $body),
            common::ModelKind::Rsisgd => with_model!(@build streamrec::models::rsisgd::Hyperparameters, $path, $model, $body),
            common::ModelKind::Bprmf => with_model!(@build streamrec::models::bprmf::Hyperparameters, $path, $model, $body),
            common::ModelKind::UserKnn => with_model!(@build streamrec::models::user_knn::Hyperparameters, $path, $model, $body),
        }
    };
    (@build $hyper:ty, $path:expr, $model:ident, $body:expr) => {{
        let hyper: $hyper = common::read_hyperparameters($path)?;
        let hyperparameters = serde_json::to_value(&hyper)?;
        let $model = hyper.build(streamrec::data::InteractionStore::empty());

        (hyperparameters, $body)
    }};
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use streamrec::IncrementalModel;

    use crate::common;

    fn train_once<M: IncrementalModel<User = String, Item = String>>(mut model: M) -> usize {
        model.incr_train("alice".to_owned(), "book".to_owned());
        model.data().len()
    }

    fn build(kind: common::ModelKind) -> Result<(serde_json::Value, usize), Box<dyn Error>> {
        Ok(with_model!(kind, None, |model| train_once(model)))
    }

    #[test]
    fn every_model_kind_builds_with_defaults() {
        let (hyperparameters, trained) = build(common::ModelKind::UserKnn).unwrap();
        assert_eq!(hyperparameters["k"], 10);
        assert_eq!(trained, 1);

        for kind in [common::ModelKind::Isgd, common::ModelKind::Rsisgd, common::ModelKind::Bprmf] {
            let (hyperparameters, trained) = build(kind).unwrap();
            assert!(hyperparameters.is_object());
            assert_eq!(trained, 1);
        }
    }
}
