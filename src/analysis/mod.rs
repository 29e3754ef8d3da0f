//! Analysis runs: the application contract and the driver that executes
//! an application against a dataset.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::output::OutputError;
use crate::timeseries::QueryError;

pub mod application;
pub mod driver;

pub use application::{
    field_spec, Application, ApplicationFactory, ApplicationRegistry, BatchApplication, ConfigDescriptor,
    ConfigType, DrivenApplication, InputDescriptor, OutputDescriptor, OutputFormat, Parameters, Points, Results,
};
pub use driver::{Analysis, AnalysisConfig, AnalysisDriver, AnalysisStatus};

// ---

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no application named {0}")]
    UnknownApplication(String),

    #[error("invalid configuration: {}", format_config_errors(.0))]
    InvalidConfig(BTreeMap<String, Vec<String>>),

    #[error("analysis is {0}, expected created")]
    InvalidState(AnalysisStatus),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("application failed: {0:#}")]
    Application(anyhow::Error),
}

fn format_config_errors(errors: &BTreeMap<String, Vec<String>>) -> String {
    errors
        .iter()
        .map(|(key, messages)| format!("{key}: {}", messages.join("; ")))
        .collect::<Vec<_>>()
        .join(", ")
}
