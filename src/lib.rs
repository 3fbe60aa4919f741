//! cityquery
//!
//! Answers natural-language questions about a city by asking a language model
//! for an analysis script, running it against the supplied datasets and
//! repairing it until it yields rows or the retry budget runs out.

pub mod artifact;
pub mod binder;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod error;
pub mod llm;
pub mod prompts;
pub mod sandbox;
pub mod sanitizer;

pub use config::{LlmConfig, LoopConfig};
pub use controller::{ProgressEvent, RetryController, RunReport, RunStatus, TerminalState};
pub use dataset::{DatasetTable, Location, Manifest};
pub use error::{CityQueryError, Result};
