use thiserror::Error;

#[derive(Error, Debug)]
pub enum CityQueryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Binding error: {0}")]
    Binding(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, CityQueryError>;
