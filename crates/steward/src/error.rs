/// Errors surfaced by the Steward pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StewardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("task store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("backend error: {0}")]
    Backend(#[from] backend::BackendError),
}
