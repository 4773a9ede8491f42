use credit_net::NetworkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid YAML file: {0}")]
    InvalidYaml(#[from] serde_yml::Error),
    #[error("Invalid scenario. {0}")]
    InvalidScenario(String),
    #[error("Network error. {0}")]
    Network(#[from] NetworkError),
}

impl CliError {
    pub fn scenario(msg: impl Into<String>) -> Self {
        CliError::InvalidScenario(msg.into())
    }
}
