use crate::config::GlobalOptions;
use crate::error::CliError;
use credit_net::DEFAULT_MAX_PATHS;
use libcredit::ProtocolConfig;
use log::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a simulation runs with: the protocol timeouts of every node and the knobs of the local network.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub protocol: ProtocolConfig,
    /// Candidate paths handed to a payment per request.
    pub max_paths: usize,
    /// How long to wait for every participant to finish after the last step, in milliseconds.
    pub settle_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings { protocol: ProtocolConfig::default(), max_paths: DEFAULT_MAX_PATHS, settle_timeout_ms: 30_000 }
    }
}

impl Settings {
    pub fn try_load<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let settings = serde_yml::from_reader(reader)?;
        Ok(settings)
    }

    /// Loads the settings file, falling back to the defaults when there is none.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, CliError> {
        match Settings::try_load(&path) {
            Ok(settings) => Ok(settings),
            Err(CliError::IoError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}, using the defaults", path.as_ref().display());
                Ok(Settings::default())
            }
            Err(err) => Err(err),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CliError> {
        // Create directory path if required
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_yml::to_writer(writer, self)?;
        Ok(())
    }

    /// Command-line flags win over the file.
    pub fn with_overrides(mut self, options: &GlobalOptions) -> Self {
        if let Some(lag) = options.message_lag_ms {
            self.protocol.message_transfer_lag_ms = lag;
        }
        if let Some(max_paths) = options.max_paths {
            self.max_paths = max_paths;
        }
        self
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

pub fn default_config_path() -> PathBuf {
    let mut home = std::env::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.push(".credit");
    home.push("config.yml");
    home
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yml");
        let mut settings = Settings::default();
        settings.protocol.message_transfer_lag_ms = 200;
        settings.max_paths = 2;
        settings.save(&path).unwrap();
        assert_eq!(Settings::try_load(&path).unwrap(), settings);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_or_default(dir.path().join("absent.yml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_files_keep_the_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "max_paths: 3\nprotocol:\n  max_path_length: 4\n").unwrap();
        let settings = Settings::try_load(&path).unwrap();
        assert_eq!(settings.max_paths, 3);
        assert_eq!(settings.protocol.max_path_length, 4);
        assert_eq!(settings.protocol.message_transfer_lag_ms, ProtocolConfig::default().message_transfer_lag_ms);
        assert_eq!(settings.settle_timeout_ms, 30_000);
    }

    #[test]
    fn flags_override_the_file() {
        let options = GlobalOptions { config_file: None, message_lag_ms: Some(10), max_paths: None };
        let settings = Settings::default().with_overrides(&options);
        assert_eq!(settings.protocol.message_transfer_lag_ms, 10);
        assert_eq!(settings.max_paths, DEFAULT_MAX_PATHS);
    }
}
