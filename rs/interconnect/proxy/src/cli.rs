use crate::config::Config;
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use thiserror::Error;

/// This struct is used to provide a command line interface to the proxy.
#[derive(Parser)]
#[command(version, about = "Interconnect proxy daemon")]
pub struct Cli {
    /// This field contains the path to the config file.
    #[arg(short, long)]
    pub config: PathBuf,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("An error occurred while reading the config file: {0}")]
    Io(std::io::Error),
    #[error("An error occurred while deserializing the provided configuration: {0}")]
    Deserialize(String),
}

impl Cli {
    /// Loads the config from the provided `config` argument.
    pub fn get_config(&self) -> Result<Config, CliError> {
        let file = File::open(&self.config).map_err(CliError::Io)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|err| CliError::Deserialize(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"content_id": 1, "dbid": 3, "host_port": 6000,
                "proxy_addresses": "0:2:localhost:4000,1:3:localhost:4001"}}"#
        )
        .unwrap();
        let cli = Cli {
            config: file.path().to_path_buf(),
        };
        let config = cli.get_config().unwrap();
        assert_eq!(config.content_id, 1);
        assert_eq!(config.proxy_addresses, "0:2:localhost:4000,1:3:localhost:4001");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let cli = Cli {
            config: PathBuf::from("/nonexistent/motion-proxy.json"),
        };
        assert!(matches!(cli.get_config(), Err(CliError::Io(_))));
    }
}
