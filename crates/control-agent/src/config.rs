//! Agent configuration

use anyhow::{Context, Result};
use control_lib::{EstimatorConfig, LoopConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent settings, layered from an optional file and `CONTROL_*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Name attached to structured log events
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Serve health and metrics on this port when set
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Control period in milliseconds; 0 runs iterations back to back
    #[serde(default)]
    pub period_ms: u64,

    /// Read the latent state after every postdiction
    #[serde(default)]
    pub fetch_state: bool,

    #[serde(default = "default_true")]
    pub log_postdiction: bool,

    #[serde(default = "default_record_buffer")]
    pub record_buffer: usize,

    /// Recorded postures (JSON list of joint vectors) replayed as observations;
    /// a zero posture is used when unset
    #[serde(default)]
    pub posture_file: Option<PathBuf>,

    /// Where to write experiment data after a simulation
    #[serde(default)]
    pub save_path: Option<PathBuf>,

    /// Interactive training rounds; 0 trains in the background with the
    /// model's own epoch count
    #[serde(default)]
    pub training_rounds: usize,

    #[serde(default = "default_epochs_per_round")]
    pub epochs_per_round: usize,

    #[serde(default)]
    pub primitive_id: u32,

    #[serde(default = "default_win_size")]
    pub win_size: usize,

    #[serde(default = "default_weights")]
    pub weights: Vec<f32>,

    #[serde(default = "default_exp_time")]
    pub exp_time: usize,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_alpha")]
    pub alpha: f32,

    #[serde(default = "default_beta1")]
    pub beta1: f32,

    #[serde(default = "default_beta2")]
    pub beta2: f32,

    #[serde(default)]
    pub store_states: bool,

    #[serde(default)]
    pub store_er: bool,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "control-agent".to_string())
}

fn default_true() -> bool {
    true
}

fn default_record_buffer() -> usize {
    1024
}

fn default_epochs_per_round() -> usize {
    100
}

fn default_win_size() -> usize {
    15
}

fn default_weights() -> Vec<f32> {
    vec![0.025, 0.025]
}

fn default_exp_time() -> usize {
    15
}

fn default_epochs() -> usize {
    15
}

fn default_alpha() -> f32 {
    0.1
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

impl Settings {
    /// Load settings from an optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CONTROL")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("weights"),
        );

        let config = builder.build().context("Failed to read configuration")?;
        config
            .try_deserialize()
            .context("Invalid configuration values")
    }

    pub fn estimator(&self) -> EstimatorConfig {
        EstimatorConfig {
            primitive_id: self.primitive_id,
            win_size: self.win_size,
            weights: self.weights.clone(),
            exp_time: self.exp_time,
            epochs: self.epochs,
            alpha: self.alpha,
            beta1: self.beta1,
            beta2: self.beta2,
            store_states: self.store_states,
            store_er: self.store_er,
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            estimator: self.estimator(),
            period: Duration::from_millis(self.period_ms),
            fetch_state: self.fetch_state,
            log_postdiction: self.log_postdiction,
            record_buffer: self.record_buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_demo_experiment() {
        let settings = Settings::load(None).unwrap();
        let estimator = settings.estimator();

        assert_eq!(estimator, EstimatorConfig::default());
        assert_eq!(settings.period_ms, 0);
        assert_eq!(settings.training_rounds, 0);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "period_ms = 10\nwin_size = 5\nweights = [0.5, 0.25, 0.125]\nfetch_state = true"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        let config = settings.loop_config();

        assert_eq!(config.period, Duration::from_millis(10));
        assert_eq!(config.estimator.win_size, 5);
        assert_eq!(config.estimator.weights, vec![0.5, 0.25, 0.125]);
        assert!(config.fetch_state);
        assert_eq!(config.estimator.exp_time, 15);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/control.toml"))).is_err());
    }
}
