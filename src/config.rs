use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that points at an alternative config file
pub const CONFIG_ENV_VAR: &str = "REALESR_RUNNER_CONFIG";

/// Published weights for the compact anime/video Real-ESRGAN model
pub const DEFAULT_MODEL_URL: &str =
    "https://github.com/xinntao/Real-ESRGAN/releases/download/v0.2.5.0/realesr-animevideov3.pth";

/// File name the weights are stored under
pub const DEFAULT_MODEL_FILE: &str = "realesr-animevideov3.pth";

/// Top-level configuration shared by both binaries
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Dependency check settings
    pub environment: EnvironmentConfig,
    /// Model location and architecture
    pub model: ModelConfig,
    /// Diagnostic logging
    pub telemetry: TelemetryConfig,
}

/// One `{package_name: version_constraint}` entry
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Distribution name as published
    pub name: String,
    /// Version specifier, e.g. `>=1.7.0`
    pub version: String,
}

impl Requirement {
    /// Builds a requirement from a name and specifier
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
/// Settings for `check-environment`
pub struct EnvironmentConfig {
    /// Interpreter whose installed packages are inspected
    pub interpreter: String,
    /// Packages that must be importable, checked in order
    pub requirements: Vec<Requirement>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_owned(),
            requirements: default_requirements(),
        }
    }
}

/// The eight packages the Real-ESRGAN toolchain needs
#[must_use]
pub fn default_requirements() -> Vec<Requirement> {
    [
        ("torch", ">=1.7.0"),
        ("basicsr", ">=1.4.2"),
        ("facexlib", ">=0.2.5"),
        ("gfpgan", ">=1.3.5"),
        ("numpy", ">=1.23.5"),
        ("opencv-python", ">=4.6.0"),
        ("Pillow", ">=9.3.0"),
        ("realesrgan", ">=0.3.0"),
    ]
    .into_iter()
    .map(|(name, version)| Requirement::new(name, version))
    .collect()
}

/// Where the weights come from and how the network is shaped
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Download URL used when the weights file is absent
    pub url: String,
    /// Weights file name inside `dir`
    pub file_name: String,
    /// Weights directory; `None` means the directory of the running executable
    pub dir: Option<String>,
    /// Run inference in half precision where the device supports it
    pub half: bool,
    /// Architecture hyperparameters
    pub network: NetworkConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_MODEL_URL.to_owned(),
            file_name: DEFAULT_MODEL_FILE.to_owned(),
            dir: None,
            half: true,
            network: NetworkConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Resolves the local weights path
    ///
    /// # Errors
    /// Returns error if `~` cannot be expanded or the executable location is unknown
    pub fn weights_path(&self) -> Result<PathBuf> {
        let dir = match &self.dir {
            Some(dir) => Config::expand_path(dir)?,
            None => executable_dir()?,
        };
        Ok(dir.join(&self.file_name))
    }
}

/// Hyperparameters of the compact VGG-style super-resolution network
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Input channels
    pub num_in_ch: usize,
    /// Output channels
    pub num_out_ch: usize,
    /// Feature channels of every hidden convolution
    pub num_feat: usize,
    /// Number of hidden convolutions
    pub num_conv: usize,
    /// Internal upscale factor baked into the weights
    pub upscale: usize,
    /// Activation name: `prelu`, `relu` or `leakyrelu`
    pub act_type: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 64,
            num_conv: 16,
            upscale: 4,
            act_type: "prelu".to_owned(),
        }
    }
}

/// Diagnostic log destination
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Write logs to `log_path` instead of stderr
    pub enabled: bool,
    /// Log file, `~` is expanded
    pub log_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_path: "~/.realesr-runner/runner.log".to_owned(),
        }
    }
}

impl Config {
    /// Load config from `$REALESR_RUNNER_CONFIG` or `~/.realesr-runner.toml`,
    /// falling back to built-in defaults when neither exists
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path(
            std::env::var(CONFIG_ENV_VAR).ok(),
            std::env::var("HOME").ok(),
        )?;

        match config_path {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse a config file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not valid TOML
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents).context("failed to parse config TOML")?;

        Ok(config)
    }

    /// An explicit override wins; without one and without a home directory
    /// there is no config file to look for
    fn config_path(explicit: Option<String>, home: Option<String>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            return Self::expand_path(&path).map(Some);
        }
        Ok(home.map(|home| PathBuf::from(home).join(".realesr-runner.toml")))
    }

    /// Expand ~ in paths to home directory
    ///
    /// # Errors
    /// Returns error if the path starts with `~/` and `HOME` is unset
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

/// Directory containing the running executable
///
/// # Errors
/// Returns error if the executable path cannot be determined
pub fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("failed to locate running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable path has no parent directory")
}
