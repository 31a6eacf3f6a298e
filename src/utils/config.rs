use crate::recorder::sink::Fourcc;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CAPTURER_TYPE: &str = "default";

// without opencv the default sink writes raw motion-jpeg, not an avi container
#[cfg(feature = "opencv")]
pub const DEFAULT_FILE_EXTENSION: &str = ".avi";
#[cfg(not(feature = "opencv"))]
pub const DEFAULT_FILE_EXTENSION: &str = ".mjpeg";

/// How one source is encoded and cut into chunk files.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// 0 keeps a single chunk open until shutdown.
    pub chunk_length_sec: u32,
    /// Align chunk boundaries to multiples of the chunk length on the wall clock
    /// instead of counting written frames.
    pub uniform_chunks: bool,
    pub file_extension: String,
    pub fourcc: String,
    pub watermark: bool,
    pub use_localtime: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            fps: 10,
            width: 1024,
            height: 768,
            chunk_length_sec: 60,
            uniform_chunks: true,
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
            fourcc: "MJPG".to_string(),
            watermark: true,
            use_localtime: true,
        }
    }
}

impl OutputConfig {
    pub fn validate(&self, source: &str) -> Result<()> {
        if self.fps == 0 {
            bail!("{source}: output fps must be greater than zero");
        }
        if self.width == 0 || self.height == 0 {
            bail!("{source}: output size must be non-zero");
        }
        self.fourcc
            .parse::<Fourcc>()
            .with_context(|| format!("{source}: invalid codec"))?;
        if !self.file_extension.starts_with('.') {
            bail!("{source}: file extension must start with '.'");
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type", default = "default_capturer_type")]
    pub kind: String,
    pub uri: String,
    #[serde(default)]
    pub filter_k: u32,
    #[serde(default)]
    pub flip_x: bool,
    #[serde(default)]
    pub flip_y: bool,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_capturer_type() -> String {
    DEFAULT_CAPTURER_TYPE.to_string()
}

impl SourceConfig {
    pub fn new(name: &str, uri: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            kind: default_capturer_type(),
            uri: uri.to_string(),
            filter_k: 0,
            flip_x: false,
            flip_y: false,
            output: OutputConfig::default(),
        }
    }

    pub fn with_flip_x(mut self, flip: bool) -> SourceConfig {
        self.flip_x = flip;
        self
    }

    pub fn with_flip_y(mut self, flip: bool) -> SourceConfig {
        self.flip_y = flip;
        self
    }

    pub fn with_filter_k(mut self, k: u32) -> SourceConfig {
        self.filter_k = k;
        self
    }

    pub fn with_output(mut self, output: OutputConfig) -> SourceConfig {
        self.output = output;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("source name must not be empty");
        }
        if self.name.contains(['#', '/', '\\']) {
            bail!("source name {:?} must not contain '#', '/' or '\\'", self.name);
        }
        if self.uri.is_empty() {
            bail!("{}: stream uri must not be empty", self.name);
        }
        self.output.validate(&self.name)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub record_dir: PathBuf,
    /// 0 disables the retention scan.
    pub size_limit_mb: u64,
    pub check_interval_sec: u64,
    pub use_localtime: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            record_dir: PathBuf::from("./rec"),
            size_limit_mb: 8192,
            check_interval_sec: 10,
            use_localtime: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StatusConfig {
    pub listen: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    pub idle_sleep_ms: u64,
    pub tick_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            idle_sleep_ms: 10,
            tick_ms: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub status: Option<StatusConfig>,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl HubConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("no capturer defined, check the [[sources]] entries");
        }
        let mut names = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !names.insert(source.name.as_str()) {
                bail!("duplicate source name: {}", source.name);
            }
        }
        Ok(())
    }
}

pub struct Config {}

impl Config {
    pub fn new() -> Config {
        Config {}
    }

    pub fn read_config(&self, path: &Path) -> Result<HubConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: HubConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}
