use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot read config file {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("missing option {0:?}")]
    Missing(&'static str),

    #[error("bad value for {key}: {message}")]
    Value { key: &'static str, message: String },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Top level of the simulator configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llc: CacheRef,
    pub dram: Dram,
    #[serde(default)]
    pub hermes: Hermes,
    pub cores: Vec<Core>,
}

impl Config {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let config: Self = read_json(path)?;
        if config.cores.is_empty() {
            return Err(Error::Missing("cores"));
        }
        Ok(config)
    }
}

/// Points at a per-cache configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRef {
    pub config: PathBuf,
    /// L1D only: prefetch throttling PSEL.
    #[serde(default)]
    pub psel_bits: Option<u8>,
    #[serde(default)]
    pub psel_threshold: Option<u64>,
}

impl CacheRef {
    pub fn load(&self) -> Result<CacheFile, Error> {
        let cache = read_json::<CacheFile>(&self.config)?;
        cache.validate()?;
        Ok(cache)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dram {
    pub memory_trace_directory: PathBuf,
    #[serde(default = "defaults::dram_channels")]
    pub channels: usize,
    #[serde(default = "defaults::dram_latency")]
    pub latency: u64,
    #[serde(default = "defaults::dram_pages")]
    pub pages: u64,
    #[serde(default = "defaults::page_table_latency")]
    pub page_table_latency: u64,
    #[serde(default = "defaults::swap_latency")]
    pub swap_latency: u64,
    #[serde(default = "defaults::dram_queue_size")]
    pub read_queue_size: usize,
    #[serde(default = "defaults::dram_queue_size")]
    pub write_queue_size: usize,
    #[serde(default = "defaults::dram_queue_size")]
    pub prefetch_queue_size: usize,
}

/// Knobs of the off-chip prediction fast path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hermes {
    #[serde(default)]
    pub ddrp_request_latency: u64,
    /// Issue a parallel DRAM probe on a high-confidence off-chip prediction.
    #[serde(default)]
    pub enable_fsp: bool,
    /// Gate the probe at the L1D boundary instead of the core boundary.
    #[serde(default)]
    pub enable_delayed_fsp: bool,
    /// Use both thresholds: core probes above tau_2, L1D probes above tau_1.
    #[serde(default)]
    pub enable_bimodal_fsp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Core {
    pub l1d: CacheRef,
    pub l1i: CacheRef,
    pub l2c: CacheRef,
    pub sdc: Sdc,
    pub irregular_predictor: IrregularPredictor,
    pub metadata_cache: MetadataCache,
    pub popular_level_detector: PopularLevelDetector,
    pub offchip_pred: OffchipPred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sdc {
    pub config: PathBuf,
    #[serde(default)]
    pub enabled: bool,
}

impl Sdc {
    pub fn load(&self) -> Result<CacheFile, Error> {
        let cache = read_json::<CacheFile>(&self.config)?;
        cache.validate()?;
        Ok(cache)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrregularPredictor {
    pub stride_threshold: u64,
    pub sets: u32,
    pub ways: u32,
    pub stride_bits: u8,
    pub psel_bits: u8,
    pub latency: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCache {
    pub sets: u64,
    pub ways: u64,
    pub pc_predictor: PcPredictor,
    pub miss_rate_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcPredictor {
    pub counters_bits: u8,
    pub size: usize,
    pub threshold: i32,
    pub high_conf_threshold: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopularLevelDetector {
    pub threshold_1: u64,
    pub threshold_2: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffchipPred {
    pub prefetch: PrefetchPerceptron,
    pub demand: DemandPerceptron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchPerceptron {
    pub threshold: f32,
    pub features: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandPerceptron {
    pub tau_1: f32,
    pub tau_2: f32,
    pub features: Vec<u32>,
}

/// One cache configuration file: plugin bindings plus geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFile {
    /// Prefetcher plugin path or name; only the stem is significant.
    pub prefetcher: PathBuf,
    /// Replacement plugin path or name; only the stem is significant.
    pub replacement: PathBuf,

    pub sets: usize,
    pub ways: usize,
    pub block_size: u32,
    pub mshr_size: usize,
    pub read_queue_size: usize,
    pub write_queue_size: usize,
    pub prefetch_queue_size: usize,
    pub hit_latency: u64,
    pub fill_latency: u64,

    /// Sectored caches: bytes covered by one valid/dirty bit.
    #[serde(default = "defaults::word_granularity")]
    pub word_granularity: u32,

    #[serde(default = "defaults::issue_width")]
    pub read_width: usize,
    #[serde(default = "defaults::issue_width")]
    pub write_width: usize,
    #[serde(default = "defaults::issue_width")]
    pub fill_width: usize,

    /// First-level caches with alternative fill paths.
    #[serde(default)]
    pub routing: Option<Routing>,

    /// Reuse tracker report sink and distance limit.
    #[serde(default)]
    pub report_file: Option<PathBuf>,
    #[serde(default = "defaults::reuse_distance_limit")]
    pub reuse_distance_limit: usize,

    /// Plugin-specific knobs, decoded by the plugin itself.
    #[serde(default)]
    pub prefetcher_config: serde_json::Value,
    #[serde(default)]
    pub replacement_config: serde_json::Value,
}

impl CacheFile {
    pub fn validate(&self) -> Result<(), Error> {
        let power_of_two = [
            ("sets", self.sets as u64),
            ("block_size", u64::from(self.block_size)),
            ("word_granularity", u64::from(self.word_granularity)),
        ];
        for (key, value) in power_of_two {
            if value == 0 || !value.is_power_of_two() {
                return Err(Error::Value {
                    key,
                    message: format!("{value} is not a power of two"),
                });
            }
        }
        if self.ways == 0 {
            return Err(Error::Value {
                key: "ways",
                message: "zero associativity".into(),
            });
        }
        if self.mshr_size == 0 {
            return Err(Error::Value {
                key: "mshr_size",
                message: "zero MSHRs".into(),
            });
        }
        if u64::from(self.block_size) % u64::from(self.word_granularity) != 0 {
            return Err(Error::Value {
                key: "word_granularity",
                message: "does not divide block_size".into(),
            });
        }
        Ok(())
    }

    /// Name of the bound prefetcher plugin.
    #[must_use]
    pub fn prefetcher_name(&self) -> String {
        plugin_stem(&self.prefetcher)
    }

    /// Name of the bound replacement plugin.
    #[must_use]
    pub fn replacement_name(&self) -> String {
        plugin_stem(&self.replacement)
    }
}

/// Routing-engine knobs for caches that sniff alternative fill paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routing {
    pub sniffing_periodicity: u64,
    pub histories_length: u64,
    pub flush_periods: u64,
}

/// `plugins/prefetchers/l1d_ip_stride.so` and plain `l1d_ip_stride`
/// resolve to the same registry key.
fn plugin_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

mod defaults {
    pub fn dram_channels() -> usize {
        1
    }
    pub fn dram_latency() -> u64 {
        200
    }
    pub fn dram_pages() -> u64 {
        1 << 18
    }
    pub fn page_table_latency() -> u64 {
        100
    }
    pub fn swap_latency() -> u64 {
        1000
    }
    pub fn dram_queue_size() -> usize {
        64
    }
    pub fn word_granularity() -> u32 {
        8
    }
    pub fn issue_width() -> usize {
        4
    }
    pub fn reuse_distance_limit() -> usize {
        512
    }
}

#[cfg(test)]
mod tests {
    use super::CacheFile;

    fn base() -> CacheFile {
        serde_json::from_value(serde_json::json!({
            "prefetcher": "plugins/prefetchers/l1d_no.so",
            "replacement": "l1d_lru",
            "sets": 64,
            "ways": 8,
            "block_size": 64,
            "mshr_size": 8,
            "read_queue_size": 16,
            "write_queue_size": 16,
            "prefetch_queue_size": 8,
            "hit_latency": 4,
            "fill_latency": 2,
        }))
        .unwrap()
    }

    #[test]
    fn plugin_names_take_the_stem() {
        let cache = base();
        assert_eq!(cache.prefetcher_name(), "l1d_no");
        assert_eq!(cache.replacement_name(), "l1d_lru");
    }

    #[test]
    fn rejects_non_power_of_two_sets() {
        let mut cache = base();
        cache.sets = 48;
        assert!(cache.validate().is_err());
    }

    #[test]
    fn rejects_granularity_not_dividing_block() {
        let mut cache = base();
        cache.word_granularity = 48;
        assert!(cache.validate().is_err());
    }
}
