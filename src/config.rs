use crate::metadata::{is_header_token, merge_layers, MetaValue, Metadata};
use crate::naming::{
    FilenamePattern, COMPACT_UPLOAD_PATTERN, PRESET_HOST, PRESET_PID_HOST_PORT,
};
use crate::DrainError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const MAX_ITEM_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const FINISH_DRAIN: &str = "FINISH_DRAIN";
pub const DRAINME: &str = "DRAINME";
pub const PACK_LOCK: &str = "PACK.lock";

const DEFAULT_S3_ENDPOINT: &str = "https://s3.us.archive.org";
const DEFAULT_DOWNLOAD_BASE: &str = "https://archive.org/download";
const DEFAULT_DETAILS_BASE: &str = "https://archive.org/details";
const LEGACY_METADATA: [&str; 5] = ["creator", "sponsor", "contributor", "operator", "scanningcenter"];

static CRAWLJOB_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-_a-zA-Z0-9]+$").expect("static regex"));
static SIZE_WITH_UNIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9.]+)([a-zA-Z])$").expect("static regex"));

/// `max_size`: a bare integer counts gigabytes, a string carries its own unit.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Gigabytes(u64),
    Text(String),
}

/// `WARC_naming`: preset number or literal pattern.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NamingSpec {
    Preset(u8),
    Pattern(String),
}

/// YAML flags show up both as booleans and as 0/1.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    pub fn is_on(self) -> bool {
        match self {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
        }
    }
}

impl Default for Flag {
    fn default() -> Self {
        Flag::Bool(false)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Collections {
    List(Vec<String>),
    Joined(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Retry with `-1`, `-2`, ... until an unused item name turns up.
    Suffix,
    Abort,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DrainConfig {
    #[serde(skip)]
    pub source_path: Option<PathBuf>,

    pub crawljob: String,
    pub job_dir: PathBuf,
    pub xfer_dir: PathBuf,
    /// Read by the external scheduler between stage runs.
    #[serde(default)]
    pub sleep_time: Option<u64>,
    #[serde(default = "default_max_size")]
    pub max_size: SizeSpec,
    #[serde(rename = "WARC_naming", default = "default_naming")]
    pub warc_naming: NamingSpec,
    #[serde(default)]
    pub item_naming: Option<String>,
    #[serde(default)]
    pub compact_names: Flag,
    #[serde(default = "default_on")]
    pub verify_gzip: Flag,
    #[serde(default)]
    pub on_collision: Option<CollisionPolicy>,

    #[serde(default = "default_block_delay")]
    pub block_delay: u64,
    #[serde(default = "default_max_block_count")]
    pub max_block_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default)]
    pub derive: Flag,

    #[serde(default)]
    pub title_prefix: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub collections: Option<Collections>,
    #[serde(default)]
    pub creator: Option<serde_yaml::Value>,
    #[serde(default)]
    pub sponsor: Option<serde_yaml::Value>,
    #[serde(default)]
    pub contributor: Option<serde_yaml::Value>,
    #[serde(default)]
    pub operator: Option<serde_yaml::Value>,
    #[serde(default)]
    pub scanningcenter: Option<serde_yaml::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_yaml::Value>,

    #[serde(default = "default_s3_endpoint")]
    pub s3_endpoint: String,
    #[serde(default = "default_download_base")]
    pub download_base: String,
    #[serde(default = "default_details_base")]
    pub details_base: String,
}

fn default_max_size() -> SizeSpec {
    SizeSpec::Gigabytes(10)
}
fn default_naming() -> NamingSpec {
    NamingSpec::Preset(1)
}
fn default_on() -> Flag {
    Flag::Bool(true)
}
fn default_block_delay() -> u64 {
    120
}
fn default_max_block_count() -> u32 {
    120
}
fn default_retry_delay() -> u64 {
    2400
}
fn default_s3_endpoint() -> String {
    DEFAULT_S3_ENDPOINT.to_string()
}
fn default_download_base() -> String {
    DEFAULT_DOWNLOAD_BASE.to_string()
}
fn default_details_base() -> String {
    DEFAULT_DETAILS_BASE.to_string()
}

impl DrainConfig {
    /// Load from a YAML file. Relative directories resolve against the
    /// directory holding the file.
    pub fn load(path: &Path) -> Result<Self, DrainError> {
        let text = fs::read_to_string(path).map_err(|e| {
            DrainError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut config = Self::from_yaml_str(&text, base)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_yaml_str(text: &str, base_dir: &Path) -> Result<Self, DrainError> {
        let mut config: DrainConfig = serde_yaml::from_str(text)?;
        if config.job_dir.is_relative() {
            config.job_dir = base_dir.join(&config.job_dir);
        }
        if config.xfer_dir.is_relative() {
            config.xfer_dir = base_dir.join(&config.xfer_dir);
        }
        Ok(config)
    }

    pub fn max_size_bytes(&self) -> Result<u64, DrainError> {
        match &self.max_size {
            SizeSpec::Gigabytes(n) => gigabytes(*n),
            SizeSpec::Text(s) => parse_size(s),
        }
    }

    /// Pattern segment files follow in the job directory.
    pub fn naming_pattern(&self) -> String {
        match &self.warc_naming {
            NamingSpec::Preset(1) => PRESET_HOST.to_string(),
            NamingSpec::Preset(2) => PRESET_PID_HOST_PORT.to_string(),
            NamingSpec::Preset(n) => n.to_string(),
            NamingSpec::Pattern(p) => p.clone(),
        }
    }

    /// Pattern files follow inside item directories, which is also the name
    /// they are uploaded under.
    pub fn upload_naming_pattern(&self) -> String {
        if self.compact_names.is_on() {
            COMPACT_UPLOAD_PATTERN.to_string()
        } else {
            self.naming_pattern()
        }
    }

    pub fn item_template(&self) -> String {
        match &self.item_naming {
            Some(t) => t.clone(),
            None if self.compact_names.is_on() => "{prefix}-{timestamp14}{suffix}-{shost}".to_string(),
            None => "{prefix}-{timestamp}-{serial}-{lastserial}-{shost}".to_string(),
        }
    }

    pub fn filename_pattern(&self) -> Result<FilenamePattern, DrainError> {
        FilenamePattern::compile(&self.naming_pattern())
    }

    pub fn upload_filename_pattern(&self) -> Result<FilenamePattern, DrainError> {
        FilenamePattern::compile(&self.upload_naming_pattern())
    }

    pub fn collision_policy(&self) -> CollisionPolicy {
        match self.on_collision {
            Some(policy) => policy,
            None if self.compact_names.is_on() => CollisionPolicy::Suffix,
            None => CollisionPolicy::Abort,
        }
    }

    /// Run metadata: built-in defaults, then legacy top-level fields, then
    /// the nested `metadata` map. Later layers win.
    pub fn metadata(&self) -> Metadata {
        let mut defaults = Metadata::new();
        defaults.insert("mediatype".to_string(), MetaValue::Single("web".to_string()));
        defaults.insert("subject".to_string(), MetaValue::Single("crawldata".to_string()));
        defaults.insert("scanner".to_string(), MetaValue::Single(local_hostname()));

        let mut legacy = Metadata::new();
        let legacy_values = [
            &self.creator,
            &self.sponsor,
            &self.contributor,
            &self.operator,
            &self.scanningcenter,
        ];
        for (name, value) in LEGACY_METADATA.iter().zip(legacy_values) {
            if let Some(v) = value.as_ref().and_then(MetaValue::from_yaml) {
                legacy.insert(name.to_string(), v);
            }
        }

        let nested: Metadata = self
            .metadata
            .iter()
            .filter_map(|(k, v)| MetaValue::from_yaml(v).map(|v| (k.clone(), v)))
            .collect();

        merge_layers([defaults, legacy, nested])
    }

    /// Host name substituted for CRAWLHOST. `metadata.scanner` wins over
    /// the local host name.
    pub fn crawlhost(&self) -> String {
        match self.metadata.get("scanner").and_then(MetaValue::from_yaml) {
            Some(v) => v.joined(";"),
            None => local_hostname(),
        }
    }

    /// Collection hierarchy, lowest collection first.
    pub fn collections(&self) -> Vec<String> {
        let declared: Vec<String> = match &self.collections {
            None => Vec::new(),
            Some(Collections::List(list)) => list.clone(),
            Some(Collections::Joined(s)) => s.split(';').map(str::to_string).collect(),
        };
        declared
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .rev()
            .collect()
    }

    pub fn finish_drain_path(&self) -> PathBuf {
        self.job_dir.join(FINISH_DRAIN)
    }

    pub fn drainme_path(&self) -> PathBuf {
        self.job_dir.join(DRAINME)
    }

    pub fn pack_lock_path(&self) -> PathBuf {
        self.job_dir.join(PACK_LOCK)
    }

    pub fn details_url(&self, item: &str) -> String {
        format!("{}/{}", self.details_base.trim_end_matches('/'), item)
    }

    pub fn download_url(&self, item: &str, filename: &str) -> String {
        format!("{}/{}/{}", self.download_base.trim_end_matches('/'), item, filename)
    }

    /// Check everything a drain run depends on. The first problem found is
    /// reported.
    pub fn validate(&self) -> Result<(), DrainError> {
        if !CRAWLJOB_NAME.is_match(&self.crawljob) {
            return Err(invalid("crawljob", "must be alpha-numeric", &self.crawljob));
        }
        if !self.job_dir.is_dir() {
            return Err(invalid("job_dir", "must be a directory", &self.job_dir.display()));
        }
        if !self.xfer_dir.is_dir() {
            return Err(invalid("xfer_dir", "must be a directory", &self.xfer_dir.display()));
        }

        let max_size = self.max_size_bytes()?;
        if max_size > MAX_ITEM_SIZE {
            return Err(DrainError::Config(format!(
                "max_size={} exceeds the {} byte item limit",
                max_size, MAX_ITEM_SIZE
            )));
        }
        if let NamingSpec::Preset(n) = self.warc_naming {
            if n != 1 && n != 2 {
                return Err(invalid("WARC_naming", "must be 1, 2 or a pattern", &n));
            }
        }

        let pattern = self.filename_pattern()?;
        pattern
            .validate_template(&self.item_template())
            .map_err(|e| DrainError::Config(e.to_string()))?;
        if self.compact_names.is_on() {
            for field in ["prefix", "timestamp", "serial"] {
                if !pattern.field_names().iter().any(|f| f == field) {
                    return Err(DrainError::Config(format!(
                        "compact_names needs {{{}}} in WARC_naming",
                        field
                    )));
                }
            }
        }

        if self.description.contains("{describe_effort}") {
            return Err(DrainError::Config(
                "description must not contain '{describe_effort}'".to_string(),
            ));
        }
        for key in ["CRAWLHOST", "CRAWLJOB", "START_DATE", "END_DATE"] {
            if !self.description.contains(key) {
                return Err(DrainError::Config(format!(
                    "description must contain placeholder {}",
                    key
                )));
            }
        }

        let metadata = self.metadata();
        if let Some(key) = metadata.keys().find(|k| !is_header_token(k)) {
            return Err(invalid("metadata key", "must be a valid header token", key));
        }
        if let Some(op) = metadata.get("operator") {
            if op.joined(";") == "tbd@archive.org" {
                return Err(invalid("operator", "must be proper operator identifier", &op.joined(";")));
            }
        }
        if self.collections().iter().any(|c| c == "TBD") {
            return Err(invalid("collections", "must not contain \"TBD\"", &"TBD"));
        }
        if self.title_prefix == "TBD Crawldata" {
            return Err(invalid("title_prefix", "is invalid", &self.title_prefix));
        }
        for key in ["creator", "sponsor", "contributor", "scanningcenter"] {
            if metadata.get(key).map(|v| v.is_empty()).unwrap_or(true) {
                return Err(DrainError::Config(format!("{} is missing", key)));
            }
        }
        Ok(())
    }
}

fn invalid(name: &str, msg: &str, value: &dyn std::fmt::Display) -> DrainError {
    DrainError::Config(format!("{} {}: {}", name, msg, value))
}

/// Parse a size with unit suffix. Lowercase units are powers of 1000,
/// uppercase powers of 1024. A bare number counts gigabytes.
pub fn parse_size(text: &str) -> Result<u64, DrainError> {
    let text = text.trim();
    if let Ok(n) = text.parse::<u64>() {
        return gigabytes(n);
    }
    let caps = SIZE_WITH_UNIT
        .captures(text)
        .ok_or_else(|| DrainError::Config(format!("illegal value for max_size: {:?}", text)))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| DrainError::Config(format!("illegal value for max_size: {:?}", text)))?;
    let factor: u64 = match &caps[2] {
        "k" => 1000,
        "K" => 1024,
        "m" => 1000u64.pow(2),
        "M" => 1024u64.pow(2),
        "g" => 1000u64.pow(3),
        "G" => 1024u64.pow(3),
        "t" => 1000u64.pow(4),
        "T" => 1024u64.pow(4),
        other => {
            return Err(DrainError::Config(format!(
                "undefined suffix for max_size: {:?}",
                other
            )))
        }
    };
    Ok((value * factor as f64) as u64)
}

fn gigabytes(n: u64) -> Result<u64, DrainError> {
    n.checked_mul(1024 * 1024 * 1024)
        .ok_or_else(|| DrainError::Config(format!("max_size={} GiB is out of range", n)))
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}
