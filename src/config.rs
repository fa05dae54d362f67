//! Configuration types for the gateway.
//!
//! All deployment-specific behaviour is controlled through [`GatewayConfig`]:
//! where each stage lives, how long a single call may take, how often a
//! transport failure is retried, and how long a whole run may last. It is
//! constructed once at startup (from a TOML file, CLI flags or the builder),
//! validated, and then shared read-only by every run.
//!
//! # Example
//! ```rust
//! use cin_gateway::{GatewayConfig, StageKind};
//! use std::time::Duration;
//!
//! let config = GatewayConfig::builder()
//!     .endpoint(StageKind::Detection, "http://cin-detection:8001/detect-cin/")
//!     .endpoint(StageKind::Extraction, "http://field-extraction:8002/extract-fields/")
//!     .endpoint(StageKind::Preprocessing, "http://preprocessing:8003/preprocess/")
//!     .endpoint(StageKind::Recognition, "http://ocr:8004/ocr/")
//!     .endpoint(StageKind::Aggregation, "http://data-aggregation:8006/aggregate/")
//!     .run_deadline(Duration::from_secs(90))
//!     .concurrency(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.concurrency, 4);
//! ```

use crate::error::GatewayError;
use crate::stage::{StageKind, StageTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default per-attempt timeout for every stage except detection.
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 30_000;

/// Detection works on the full-resolution upload and gets a longer budget.
pub const DEFAULT_DETECTION_TIMEOUT_MS: u64 = 50_000;

pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Process-wide gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address the HTTP gateway binds to. Default: `0.0.0.0:8000`.
    pub bind: String,

    /// Budget for a whole run, from upload to aggregation. Default: 120 000.
    ///
    /// A single deadline, never reset per stage. Detection, extraction and
    /// both fan-out stages must finish inside it.
    pub run_deadline_ms: u64,

    /// Extra time granted to the aggregation call past `run_deadline_ms`.
    /// Default: 5 000.
    ///
    /// Fields still pending when the deadline fires are recorded as
    /// `Timeout`; the fields that did finish are still worth aggregating, so
    /// aggregation gets this short grace window instead of failing outright.
    pub finalize_grace_ms: u64,

    /// Maximum concurrent per-field calls within one fan-out stage. Default: 8.
    pub concurrency: usize,

    /// Base retry delay in milliseconds (exponential backoff). Default: 250.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff delay. Default: 4 000.
    pub max_backoff_ms: u64,

    /// Largest accepted upload in bytes. Default: 10 MiB.
    pub max_upload_bytes: usize,

    /// `User-Agent` sent to the stage services.
    pub user_agent: String,

    /// Stage name (`detection`, `extraction`, ...) to endpoint settings.
    pub stages: BTreeMap<String, StageEndpoint>,
}

/// Endpoint settings for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEndpoint {
    pub url: String,

    /// Per-attempt timeout. Default: 30 000 (50 000 for detection when set
    /// through the builder).
    #[serde(default = "default_stage_timeout_ms")]
    pub timeout_ms: u64,

    /// Additional attempts on `Unreachable` failures. Default: 2.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_stage_timeout_ms() -> u64 {
    DEFAULT_STAGE_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl StageEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            run_deadline_ms: 120_000,
            finalize_grace_ms: 5_000,
            concurrency: 8,
            retry_backoff_ms: 250,
            max_backoff_ms: 4_000,
            max_upload_bytes: 10 * 1024 * 1024,
            user_agent: concat!("cin-gateway/", env!("CARGO_PKG_VERSION")).to_string(),
            stages: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Create a new builder for `GatewayConfig`.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// ```toml
    /// run_deadline_ms = 60000
    ///
    /// [stages.detection]
    /// url = "http://cin-detection:8001/detect-cin/"
    /// timeout_ms = 50000
    ///
    /// [stages.recognition]
    /// url = "http://ocr:8004/ocr/"
    /// max_retries = 3
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Read a TOML file. The result is not validated; call [`Self::validate`]
    /// after applying any overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| GatewayError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&source).map_err(|e| GatewayError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check every constraint, including that all five stages are reachable
    /// through a well-formed http(s) URL.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.run_deadline_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "run_deadline_ms must be > 0".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(GatewayError::InvalidConfig("concurrency must be ≥ 1".into()));
        }
        if self.max_upload_bytes == 0 {
            return Err(GatewayError::InvalidConfig(
                "max_upload_bytes must be > 0".into(),
            ));
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(GatewayError::InvalidConfig(format!(
                "max_backoff_ms ({}) must be ≥ retry_backoff_ms ({})",
                self.max_backoff_ms, self.retry_backoff_ms
            )));
        }
        StageTable::from_config(self).map(|_| ())
    }

    /// Set (or replace) the URL of one stage, keeping its other settings.
    pub fn set_endpoint_url(&mut self, stage: StageKind, url: impl Into<String>) {
        let url = url.into();
        self.stages
            .entry(stage.name().to_string())
            .and_modify(|ep| ep.url = url.clone())
            .or_insert_with(|| default_endpoint(stage, url));
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_millis(self.run_deadline_ms)
    }

    pub fn finalize_grace(&self) -> Duration {
        Duration::from_millis(self.finalize_grace_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_endpoint(stage: StageKind, url: String) -> StageEndpoint {
    let mut endpoint = StageEndpoint::new(url);
    if stage == StageKind::Detection {
        endpoint.timeout_ms = DEFAULT_DETECTION_TIMEOUT_MS;
    }
    endpoint
}

/// Builder for [`GatewayConfig`].
#[derive(Debug)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind = addr.into();
        self
    }

    pub fn endpoint(mut self, stage: StageKind, url: impl Into<String>) -> Self {
        self.config.set_endpoint_url(stage, url);
        self
    }

    /// Per-attempt timeout for one stage. Ignored if the stage has no URL yet.
    pub fn stage_timeout(mut self, stage: StageKind, timeout: Duration) -> Self {
        if let Some(ep) = self.config.stages.get_mut(stage.name()) {
            ep.timeout_ms = timeout.as_millis() as u64;
        }
        self
    }

    /// Retry budget for one stage. Ignored if the stage has no URL yet.
    pub fn stage_max_retries(mut self, stage: StageKind, n: u32) -> Self {
        if let Some(ep) = self.config.stages.get_mut(stage.name()) {
            ep.max_retries = n;
        }
        self
    }

    /// Same retry budget for every stage configured so far.
    pub fn max_retries(mut self, n: u32) -> Self {
        for ep in self.config.stages.values_mut() {
            ep.max_retries = n;
        }
        self
    }

    pub fn run_deadline(mut self, deadline: Duration) -> Self {
        self.config.run_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn finalize_grace(mut self, grace: Duration) -> Self {
        self.config.finalize_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.config.retry_backoff_ms = base.as_millis() as u64;
        self
    }

    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.config.max_backoff_ms = cap.as_millis() as u64;
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GatewayConfig, GatewayError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
