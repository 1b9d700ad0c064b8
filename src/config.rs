// 该文件是 Huajia （花价） 项目的一部分。
// src/config.rs - 运行配置
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::pricing::{Palette, PriceTable, PricingError};

pub const CONFIG_ENV: &str = "HUAJIA_CONFIG";
pub const API_KEY_ENV: &str = "HUAJIA_API_KEY";
pub const PUBLISHABLE_KEY_ENV: &str = "HUAJIA_PUBLISHABLE_KEY";

const DEFAULT_WORKFLOW_ENDPOINT: &str =
  "workflow://serverless.roboflow.com/infer/workflows/cap-jrn6k/custom-workflow-2";
const DEFAULT_WORKER_MODEL: &str = "florax-ai";
const DEFAULT_WORKER_VERSION: u32 = 4;
const DEFAULT_PUBLISHABLE_KEY: &str = "rf_wfMlQ8YUt1Qc6FVWqoP52p3mdu52";
const DEFAULT_REGISTRY_URL: &str = "https://api.roboflow.com";
const DEFAULT_DETECT_URL: &str = "https://detect.roboflow.com";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_LINE_WIDTH: u32 = 3;
const DEFAULT_FONT_PATHS: [&str; 3] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
];

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置文件 {0} 失败: {1}")]
  Io(PathBuf, std::io::Error),
  #[error("解析配置文件失败: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("配置无效: {0}")]
  Invalid(#[from] PricingError),
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
  workflow: Option<WorkflowConfigFile>,
  worker: Option<WorkerConfigFile>,
  prices: Option<BTreeMap<String, u64>>,
  render: Option<RenderConfigFile>,
  #[serde(rename = "loop")]
  polling: Option<LoopConfigFile>,
  upload: Option<UploadConfigFile>,
  camera: Option<CameraConfigFile>,
  request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkflowConfigFile {
  endpoint: Option<String>,
  api_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkerConfigFile {
  model: Option<String>,
  version: Option<u32>,
  publishable_key: Option<String>,
  registry_url: Option<String>,
  detect_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
  palette: Option<Vec<String>>,
  font: Option<PathBuf>,
  line_width: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct LoopConfigFile {
  interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
  max_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
  width: Option<u32>,
  height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
  /// `workflow://` 形式的地址
  pub endpoint: String,
  pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub model: String,
  pub version: u32,
  pub publishable_key: String,
  pub registry_url: String,
  pub detect_url: String,
}

impl WorkerSettings {
  /// `worker://` 形式的地址
  pub fn url(&self) -> String {
    format!("worker://{}/{}", self.model, self.version)
  }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
  pub palette: Palette,
  pub font: Option<PathBuf>,
  pub line_width: u32,
}

#[derive(Debug, Clone)]
pub struct Settings {
  pub workflow: WorkflowSettings,
  pub worker: WorkerSettings,
  pub prices: PriceTable,
  pub render: RenderSettings,
  pub poll_interval: Duration,
  pub max_upload_bytes: u64,
  pub request_timeout: Duration,
  pub camera_width: u32,
  pub camera_height: u32,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      workflow: WorkflowSettings {
        endpoint: DEFAULT_WORKFLOW_ENDPOINT.to_string(),
        api_key: String::new(),
      },
      worker: WorkerSettings {
        model: DEFAULT_WORKER_MODEL.to_string(),
        version: DEFAULT_WORKER_VERSION,
        publishable_key: DEFAULT_PUBLISHABLE_KEY.to_string(),
        registry_url: DEFAULT_REGISTRY_URL.to_string(),
        detect_url: DEFAULT_DETECT_URL.to_string(),
      },
      prices: PriceTable::default(),
      render: RenderSettings {
        palette: Palette::default(),
        font: DEFAULT_FONT_PATHS
          .iter()
          .map(PathBuf::from)
          .find(|p| p.exists()),
        line_width: DEFAULT_LINE_WIDTH,
      },
      poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
      max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
      request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
      camera_width: DEFAULT_CAMERA_WIDTH,
      camera_height: DEFAULT_CAMERA_HEIGHT,
    }
  }
}

impl Settings {
  /// 按 参数路径 > 环境变量 的顺序查找配置文件，之后应用环境变量中的密钥
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
    let mut settings = match path.map(Path::to_path_buf).or(env_path) {
      Some(path) => {
        info!("加载配置文件: {}", path.display());
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
        Self::from_toml(&text)?
      }
      None => Self::default(),
    };

    if let Ok(key) = std::env::var(API_KEY_ENV) {
      debug!("使用环境变量 {} 中的 API 密钥", API_KEY_ENV);
      settings.workflow.api_key = key;
    }
    if let Ok(key) = std::env::var(PUBLISHABLE_KEY_ENV) {
      debug!("使用环境变量 {} 中的发布密钥", PUBLISHABLE_KEY_ENV);
      settings.worker.publishable_key = key;
    }
    Ok(settings)
  }

  pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
    let file: ConfigFile = toml::from_str(text)?;
    let mut settings = Self::default();

    if let Some(workflow) = file.workflow {
      if let Some(endpoint) = workflow.endpoint {
        settings.workflow.endpoint = endpoint;
      }
      if let Some(api_key) = workflow.api_key {
        settings.workflow.api_key = api_key;
      }
    }
    if let Some(worker) = file.worker {
      let target = &mut settings.worker;
      target.model = worker.model.unwrap_or(std::mem::take(&mut target.model));
      target.version = worker.version.unwrap_or(target.version);
      if let Some(key) = worker.publishable_key {
        target.publishable_key = key;
      }
      if let Some(url) = worker.registry_url {
        target.registry_url = url;
      }
      if let Some(url) = worker.detect_url {
        target.detect_url = url;
      }
    }
    if let Some(prices) = file.prices {
      settings.prices = PriceTable::from_map(prices)?;
    }
    if let Some(render) = file.render {
      if let Some(palette) = render.palette {
        settings.render.palette = Palette::from_hex(&palette)?;
      }
      if render.font.is_some() {
        settings.render.font = render.font;
      }
      settings.render.line_width = render.line_width.unwrap_or(settings.render.line_width);
    }
    if let Some(interval) = file.polling.and_then(|l| l.interval_ms) {
      settings.poll_interval = Duration::from_millis(interval);
    }
    if let Some(max_bytes) = file.upload.and_then(|u| u.max_bytes) {
      settings.max_upload_bytes = max_bytes;
    }
    if let Some(camera) = file.camera {
      settings.camera_width = camera.width.unwrap_or(settings.camera_width);
      settings.camera_height = camera.height.unwrap_or(settings.camera_height);
    }
    if let Some(secs) = file.request_timeout_secs {
      settings.request_timeout = Duration::from_secs(secs);
    }
    Ok(settings)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pricing::Color;

  #[test]
  fn defaults_match_compiled_constants() {
    let settings = Settings::default();
    assert_eq!(settings.poll_interval, Duration::from_millis(100));
    assert_eq!(settings.max_upload_bytes, 10 * 1024 * 1024);
    assert_eq!(settings.prices.unit_price("rose"), 1900);
    assert_eq!(settings.prices.unit_price("tulip"), 1200);
    assert_eq!(settings.worker.url(), "worker://florax-ai/4");
  }

  #[test]
  fn toml_overrides_defaults() {
    let settings = Settings::from_toml(
      r##"
        request_timeout_secs = 5

        [prices]
        Tulip = 800
        unknown = 1000

        [render]
        palette = ["#ff0000", "#00ff00"]
        line_width = 2

        [loop]
        interval_ms = 250

        [worker]
        version = 7
      "##,
    )
    .unwrap();
    assert_eq!(settings.prices.unit_price("tulip"), 800);
    assert_eq!(settings.prices.unit_price("rose"), 1000);
    assert_eq!(settings.render.palette.color_for(Some(3), "x"), Color([0, 255, 0]));
    assert_eq!(settings.render.line_width, 2);
    assert_eq!(settings.poll_interval, Duration::from_millis(250));
    assert_eq!(settings.request_timeout, Duration::from_secs(5));
    assert_eq!(settings.worker.model, "florax-ai");
    assert_eq!(settings.worker.version, 7);
  }

  #[test]
  fn price_table_without_fallback_is_rejected() {
    let err = Settings::from_toml("[prices]\nrose = 1900\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(PricingError::MissingFallback)));
  }

  #[test]
  fn bad_palette_is_rejected() {
    let err = Settings::from_toml("[render]\npalette = []\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(PricingError::EmptyPalette)));
  }
}
