// 该文件是 Huajia （花价） 项目的一部分。
// src/model/worker.rs - 内嵌推理工作线程
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
  sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicU64, Ordering},
    mpsc,
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::Settings,
  frame::Frame,
  model::{InferenceError, InitError, Model, RawDetection, parse_predictions},
};

const DEFAULT_REGISTRY_URL: &str = "https://api.roboflow.com";
const DEFAULT_DETECT_URL: &str = "https://detect.roboflow.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

static WORKER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 初始化成功后得到的工作线程句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
  pub id: String,
  pub model: String,
  pub version: u32,
}

enum WorkerStatus {
  Initializing,
  Ready(WorkerHandle),
  Failed(String),
}

struct WorkerRequest {
  payload: String,
  reply: mpsc::Sender<Result<Vec<RawDetection>, InferenceError>>,
}

#[derive(Clone)]
struct WorkerConfig {
  model: String,
  version: u32,
  key: String,
  registry_url: String,
  detect_url: String,
  timeout: Duration,
}

impl WorkerConfig {
  fn registry_endpoint(&self) -> String {
    format!(
      "{}/{}/{}?api_key={}",
      self.registry_url.trim_end_matches('/'),
      self.model,
      self.version,
      urlencoding::encode(&self.key)
    )
  }

  fn detect_endpoint(&self) -> String {
    format!(
      "{}/{}/{}?api_key={}",
      self.detect_url.trim_end_matches('/'),
      self.model,
      self.version,
      urlencoding::encode(&self.key)
    )
  }
}

struct Shared {
  status: Mutex<WorkerStatus>,
  changed: Condvar,
}

/// 在后台线程中针对远程模型仓库初始化一次，然后处理推理请求
pub struct WorkerModel {
  config: WorkerConfig,
  shared: Arc<Shared>,
  sender: Mutex<mpsc::Sender<WorkerRequest>>,
}

pub struct WorkerModelBuilder {
  model: String,
  version: u32,
  key: Option<String>,
  registry_url: String,
  detect_url: String,
  timeout: Duration,
}

impl FromUrlWithScheme for WorkerModelBuilder {
  const SCHEME: &'static str = "worker";
}

impl FromUrl for WorkerModelBuilder {
  type Error = InitError;

  // worker://model-name/version[?registry=..&detect=..&key=..]
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InitError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let model = url
      .host_str()
      .filter(|h| !h.is_empty())
      .ok_or_else(|| InitError::InvalidUrl(format!("缺少模型名: {}", url)))?
      .to_string();
    let version = url
      .path()
      .trim_matches('/')
      .parse::<u32>()
      .map_err(|_| InitError::InvalidUrl(format!("模型版本无效: {}", url.path())))?;

    let mut builder = WorkerModelBuilder {
      model,
      version,
      key: None,
      registry_url: DEFAULT_REGISTRY_URL.to_string(),
      detect_url: DEFAULT_DETECT_URL.to_string(),
      timeout: DEFAULT_TIMEOUT,
    };
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "registry" => builder.registry_url = v.into_owned(),
        "detect" => builder.detect_url = v.into_owned(),
        "key" => builder.key = Some(v.into_owned()),
        other => warn!("忽略未知的模型参数: {}", other),
      }
    }
    Ok(builder)
  }
}

impl WorkerModelBuilder {
  pub fn key(mut self, key: impl Into<String>) -> Self {
    self.key = Some(key.into());
    self
  }

  pub fn registry_url(mut self, url: impl Into<String>) -> Self {
    self.registry_url = url.into();
    self
  }

  pub fn detect_url(mut self, url: impl Into<String>) -> Self {
    self.detect_url = url.into();
    self
  }

  pub fn with_settings(mut self, settings: &Settings) -> Self {
    if self.key.is_none() && !settings.worker.publishable_key.is_empty() {
      self.key = Some(settings.worker.publishable_key.clone());
    }
    if self.registry_url == DEFAULT_REGISTRY_URL {
      self.registry_url = settings.worker.registry_url.clone();
    }
    if self.detect_url == DEFAULT_DETECT_URL {
      self.detect_url = settings.worker.detect_url.clone();
    }
    self.timeout = settings.request_timeout;
    self
  }

  /// 启动工作线程，初始化在后台进行
  pub fn build(self) -> Result<WorkerModel, InitError> {
    let key = self
      .key
      .filter(|k| !k.is_empty())
      .ok_or(InitError::MissingCredentials("worker publishable key"))?;
    let config = WorkerConfig {
      model: self.model,
      version: self.version,
      key,
      registry_url: self.registry_url,
      detect_url: self.detect_url,
      timeout: self.timeout,
    };
    let shared = Arc::new(Shared {
      status: Mutex::new(WorkerStatus::Initializing),
      changed: Condvar::new(),
    });
    let sender = spawn_worker(config.clone(), shared.clone())?;
    Ok(WorkerModel {
      config,
      shared,
      sender: Mutex::new(sender),
    })
  }
}

fn spawn_worker(config: WorkerConfig, shared: Arc<Shared>) -> Result<mpsc::Sender<WorkerRequest>, InitError> {
  let (tx, rx) = mpsc::channel::<WorkerRequest>();
  let id = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);
  thread::Builder::new()
    .name(format!("infer-worker-{}", id))
    .spawn(move || run_worker(id, config, shared, rx))
    .map_err(InitError::Spawn)?;
  Ok(tx)
}

fn set_status(shared: &Shared, status: WorkerStatus) {
  if let Ok(mut guard) = shared.status.lock() {
    *guard = status;
  }
  shared.changed.notify_all();
}

fn run_worker(id: u64, config: WorkerConfig, shared: Arc<Shared>, rx: mpsc::Receiver<WorkerRequest>) {
  let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();

  info!("初始化推理工作线程: {} v{}", config.model, config.version);
  match init_worker(&agent, &config) {
    Ok(()) => {
      let handle = WorkerHandle {
        id: format!("{}/{}#{}", config.model, config.version, id),
        model: config.model.clone(),
        version: config.version,
      };
      info!("推理工作线程就绪: {}", handle.id);
      set_status(&shared, WorkerStatus::Ready(handle));
    }
    Err(e) => {
      error!("推理工作线程初始化失败: {}", e);
      set_status(&shared, WorkerStatus::Failed(e.to_string()));
      return;
    }
  }

  let endpoint = config.detect_endpoint();
  for request in rx {
    let result = detect(&agent, &endpoint, &request.payload);
    // 请求方可能已放弃等待
    let _ = request.reply.send(result);
  }
  debug!("推理工作线程 {} 退出", id);
}

fn init_worker(agent: &ureq::Agent, config: &WorkerConfig) -> Result<(), InitError> {
  let response = agent
    .get(&config.registry_endpoint())
    .call()
    .map_err(|e| match e {
      ureq::Error::Status(code, _) => InitError::Rejected(code),
      ureq::Error::Transport(t) => InitError::Registry(t.to_string()),
    })?;
  let _: serde_json::Value = response
    .into_json()
    .map_err(|e| InitError::Malformed(e.to_string()))?;
  Ok(())
}

fn detect(agent: &ureq::Agent, endpoint: &str, payload: &str) -> Result<Vec<RawDetection>, InferenceError> {
  let response = agent
    .post(endpoint)
    .set("Content-Type", "application/x-www-form-urlencoded")
    .send_string(payload)?;
  let value: serde_json::Value = response
    .into_json()
    .map_err(|e| InferenceError::Malformed(e.to_string()))?;
  parse_worker_response(&value)
}

/// 接受扁平数组或 `{predictions: [...]}`
pub fn parse_worker_response(value: &serde_json::Value) -> Result<Vec<RawDetection>, InferenceError> {
  match value.get("predictions") {
    Some(predictions) => parse_predictions(predictions),
    None => parse_predictions(value),
  }
}

impl WorkerModel {
  pub fn handle(&self) -> Option<WorkerHandle> {
    match &*self.shared.status.lock().ok()? {
      WorkerStatus::Ready(handle) => Some(handle.clone()),
      _ => None,
    }
  }

  /// 初始化失败时的错误信息
  pub fn init_error(&self) -> Option<String> {
    match &*self.shared.status.lock().ok()? {
      WorkerStatus::Failed(msg) => Some(msg.clone()),
      _ => None,
    }
  }

  /// 阻塞等待初始化结束
  pub fn wait_ready(&self, timeout: Duration) -> Result<(), InitError> {
    let deadline = Instant::now() + timeout;
    let mut status = self
      .shared
      .status
      .lock()
      .map_err(|_| InitError::Registry("工作线程状态锁已损坏".to_string()))?;
    loop {
      match &*status {
        WorkerStatus::Ready(_) => return Ok(()),
        WorkerStatus::Failed(msg) => return Err(InitError::Registry(msg.clone())),
        WorkerStatus::Initializing => {}
      }
      let now = Instant::now();
      if now >= deadline {
        return Err(InitError::Timeout);
      }
      status = self
        .shared
        .changed
        .wait_timeout(status, deadline - now)
        .map_err(|_| InitError::Registry("工作线程状态锁已损坏".to_string()))?
        .0;
    }
  }
}

impl Model for WorkerModel {
  type Input = Frame;
  type Output = Vec<RawDetection>;
  type Error = InferenceError;

  fn infer(&self, input: &Frame) -> Result<Self::Output, Self::Error> {
    if !self.is_ready() {
      return Err(InferenceError::NotReady);
    }
    let payload = input.to_base64()?;
    let (reply, response) = mpsc::channel();
    self
      .sender
      .lock()
      .map_err(|_| InferenceError::WorkerGone)?
      .send(WorkerRequest { payload, reply })
      .map_err(|_| InferenceError::WorkerGone)?;
    response.recv().map_err(|_| InferenceError::WorkerGone)?
  }

  fn is_ready(&self) -> bool {
    self.handle().is_some()
  }

  /// 初始化失败后重新启动工作线程
  fn retry_init(&self) -> Result<(), InitError> {
    if self.init_error().is_none() {
      return Ok(());
    }
    warn!("重新初始化推理工作线程");
    set_status(&self.shared, WorkerStatus::Initializing);
    let sender = match spawn_worker(self.config.clone(), self.shared.clone()) {
      Ok(sender) => sender,
      Err(e) => {
        // 保持失败状态，之后仍可再次重试
        set_status(&self.shared, WorkerStatus::Failed(e.to_string()));
        return Err(e);
      }
    };
    if let Ok(mut guard) = self.sender.lock() {
      *guard = sender;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn parses_model_name_and_version() {
    let url = Url::parse("worker://florax-ai/4?key=rf_abc").unwrap();
    let builder = WorkerModelBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model, "florax-ai");
    assert_eq!(builder.version, 4);
    assert_eq!(builder.key.as_deref(), Some("rf_abc"));
  }

  #[test]
  fn rejects_bad_version() {
    let url = Url::parse("worker://florax-ai/latest").unwrap();
    assert!(matches!(
      WorkerModelBuilder::from_url(&url),
      Err(InitError::InvalidUrl(_))
    ));
  }

  #[test]
  fn requires_key() {
    let url = Url::parse("worker://florax-ai/4").unwrap();
    let builder = WorkerModelBuilder::from_url(&url).unwrap();
    assert!(matches!(
      builder.build(),
      Err(InitError::MissingCredentials(_))
    ));
  }

  #[test]
  fn unreachable_registry_reports_init_error() {
    // 端口 9 上通常没有服务
    let url = Url::parse("worker://florax-ai/4?key=k&registry=http://127.0.0.1:9").unwrap();
    let model = WorkerModelBuilder::from_url(&url).unwrap().build().unwrap();
    assert!(model.wait_ready(Duration::from_secs(10)).is_err());
    assert!(!model.is_ready());
    assert!(model.init_error().is_some());
    let frame = Frame::new(image::RgbImage::new(4, 4), 0, 0);
    assert!(matches!(model.infer(&frame), Err(InferenceError::NotReady)));
  }

  #[test]
  fn failed_retry_can_be_retried_again() {
    let url = Url::parse("worker://florax-ai/4?key=k&registry=http://127.0.0.1:9").unwrap();
    let model = WorkerModelBuilder::from_url(&url).unwrap().build().unwrap();
    assert!(model.wait_ready(Duration::from_secs(10)).is_err());

    for _ in 0..2 {
      model.retry_init().unwrap();
      assert!(matches!(
        model.wait_ready(Duration::from_secs(10)),
        Err(InitError::Registry(_))
      ));
      assert!(model.init_error().is_some());
    }
  }

  #[test]
  fn parses_both_response_shapes() {
    let flat = json!([
      {"class": "rose", "confidence": 0.8, "bbox": {"x": 5.0, "y": 5.0, "width": 2.0, "height": 2.0}, "color": "#C7FC00"}
    ]);
    let nested = json!({
      "predictions": [
        {"class": "rose", "confidence": 0.8, "x": 5.0, "y": 5.0, "width": 2.0, "height": 2.0, "class_id": 1}
      ]
    });
    assert_eq!(parse_worker_response(&flat).unwrap()[0].class, "rose");
    assert_eq!(parse_worker_response(&nested).unwrap()[0].class_id, Some(1));
  }
}
