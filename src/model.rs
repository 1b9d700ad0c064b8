// 该文件是 Huajia （花价） 项目的一部分。
// src/model.rs - 推理客户端定义
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, UserMessage, config::Settings, frame::Frame};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;

  /// 模型句柄是否可用，未就绪时轮询会跳过本次推理
  fn is_ready(&self) -> bool {
    true
  }

  /// 初始化失败后重试；无需初始化的模型直接返回
  fn retry_init(&self) -> Result<(), InitError> {
    Ok(())
  }
}

/// 以帧为输入、原始检测列表为输出的模型
pub trait FrameModel:
  Model<Input = Frame, Output = Vec<RawDetection>, Error = InferenceError> + Send + Sync
{
}

impl<T> FrameModel for T where
  T: Model<Input = Frame, Output = Vec<RawDetection>, Error = InferenceError> + Send + Sync
{
}

/// 中心点格式的边界框，单位为原图像素
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 左上角坐标
  pub fn top_left(&self) -> (f32, f32) {
    (self.x - self.width / 2.0, self.y - self.height / 2.0)
  }

  pub fn is_finite(&self) -> bool {
    [self.x, self.y, self.width, self.height]
      .iter()
      .all(|v| v.is_finite())
  }
}

/// 服务返回的单个检测，顺序与服务返回一致
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
  pub class: String,
  pub class_id: Option<u32>,
  pub confidence: f32,
  pub bbox: BBox,
}

#[derive(Error, Debug)]
pub enum InitError {
  #[error("缺少凭据: {0}")]
  MissingCredentials(&'static str),
  #[error("模型仓库请求失败: {0}")]
  Registry(String),
  #[error("模型仓库拒绝请求: HTTP {0}")]
  Rejected(u16),
  #[error("模型仓库响应无效: {0}")]
  Malformed(String),
  #[error("推理工作线程无法启动: {0}")]
  Spawn(std::io::Error),
  #[error("模型地址无效: {0}")]
  InvalidUrl(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("等待模型初始化超时")]
  Timeout,
}

impl UserMessage for InitError {
  fn user_message(&self) -> String {
    "Failed to load the AI model. Please try again.".to_string()
  }
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("网络错误: {0}")]
  Network(String),
  #[error("推理服务返回 HTTP {0}: {1}")]
  Status(u16, String),
  #[error("推理响应无效: {0}")]
  Malformed(String),
  #[error("图像编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("模型尚未就绪")]
  NotReady,
  #[error("推理工作线程已退出")]
  WorkerGone,
}

impl From<ureq::Error> for InferenceError {
  fn from(err: ureq::Error) -> Self {
    match err {
      ureq::Error::Status(code, response) => {
        InferenceError::Status(code, response.status_text().to_string())
      }
      ureq::Error::Transport(transport) => InferenceError::Network(transport.to_string()),
    }
  }
}

impl UserMessage for InferenceError {
  fn user_message(&self) -> String {
    match self {
      InferenceError::NotReady => "The AI model is still loading. Please wait.".to_string(),
      _ => "Failed to analyze the image. Please try another image.".to_string(),
    }
  }
}

/// 推理服务返回的单条预测，x/y 为中心点
#[derive(Debug, Deserialize)]
struct WirePrediction {
  #[serde(rename = "class")]
  class_name: String,
  confidence: f32,
  #[serde(default)]
  class_id: Option<u32>,
  #[serde(default)]
  bbox: Option<BBox>,
  #[serde(default)]
  x: Option<f32>,
  #[serde(default)]
  y: Option<f32>,
  #[serde(default)]
  width: Option<f32>,
  #[serde(default)]
  height: Option<f32>,
}

impl TryFrom<WirePrediction> for RawDetection {
  type Error = InferenceError;

  fn try_from(p: WirePrediction) -> Result<Self, Self::Error> {
    let bbox = match (p.bbox, p.x, p.y, p.width, p.height) {
      (Some(bbox), ..) => bbox,
      (None, Some(x), Some(y), Some(width), Some(height)) => BBox::new(x, y, width, height),
      _ => {
        return Err(InferenceError::Malformed(format!(
          "预测 '{}' 缺少边界框",
          p.class_name
        )));
      }
    };
    // 超出 f32 范围的数值会被解析为无穷大
    if !bbox.is_finite() || !p.confidence.is_finite() {
      return Err(InferenceError::Malformed(format!(
        "预测 '{}' 含有非有限数值",
        p.class_name
      )));
    }
    Ok(RawDetection {
      class: p.class_name,
      class_id: p.class_id,
      confidence: p.confidence,
      bbox,
    })
  }
}

/// 解析预测数组
pub(crate) fn parse_predictions(value: &serde_json::Value) -> Result<Vec<RawDetection>, InferenceError> {
  let items = value
    .as_array()
    .ok_or_else(|| InferenceError::Malformed("predictions 不是数组".to_string()))?;
  items
    .iter()
    .map(|item| {
      let wire: WirePrediction = serde_json::from_value(item.clone())
        .map_err(|e| InferenceError::Malformed(e.to_string()))?;
      RawDetection::try_from(wire)
    })
    .collect()
}

mod workflow;
mod worker;

pub use self::workflow::{WorkflowModel, WorkflowModelBuilder, parse_workflow_response};
pub use self::worker::{WorkerHandle, WorkerModel, WorkerModelBuilder, parse_worker_response};

pub enum ModelBuilder {
  Workflow(WorkflowModelBuilder),
  Worker(WorkerModelBuilder),
}

impl FromUrl for ModelBuilder {
  type Error = InitError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      WorkflowModelBuilder::SCHEME => Ok(ModelBuilder::Workflow(WorkflowModelBuilder::from_url(url)?)),
      WorkerModelBuilder::SCHEME => Ok(ModelBuilder::Worker(WorkerModelBuilder::from_url(url)?)),
      other => Err(InitError::SchemeMismatch(other.to_string())),
    }
  }
}

impl ModelBuilder {
  pub fn with_settings(self, settings: &Settings) -> Self {
    match self {
      ModelBuilder::Workflow(builder) => ModelBuilder::Workflow(builder.with_settings(settings)),
      ModelBuilder::Worker(builder) => ModelBuilder::Worker(builder.with_settings(settings)),
    }
  }

  pub fn build(self) -> Result<ModelWrapper, InitError> {
    match self {
      ModelBuilder::Workflow(builder) => Ok(ModelWrapper::Workflow(builder.build()?)),
      ModelBuilder::Worker(builder) => Ok(ModelWrapper::Worker(builder.build()?)),
    }
  }
}

/// 按配置选择的推理客户端
pub enum ModelWrapper {
  Workflow(WorkflowModel),
  Worker(WorkerModel),
}

impl ModelWrapper {
  /// 等待模型就绪；远程工作流无需初始化
  pub fn wait_ready(&self, timeout: std::time::Duration) -> Result<(), InitError> {
    match self {
      ModelWrapper::Workflow(_) => Ok(()),
      ModelWrapper::Worker(model) => model.wait_ready(timeout),
    }
  }
}

impl Model for ModelWrapper {
  type Input = Frame;
  type Output = Vec<RawDetection>;
  type Error = InferenceError;

  fn infer(&self, input: &Frame) -> Result<Self::Output, Self::Error> {
    match self {
      ModelWrapper::Workflow(model) => model.infer(input),
      ModelWrapper::Worker(model) => model.infer(input),
    }
  }

  fn is_ready(&self) -> bool {
    match self {
      ModelWrapper::Workflow(model) => model.is_ready(),
      ModelWrapper::Worker(model) => model.is_ready(),
    }
  }
  fn retry_init(&self) -> Result<(), InitError> {
    match self {
      ModelWrapper::Workflow(model) => model.retry_init(),
      ModelWrapper::Worker(model) => model.retry_init(),
    }
  }
}
