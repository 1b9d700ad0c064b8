// 该文件是 Huajia （花价） 项目的一部分。
// src/model/workflow.rs - 远程工作流推理客户端
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

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::Settings,
  frame::Frame,
  model::{InferenceError, InitError, Model, RawDetection, parse_predictions},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// 每帧一次 HTTP 请求的远程工作流
pub struct WorkflowModel {
  agent: ureq::Agent,
  endpoint: String,
  api_key: String,
}

pub struct WorkflowModelBuilder {
  endpoint: String,
  api_key: Option<String>,
  timeout: Duration,
}

impl FromUrlWithScheme for WorkflowModelBuilder {
  const SCHEME: &'static str = "workflow";
}

impl FromUrl for WorkflowModelBuilder {
  type Error = InitError;

  // workflow://host/path[?tls=false]
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InitError::SchemeMismatch(format!(
        "期望方案 '{}', 实际方案 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let host = url
      .host_str()
      .ok_or_else(|| InitError::InvalidUrl(format!("缺少主机名: {}", url)))?;
    let tls = !url.query_pairs().any(|(k, v)| k == "tls" && v == "false");
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let api_key = url
      .query_pairs()
      .find(|(k, _)| k == "api_key")
      .map(|(_, v)| v.into_owned());

    Ok(WorkflowModelBuilder {
      endpoint: format!(
        "{}://{}{}{}",
        if tls { "https" } else { "http" },
        host,
        port,
        url.path()
      ),
      api_key,
      timeout: DEFAULT_TIMEOUT,
    })
  }
}

impl WorkflowModelBuilder {
  pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
    self.api_key = Some(api_key.into());
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// URL 中显式给出的 api_key 优先于配置
  pub fn with_settings(mut self, settings: &Settings) -> Self {
    if self.api_key.is_none() && !settings.workflow.api_key.is_empty() {
      self.api_key = Some(settings.workflow.api_key.clone());
    }
    self.timeout = settings.request_timeout;
    self
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  pub fn build(self) -> Result<WorkflowModel, InitError> {
    let api_key = self
      .api_key
      .filter(|k| !k.is_empty())
      .ok_or(InitError::MissingCredentials("workflow api_key"))?;
    info!("使用远程工作流: {}", self.endpoint);
    let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
    Ok(WorkflowModel {
      agent,
      endpoint: self.endpoint,
      api_key,
    })
  }
}

/// 从 `{outputs: [{predictions: {predictions: [...]}}]}` 中取出检测列表
pub fn parse_workflow_response(value: &serde_json::Value) -> Result<Vec<RawDetection>, InferenceError> {
  let predictions = value
    .get("outputs")
    .and_then(|outputs| outputs.get(0))
    .and_then(|output| output.get("predictions"))
    .and_then(|p| p.get("predictions"))
    .ok_or_else(|| InferenceError::Malformed("缺少 outputs[0].predictions.predictions".to_string()))?;
  parse_predictions(predictions)
}

impl Model for WorkflowModel {
  type Input = Frame;
  type Output = Vec<RawDetection>;
  type Error = InferenceError;

  fn infer(&self, input: &Frame) -> Result<Self::Output, Self::Error> {
    let payload = input.to_base64()?;
    let body = json!({
      "api_key": self.api_key,
      "inputs": {
        "image": { "type": "base64", "value": payload },
      },
    });

    debug!("提交第 {} 帧到远程工作流", input.index);
    let response = self
      .agent
      .post(&self.endpoint)
      .set("Content-Type", "application/json")
      .send_json(body)?;
    let value: serde_json::Value = response
      .into_json()
      .map_err(|e| InferenceError::Malformed(e.to_string()))?;
    parse_workflow_response(&value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builds_https_endpoint_from_url() {
    let url = Url::parse("workflow://serverless.example.com/infer/workflows/cap/custom-2").unwrap();
    let builder = WorkflowModelBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.endpoint(),
      "https://serverless.example.com/infer/workflows/cap/custom-2"
    );
  }

  #[test]
  fn plain_http_when_tls_disabled() {
    let url = Url::parse("workflow://127.0.0.1:9001/infer?tls=false").unwrap();
    let builder = WorkflowModelBuilder::from_url(&url).unwrap();
    assert_eq!(builder.endpoint(), "http://127.0.0.1:9001/infer");
  }

  #[test]
  fn missing_key_fails_to_build() {
    let url = Url::parse("workflow://serverless.example.com/infer").unwrap();
    let builder = WorkflowModelBuilder::from_url(&url).unwrap();
    assert!(matches!(
      builder.build(),
      Err(InitError::MissingCredentials(_))
    ));
  }

  #[test]
  fn extracts_nested_predictions() {
    let value = json!({
      "outputs": [{
        "predictions": {
          "image": {"width": 640, "height": 480},
          "predictions": [
            {"x": 100.0, "y": 50.0, "width": 20.0, "height": 10.0, "confidence": 0.91,
             "class": "rose", "class_id": 3, "detection_id": "a", "parent_id": "image"}
          ]
        }
      }],
      "profiler_trace": []
    });
    let dets = parse_workflow_response(&value).unwrap();
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].class, "rose");
    assert_eq!(dets[0].class_id, Some(3));
  }

  #[test]
  fn malformed_response_fails_the_request() {
    for value in [
      json!({}),
      json!({"outputs": []}),
      json!({"outputs": [{"predictions": {}}]}),
      json!({"outputs": [{"predictions": {"predictions": {}}}]}),
    ] {
      assert!(matches!(
        parse_workflow_response(&value),
        Err(InferenceError::Malformed(_))
      ));
    }
  }
}
