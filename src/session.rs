// 该文件是 Huajia （花价） 项目的一部分。
// src/session.rs - 检测会话
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

use std::{sync::Arc, time::Duration};

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  UserMessage,
  config::Settings,
  input::{CameraInput, MediaAccessError, PreviewHandle, UploadedFile, ValidationError},
  model::{FrameModel, InferenceError, RawDetection},
  output::{
    OutputWrapper, Render,
    draw::{Canvas, OverlayRenderer},
  },
  pricing::{Detection, Palette, PriceSummary, PriceTable, colorize, group_detections},
  task::{LoopState, PollingLoop},
};

/// 计价与绘制的组合，上传与摄像头两条流程共用
pub struct DetectionPipeline {
  prices: PriceTable,
  palette: Palette,
  renderer: OverlayRenderer,
}

impl DetectionPipeline {
  pub fn new(prices: PriceTable, palette: Palette, renderer: OverlayRenderer) -> Self {
    Self {
      prices,
      palette,
      renderer,
    }
  }

  pub fn from_settings(settings: &Settings) -> Self {
    Self::new(
      settings.prices.clone(),
      settings.render.palette.clone(),
      OverlayRenderer::new(&settings.render),
    )
  }

  /// 着色、归并并计价
  pub fn price(&self, raw: &[RawDetection]) -> (Vec<Detection>, PriceSummary) {
    let detections = colorize(raw, &self.palette);
    let summary = PriceSummary::from_groups(group_detections(&detections, &self.prices));
    (detections, summary)
  }

  pub fn draw(&self, canvas: &mut Canvas, source: &RgbImage, detections: &[Detection]) {
    self.renderer.render(canvas, source, detections);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
  Select,
  Upload,
  Camera,
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("文件校验失败: {0}")]
  Validation(#[from] ValidationError),
  #[error("图像解码失败: {0}")]
  Decode(#[from] image::ImageError),
  #[error("推理失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("摄像头错误: {0}")]
  Camera(#[from] MediaAccessError),
  #[error("未配置摄像头")]
  NoCamera,
}

impl UserMessage for SessionError {
  fn user_message(&self) -> String {
    match self {
      SessionError::Validation(e) => e.user_message(),
      SessionError::Decode(_) => "Please select a valid image file".to_string(),
      SessionError::Inference(e) => e.user_message(),
      SessionError::Camera(e) => e.user_message(),
      SessionError::NoCamera => "Failed to access camera. Please check permissions.".to_string(),
    }
  }
}

/// 一次检测会话：上传流程在调用线程内同步完成，摄像头流程交给轮询循环
pub struct DetectionSession<M: FrameModel + 'static> {
  model: Arc<M>,
  pipeline: Arc<DetectionPipeline>,
  output: Arc<OutputWrapper>,
  max_upload_bytes: u64,
  poll_interval: Duration,

  mode: SessionMode,
  generation: u64,
  preview: Option<PreviewHandle>,
  canvas: Canvas,
  detections: Vec<Detection>,
  summary: PriceSummary,
  last_error: Option<String>,
  camera: Option<PollingLoop<M>>,
}

impl<M: FrameModel + 'static> DetectionSession<M> {
  pub fn new(model: M, settings: &Settings) -> Self {
    Self {
      model: Arc::new(model),
      pipeline: Arc::new(DetectionPipeline::from_settings(settings)),
      output: Arc::new(OutputWrapper::Discard),
      max_upload_bytes: settings.max_upload_bytes,
      poll_interval: settings.poll_interval,
      mode: SessionMode::Select,
      generation: 0,
      preview: None,
      canvas: Canvas::default(),
      detections: Vec::new(),
      summary: PriceSummary::default(),
      last_error: None,
      camera: None,
    }
  }

  pub fn with_pipeline(mut self, pipeline: DetectionPipeline) -> Self {
    self.pipeline = Arc::new(pipeline);
    self
  }

  pub fn with_output(mut self, output: OutputWrapper) -> Self {
    self.output = Arc::new(output);
    self
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn mode(&self) -> SessionMode {
    self.mode
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn last_error(&self) -> Option<&str> {
    self.last_error.as_deref()
  }

  pub fn preview(&self) -> Option<&PreviewHandle> {
    self.preview.as_ref()
  }

  pub fn canvas(&self) -> Canvas {
    match (&self.mode, &self.camera) {
      (SessionMode::Camera, Some(camera)) => camera.canvas(),
      _ => self.canvas.clone(),
    }
  }

  pub fn detections(&self) -> Vec<Detection> {
    match (&self.mode, &self.camera) {
      (SessionMode::Camera, Some(camera)) => camera.detections(),
      _ => self.detections.clone(),
    }
  }

  pub fn summary(&self) -> PriceSummary {
    match (&self.mode, &self.camera) {
      (SessionMode::Camera, Some(camera)) => camera.summary(),
      _ => self.summary.clone(),
    }
  }

  /// 用户选择了一个文件：校验、预览、推理、计价、绘制
  pub fn select_file(&mut self, file: UploadedFile) -> Result<(), SessionError> {
    self.reset();

    if let Err(e) = file.validate(self.max_upload_bytes) {
      return Err(self.fail(e.into()));
    }
    let frame = match file.decode() {
      Ok(frame) => frame,
      Err(e) => return Err(self.fail(e.into())),
    };
    info!("已选择文件 {} ({}x{})", file.name, frame.width(), frame.height());

    self.mode = SessionMode::Upload;
    let preview = PreviewHandle::new(frame);
    let result = self.model.infer(preview.frame());

    let outcome = match result {
      Ok(raw) => {
        let (detections, summary) = self.pipeline.price(&raw);
        self
          .pipeline
          .draw(&mut self.canvas, &preview.frame().image, &detections);
        info!("检测到 {} 个对象，总价 {}", detections.len(), summary.total_price);
        self.detections = detections;
        self.summary = summary;
        if let Err(e) = self.output.render_result(&self.canvas, &self.summary) {
          warn!("输出结果失败: {}", e);
        }
        Ok(())
      }
      Err(e) => {
        // 推理失败时仍显示预览图
        self.pipeline.draw(&mut self.canvas, &preview.frame().image, &[]);
        Err(e.into())
      }
    };
    self.preview = Some(preview);
    outcome.map_err(|e| self.fail(e))
  }

  /// 绑定摄像头，之后可通过 [`DetectionSession::start_camera`] 启动
  pub fn attach_camera(&mut self, camera: CameraInput) {
    if let Some(previous) = self.camera.take() {
      previous.reset();
    }
    self.camera = Some(
      PollingLoop::with_output(
        self.model.clone(),
        camera,
        self.pipeline.clone(),
        self.poll_interval,
        self.output.clone(),
      ),
    );
  }

  pub fn start_camera(&mut self) -> Result<(), SessionError> {
    if self.camera.is_none() {
      return Err(self.fail(SessionError::NoCamera));
    }
    if self.mode != SessionMode::Camera {
      self.reset();
    }

    let started = match &self.camera {
      Some(camera) => camera.start(),
      None => return Err(self.fail(SessionError::NoCamera)),
    };
    match started {
      Ok(()) => {
        self.mode = SessionMode::Camera;
        Ok(())
      }
      Err(e) => Err(self.fail(e.into())),
    }
  }

  pub fn pause_camera(&self) -> bool {
    self.camera.as_ref().is_some_and(PollingLoop::pause)
  }

  pub fn resume_camera(&self) -> bool {
    self.camera.as_ref().is_some_and(PollingLoop::resume)
  }

  pub fn camera_state(&self) -> Option<LoopState> {
    self.camera.as_ref().map(PollingLoop::state)
  }

  /// 已应用到画布的轮询次数
  pub fn camera_ticks(&self) -> u64 {
    self.camera.as_ref().map_or(0, PollingLoop::applied_ticks)
  }

  /// 释放预览、停止摄像头、清空画布与检测结果
  pub fn reset(&mut self) {
    if let Some(preview) = self.preview.take() {
      preview.release();
    }
    if let Some(camera) = &self.camera {
      camera.reset();
    }
    self.canvas.clear();
    self.detections.clear();
    self.summary = PriceSummary::default();
    self.last_error = None;
    self.mode = SessionMode::Select;
    self.generation += 1;
  }

  fn fail(&mut self, err: SessionError) -> SessionError {
    error!("{}", err.log_message());
    self.last_error = Some(err.user_message());
    err
  }
}
