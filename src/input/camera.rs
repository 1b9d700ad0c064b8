// 该文件是 Huajia （花价） 项目的一部分。
// src/input/camera.rs - 摄像头输入
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
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
    mpsc,
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, UserMessage, frame::Frame};

const V4L_SCHEME: &str = "v4l";
const STUB_SCHEME: &str = "stub";
const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const START_TIMEOUT: Duration = Duration::from_secs(5);
const STUB_FRAME_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Error, Debug)]
pub enum MediaAccessError {
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[error("V4L error: {0}")]
  V4lError(String),
  #[error("Unsupported pixel format: {0}")]
  UnsupportedPixelFormat(String),
  #[error("Invalid stub size: {0}")]
  InvalidSize(String),
  #[error("V4L support is not compiled in")]
  V4lDisabled,
  #[error("Camera did not start within {0:?}")]
  StartTimeout(Duration),
  #[error("Capture thread error: {0}")]
  Thread(String),
}

impl UserMessage for MediaAccessError {
  fn user_message(&self) -> String {
    "Failed to access camera. Please check permissions.".to_string()
  }
}

#[derive(Debug, Clone)]
enum CameraBackend {
  Stub,
  V4l(String),
}

/// 采集线程持续刷新“当前帧”，轮询循环按需读取
pub struct CameraInput {
  backend: CameraBackend,
  width: u32,
  height: u32,
  latest: Arc<Mutex<Option<Frame>>>,
  running: Arc<AtomicBool>,
  worker: Option<JoinHandle<()>>,
}

impl CameraInput {
  pub fn accepts_scheme(scheme: &str) -> bool {
    scheme == V4L_SCHEME || scheme == STUB_SCHEME
  }

  /// 合成图像的摄像头，用于测试与演示
  pub fn stub(width: u32, height: u32) -> Self {
    Self::with_backend(CameraBackend::Stub, width, height)
  }

  fn with_backend(backend: CameraBackend, width: u32, height: u32) -> Self {
    Self {
      backend,
      width,
      height,
      latest: Arc::new(Mutex::new(None)),
      running: Arc::new(AtomicBool::new(false)),
      worker: None,
    }
  }

  /// 期望的采集分辨率
  pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
    if matches!(self.backend, CameraBackend::V4l(_)) {
      self.width = width;
      self.height = height;
    }
    self
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// 获取设备并启动采集线程，收到第一帧后返回
  pub fn start(&mut self) -> Result<(), MediaAccessError> {
    if self.is_running() {
      return Ok(());
    }
    self.stop();

    let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u32), MediaAccessError>>();
    let latest = self.latest.clone();
    let running = self.running.clone();
    let backend = self.backend.clone();
    let (width, height) = (self.width, self.height);
    running.store(true, Ordering::SeqCst);

    let worker = thread::Builder::new()
      .name("camera-capture".to_string())
      .spawn(move || match backend {
        CameraBackend::Stub => capture_stub(width, height, latest, running, ready_tx),
        CameraBackend::V4l(device) => capture_v4l(&device, width, height, latest, running, ready_tx),
      })
      .map_err(|e| MediaAccessError::Thread(e.to_string()))?;
    self.worker = Some(worker);

    match ready_rx.recv_timeout(START_TIMEOUT) {
      Ok(Ok((w, h))) => {
        self.width = w;
        self.height = h;
        info!("摄像头已启动: {}x{}", w, h);
        Ok(())
      }
      Ok(Err(e)) => {
        self.stop();
        Err(e)
      }
      Err(_) => {
        self.stop();
        Err(MediaAccessError::StartTimeout(START_TIMEOUT))
      }
    }
  }

  /// 停止采集并释放设备
  pub fn stop(&mut self) {
    self.running.store(false, Ordering::SeqCst);
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        warn!("摄像头采集线程异常退出");
      }
      info!("摄像头已停止");
    }
    if let Ok(mut latest) = self.latest.lock() {
      *latest = None;
    }
  }

  /// 当前帧
  pub fn latest_frame(&self) -> Option<Frame> {
    self.latest.lock().ok()?.clone()
  }
}

impl Drop for CameraInput {
  fn drop(&mut self) {
    self.stop();
  }
}

impl FromUrl for CameraInput {
  type Error = MediaAccessError;

  // v4l:///dev/video0 或 stub://640x480
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      V4L_SCHEME => {
        let device = if url.path().is_empty() || url.path() == "/" {
          DEFAULT_DEVICE.to_string()
        } else {
          url.path().to_string()
        };
        Ok(Self::with_backend(
          CameraBackend::V4l(device),
          DEFAULT_WIDTH,
          DEFAULT_HEIGHT,
        ))
      }
      STUB_SCHEME => {
        let size = url.host_str().unwrap_or("");
        let (width, height) = if size.is_empty() {
          (DEFAULT_WIDTH, DEFAULT_HEIGHT)
        } else {
          parse_size(size).ok_or_else(|| MediaAccessError::InvalidSize(size.to_string()))?
        };
        Ok(Self::stub(width, height))
      }
      other => {
        error!("URI scheme mismatch: expected '{}' or '{}', found '{}'", V4L_SCHEME, STUB_SCHEME, other);
        Err(MediaAccessError::SchemeMismatch(other.to_string()))
      }
    }
  }
}

fn parse_size(size: &str) -> Option<(u32, u32)> {
  let (w, h) = size.split_once('x')?;
  let (w, h) = (w.parse::<u32>().ok()?, h.parse::<u32>().ok()?);
  (w > 0 && h > 0).then_some((w, h))
}

fn publish(latest: &Mutex<Option<Frame>>, frame: Frame) {
  if let Ok(mut slot) = latest.lock() {
    *slot = Some(frame);
  }
}

fn capture_stub(
  width: u32,
  height: u32,
  latest: Arc<Mutex<Option<Frame>>>,
  running: Arc<AtomicBool>,
  ready: mpsc::Sender<Result<(u32, u32), MediaAccessError>>,
) {
  let started = Instant::now();
  let mut index = 0u64;
  let mut ready = Some(ready);
  while running.load(Ordering::SeqCst) {
    let shift = (index % 256) as u32;
    let image = RgbImage::from_fn(width, height, |x, y| {
      image::Rgb([
        ((x + shift) % 256) as u8,
        ((y + shift) % 256) as u8,
        (shift % 256) as u8,
      ])
    });
    publish(&latest, Frame::new(image, index, started.elapsed().as_millis() as u64));
    if let Some(tx) = ready.take() {
      let _ = tx.send(Ok((width, height)));
    }
    index += 1;
    thread::sleep(STUB_FRAME_INTERVAL);
  }
}

#[cfg(not(feature = "v4l_input"))]
fn capture_v4l(
  _device: &str,
  _width: u32,
  _height: u32,
  _latest: Arc<Mutex<Option<Frame>>>,
  running: Arc<AtomicBool>,
  ready: mpsc::Sender<Result<(u32, u32), MediaAccessError>>,
) {
  running.store(false, Ordering::SeqCst);
  let _ = ready.send(Err(MediaAccessError::V4lDisabled));
}

#[cfg(feature = "v4l_input")]
fn capture_v4l(
  device_path: &str,
  width: u32,
  height: u32,
  latest: Arc<Mutex<Option<Frame>>>,
  running: Arc<AtomicBool>,
  ready: mpsc::Sender<Result<(u32, u32), MediaAccessError>>,
) {
  use v4l::{FourCC, buffer::Type, io::traits::CaptureStream, prelude::MmapStream, video::Capture};

  let v4l_err = |e: std::io::Error| MediaAccessError::V4lError(e.to_string());

  let opened = (|| {
    let mut device = v4l::Device::with_path(device_path).map_err(v4l_err)?;
    let mut format = device.format().map_err(v4l_err)?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"RGB3");
    let format = match device.set_format(&format) {
      Ok(format) => format,
      Err(e) => {
        warn!("设置摄像头格式失败 {}: {}", device_path, e);
        device.format().map_err(v4l_err)?
      }
    };
    Ok::<_, MediaAccessError>((device, format))
  })();

  let (mut device, format) = match opened {
    Ok(opened) => opened,
    Err(e) => {
      running.store(false, Ordering::SeqCst);
      let _ = ready.send(Err(e));
      return;
    }
  };

  let fourcc = format.fourcc;
  let (w, h) = (format.width, format.height);
  let mut stream = match MmapStream::with_buffers(&mut device, Type::VideoCapture, 4) {
    Ok(stream) => stream,
    Err(e) => {
      running.store(false, Ordering::SeqCst);
      let _ = ready.send(Err(v4l_err(e)));
      return;
    }
  };

  let started = Instant::now();
  let mut index = 0u64;
  let mut ready = Some(ready);
  while running.load(Ordering::SeqCst) {
    let converted = match stream.next() {
      Ok((buf, _meta)) => convert_buffer(buf, fourcc, w, h),
      Err(e) => Err(v4l_err(e)),
    };
    match converted {
      Ok(image) => {
        publish(&latest, Frame::new(image, index, started.elapsed().as_millis() as u64));
        if let Some(tx) = ready.take() {
          let _ = tx.send(Ok((w, h)));
        }
        index += 1;
      }
      Err(e) => {
        if let Some(tx) = ready.take() {
          running.store(false, Ordering::SeqCst);
          let _ = tx.send(Err(e));
          return;
        }
        warn!("摄像头采集失败: {}", e);
      }
    }
  }
}

#[cfg(feature = "v4l_input")]
fn convert_buffer(buf: &[u8], fourcc: v4l::FourCC, width: u32, height: u32) -> Result<RgbImage, MediaAccessError> {
  let pixels = (width * height) as usize;
  match &fourcc.repr {
    b"RGB3" => {
      let data = buf
        .get(..pixels * 3)
        .ok_or_else(|| MediaAccessError::V4lError("帧数据长度不足".to_string()))?;
      RgbImage::from_raw(width, height, data.to_vec())
        .ok_or_else(|| MediaAccessError::V4lError("帧数据长度不足".to_string()))
    }
    b"YUYV" => yuyv_to_rgb(buf, width, height),
    b"MJPG" => image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
      .map(|img| img.to_rgb8())
      .map_err(|e| MediaAccessError::V4lError(e.to_string())),
    other => Err(MediaAccessError::UnsupportedPixelFormat(
      String::from_utf8_lossy(other).into_owned(),
    )),
  }
}

/// YUYV 4:2:2 转 RGB（BT.601）
#[cfg_attr(not(feature = "v4l_input"), allow(dead_code))]
fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, MediaAccessError> {
  let expected = (width * height * 2) as usize;
  if buf.len() < expected {
    return Err(MediaAccessError::V4lError("帧数据长度不足".to_string()));
  }
  let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
  let mut data = Vec::with_capacity((width * height * 3) as usize);
  for chunk in buf[..expected].chunks_exact(4) {
    let (y0, u, y1, v) = (chunk[0] as f32, chunk[1] as f32 - 128.0, chunk[2] as f32, chunk[3] as f32 - 128.0);
    for y in [y0, y1] {
      data.push(clamp(y + 1.402 * v));
      data.push(clamp(y - 0.344 * u - 0.714 * v));
      data.push(clamp(y + 1.772 * u));
    }
  }
  RgbImage::from_raw(width, height, data)
    .ok_or_else(|| MediaAccessError::V4lError("帧数据长度不足".to_string()))
}
