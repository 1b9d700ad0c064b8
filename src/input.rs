// 该文件是 Huajia （花价） 项目的一部分。
// src/input.rs - 图像/摄像头输入
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

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::{FromUrl, FromUrlWithScheme, UserMessage, frame::Frame};

mod camera;
mod read_image_file;

pub use self::camera::{CameraInput, MediaAccessError};
pub use self::read_image_file::{ImageFileInput, ImageFileInputError, UploadedFile};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
  #[error("不是图像文件: {0}")]
  NotAnImage(String),
  #[error("文件过大: {size} 字节，上限 {max} 字节")]
  TooLarge { size: u64, max: u64 },
}

impl UserMessage for ValidationError {
  fn user_message(&self) -> String {
    match self {
      ValidationError::NotAnImage(_) => "Please select a valid image file".to_string(),
      ValidationError::TooLarge { max, .. } => {
        format!("File size must be less than {}MB", max / BYTES_PER_MB)
      }
    }
  }
}

/// 上传文件校验：MIME 类型必须以 `image/` 开头，且大小不超过上限
pub fn check_upload(mime: &str, size: u64, max: u64) -> Result<(), ValidationError> {
  if !mime.starts_with("image/") {
    return Err(ValidationError::NotAnImage(mime.to_string()));
  }
  if size > max {
    return Err(ValidationError::TooLarge { size, max });
  }
  Ok(())
}

static PREVIEW_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 上传图像的预览句柄，重置会话时释放
#[derive(Debug)]
pub struct PreviewHandle {
  id: u64,
  frame: Frame,
}

impl PreviewHandle {
  pub fn new(frame: Frame) -> Self {
    let id = PREVIEW_COUNTER.fetch_add(1, Ordering::Relaxed);
    debug!("创建预览 #{} ({}x{})", id, frame.width(), frame.height());
    Self { id, frame }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn frame(&self) -> &Frame {
    &self.frame
  }

  pub fn release(self) {
    debug!("释放预览 #{}", self.id);
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("Camera input error: {0}")]
  MediaAccessError(#[from] MediaAccessError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  Camera(CameraInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ImageFileInput::SCHEME => Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?)),
      s if CameraInput::accepts_scheme(s) => Ok(InputWrapper::Camera(CameraInput::from_url(url)?)),
      _ => Err(InputError::SchemeMismatch),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MB: u64 = 1024 * 1024;

  #[test]
  fn rejects_large_files() {
    let err = check_upload("image/png", 11 * MB, 10 * MB).unwrap_err();
    assert_eq!(
      err,
      ValidationError::TooLarge {
        size: 11 * MB,
        max: 10 * MB
      }
    );
    assert_eq!(err.user_message(), "File size must be less than 10MB");
  }

  #[test]
  fn rejects_non_images() {
    let err = check_upload("text/plain", 1024, 10 * MB).unwrap_err();
    assert_eq!(err, ValidationError::NotAnImage("text/plain".to_string()));
    assert_eq!(err.user_message(), "Please select a valid image file");
  }

  #[test]
  fn accepts_small_images() {
    assert!(check_upload("image/png", MB, 10 * MB).is_ok());
    assert!(check_upload("image/jpeg", 10 * MB, 10 * MB).is_ok());
  }

  #[test]
  fn dispatches_inputs_on_scheme() {
    let url = url::Url::parse("stub://320x240").unwrap();
    assert!(matches!(InputWrapper::from_url(&url), Ok(InputWrapper::Camera(_))));
    let url = url::Url::parse("rtsp://camera/stream").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }
}
