// 该文件是 Huajia （花价） 项目的一部分。
// src/frame.rs - 帧定义
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

use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{ImageFormat, RgbImage};

/// 帧对应的原始编码数据（上传文件时保留）
#[derive(Debug, Clone)]
pub struct EncodedSource {
  pub mime: String,
  pub bytes: Vec<u8>,
}

/// 统一的帧：上传图像或摄像头当前帧
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据，尺寸即原始尺寸
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
  source: Option<EncodedSource>,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
      source: None,
    }
  }

  pub fn with_source(mut self, source: EncodedSource) -> Self {
    self.source = Some(source);
    self
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn source(&self) -> Option<&EncodedSource> {
    self.source.as_ref()
  }

  /// 推理请求使用的 base64 载荷；有原始文件时直接编码原始字节，否则编码为 JPEG
  pub fn to_base64(&self) -> Result<String, image::ImageError> {
    match &self.source {
      Some(source) => Ok(STANDARD.encode(&source.bytes)),
      None => {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageFormat::Jpeg)?;
        Ok(STANDARD.encode(buf.into_inner()))
      }
    }
  }

  /// data URL 形式的载荷
  pub fn to_data_url(&self) -> Result<String, image::ImageError> {
    let mime = self
      .source
      .as_ref()
      .map(|s| s.mime.as_str())
      .unwrap_or("image/jpeg");
    Ok(format!("data:{};base64,{}", mime, self.to_base64()?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encodes_original_bytes_when_present() {
    let frame = Frame::new(RgbImage::new(2, 2), 0, 0).with_source(EncodedSource {
      mime: "image/png".to_string(),
      bytes: b"abc".to_vec(),
    });
    assert_eq!(frame.to_base64().unwrap(), "YWJj");
    assert_eq!(frame.to_data_url().unwrap(), "data:image/png;base64,YWJj");
  }

  #[test]
  fn encodes_pixels_as_jpeg_otherwise() {
    let frame = Frame::new(RgbImage::new(8, 8), 3, 300);
    let payload = STANDARD.decode(frame.to_base64().unwrap()).unwrap();
    assert_eq!(image::guess_format(&payload).unwrap(), ImageFormat::Jpeg);
    assert!(frame.to_data_url().unwrap().starts_with("data:image/jpeg;base64,"));
  }
}
