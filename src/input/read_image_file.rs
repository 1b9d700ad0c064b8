// 该文件是 Huajia （花价） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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
  fs::File,
  io::Read,
  path::{Path, PathBuf},
};

use image::ImageFormat;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{EncodedSource, Frame},
  input::{ValidationError, check_upload},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("Validation error: {0}")]
  Validation(#[from] ValidationError),
}

// 判断类型所需的文件头长度
const SNIFF_LEN: u64 = 64;

/// 用户选择的文件
#[derive(Debug, Clone)]
pub struct UploadedFile {
  pub name: String,
  pub mime: String,
  pub bytes: Vec<u8>,
}

fn sniff_mime(name: &str, bytes: &[u8]) -> String {
  if let Ok(format) = image::guess_format(bytes) {
    return format.to_mime_type().to_string();
  }
  match Path::new(name).extension().and_then(|e| e.to_str()) {
    Some(ext) if ext.eq_ignore_ascii_case("txt") => "text/plain".to_string(),
    Some(_) => ImageFormat::from_path(name)
      .map(|f| f.to_mime_type().to_string())
      .unwrap_or_else(|_| "application/octet-stream".to_string()),
    None => "application/octet-stream".to_string(),
  }
}

impl UploadedFile {
  pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
    Self {
      name: name.into(),
      mime: mime.into(),
      bytes,
    }
  }

  /// 读取文件，MIME 类型优先按内容判断，其次按扩展名
  ///
  /// 超过 `max_bytes` 的文件只读取文件头，直接以校验错误拒绝
  pub fn from_path(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default();

    let size = std::fs::metadata(path)?.len();
    if size > max_bytes {
      let mut head = Vec::new();
      File::open(path)?.take(SNIFF_LEN).read_to_end(&mut head)?;
      check_upload(&sniff_mime(&name, &head), size, max_bytes)?;
    }

    let bytes = std::fs::read(path)?;
    let mime = sniff_mime(&name, &bytes);
    debug!("读取文件 {} ({}, {} 字节)", name, mime, bytes.len());
    Ok(Self { name, mime, bytes })
  }

  pub fn size(&self) -> u64 {
    self.bytes.len() as u64
  }

  pub fn validate(&self, max_bytes: u64) -> Result<(), ValidationError> {
    check_upload(&self.mime, self.size(), max_bytes)
  }

  pub fn decode(&self) -> Result<Frame, image::ImageError> {
    let image = image::load_from_memory(&self.bytes)?.to_rgb8();
    Ok(Frame::new(image, 0, 0).with_source(EncodedSource {
      mime: self.mime.clone(),
      bytes: self.bytes.clone(),
    }))
  }
}

const READ_IMAGE_FILE_SCHEME: &str = "image";

/// `image:///path/to/file` 形式的单帧输入，文件在取用时才读取
pub struct ImageFileInput {
  path: Option<PathBuf>,
  file: Option<UploadedFile>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    Ok(ImageFileInput {
      path: Some(PathBuf::from(url.path())),
      file: None,
    })
  }
}

impl ImageFileInput {
  pub fn from_file(file: UploadedFile) -> Self {
    Self {
      path: None,
      file: Some(file),
    }
  }

  /// 取出文件，按需从磁盘读取；只能取一次
  pub fn take_file(&mut self, max_bytes: u64) -> Result<Option<UploadedFile>, ImageFileInputError> {
    if let Some(file) = self.file.take() {
      return Ok(Some(file));
    }
    match self.path.take() {
      Some(path) => Ok(Some(UploadedFile::from_path(path, max_bytes)?)),
      None => Ok(None),
    }
  }

  /// 校验并解码为帧
  pub fn load(&mut self, max_bytes: u64) -> Result<Option<Frame>, ImageFileInputError> {
    match self.take_file(max_bytes)? {
      Some(file) => {
        file.validate(max_bytes)?;
        Ok(Some(file.decode()?))
      }
      None => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::RgbImage;
  use std::io::Cursor;

  fn png_bytes() -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::new(6, 4)
      .write_to(&mut buf, ImageFormat::Png)
      .unwrap();
    buf.into_inner()
  }

  #[test]
  fn sniffs_mime_from_content() {
    assert_eq!(sniff_mime("photo.bin", &png_bytes()), "image/png");
    assert_eq!(sniff_mime("notes.txt", b"hello"), "text/plain");
    assert_eq!(sniff_mime("noext", b"hello"), "application/octet-stream");
  }

  #[test]
  fn loads_image_from_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flower.png");
    std::fs::write(&path, png_bytes()).unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&format!("image://{}", url.path())).unwrap();
    let mut input = ImageFileInput::from_url(&url).unwrap();
    let frame = input.load(10 * 1024 * 1024).unwrap().unwrap();
    assert_eq!((frame.width(), frame.height()), (6, 4));
    assert_eq!(frame.source().unwrap().mime, "image/png");
    assert!(input.load(10 * 1024 * 1024).unwrap().is_none());
  }

  #[test]
  fn oversized_file_is_rejected_before_reading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huge.png");
    let file = std::fs::File::create(&path).unwrap();
    // 稀疏文件，不实际占用磁盘
    file.set_len(1 << 30).unwrap();
    drop(file);

    let err = UploadedFile::from_path(&path, 10 * 1024 * 1024).unwrap_err();
    assert!(matches!(
      err,
      ImageFileInputError::Validation(ValidationError::TooLarge { size, .. }) if size == 1 << 30
    ));
  }

  #[test]
  fn oversized_text_file_is_not_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, vec![b'a'; 4096]).unwrap();

    let mut input = ImageFileInput::from_url(&Url::parse(&format!("image://{}", path.display())).unwrap()).unwrap();
    assert!(matches!(
      input.take_file(1024),
      Err(ImageFileInputError::Validation(ValidationError::NotAnImage(_)))
    ));
  }

  #[test]
  fn text_file_fails_validation() {
    let mut input = ImageFileInput::from_file(UploadedFile::new("a.txt", "text/plain", b"hi".to_vec()));
    assert!(matches!(
      input.load(1024),
      Err(ImageFileInputError::Validation(ValidationError::NotAnImage(_)))
    ));
  }
}
