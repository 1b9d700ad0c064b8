// 该文件是 Huajia （花价） 项目的一部分。
// src/output.rs - 输出定义
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

use crate::{FromUrl, FromUrlWithScheme, pricing::PriceSummary};
use thiserror::Error;
use url::Url;

pub trait Render<Frame, Output> {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

pub mod draw;
pub mod report;

mod save_image_file;
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

mod directory_record;
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

use self::draw::Canvas;

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

const DISCARD_SCHEME: &str = "null";

pub enum OutputWrapper {
  SaveImageFileOutput(SaveImageFileOutput),
  DirectoryRecordOutput(DirectoryRecordOutput),
  /// `null://`，只在内存画布上绘制
  Discard,
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      DISCARD_SCHEME => Ok(OutputWrapper::Discard),
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl Render<Canvas, PriceSummary> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, canvas: &Canvas, summary: &PriceSummary) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(canvas, summary)
        .map_err(OutputError::from),
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_result(canvas, summary)
        .map_err(OutputError::from),
      OutputWrapper::Discard => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pricing::{Color, GroupedDetection};

  fn summary() -> PriceSummary {
    PriceSummary::from_groups(vec![GroupedDetection {
      class: "rose".to_string(),
      count: 1,
      average_confidence: 0.9,
      unit_price: 1900,
      total_price: 1900,
      color: Color::WHITE,
    }])
  }

  #[test]
  fn saves_canvas_and_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out/result.png");
    let url = Url::parse(&format!("image://{}?report", path.display())).unwrap();
    let output = OutputWrapper::from_url(&url).unwrap();

    output.render_result(&Canvas::new(8, 8), &summary()).unwrap();
    assert!(path.exists());
    assert!(path.with_extension("json").exists());
  }

  #[test]
  fn directory_record_skips_empty_results() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = OutputWrapper::from_url(&url).unwrap();

    output.render_result(&Canvas::new(8, 8), &PriceSummary::default()).unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    output.render_result(&Canvas::new(8, 8), &summary()).unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://localhost/live").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch)
    ));
  }
}
