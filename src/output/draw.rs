// 该文件是 Huajia （花价） 项目的一部分。
// src/output/draw.rs - 检测结果叠加绘制
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
  path::Path,
  sync::atomic::{AtomicBool, Ordering},
};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::warn;

use crate::{
  config::RenderSettings,
  pricing::{Color, Detection},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 14.0;
const LABEL_BOX_HEIGHT: u32 = 24;
const LABEL_BOX_OFFSET: i32 = 30; // 标签背景位于边框上方
const LABEL_BOX_PADDING: u32 = 8;
const LABEL_TEXT_INSET: i32 = 2;
const LABEL_CHAR_WIDTH: f32 = 8.0; // 无字体时每字符平均宽度（粗略估计）
const DEFAULT_LINE_WIDTH: u32 = 3;
const MAX_LINE_WIDTH: u32 = 32;

/// 画布，尺寸与源图像原始尺寸一致
#[derive(Debug, Clone, PartialEq)]
pub struct Canvas {
  image: RgbImage,
}

impl Default for Canvas {
  fn default() -> Self {
    Self::new(0, 0)
  }
}

impl Canvas {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      image: RgbImage::new(width, height),
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  /// 清空画布
  pub fn clear(&mut self) {
    self.image.pixels_mut().for_each(|p| *p = Rgb([0, 0, 0]));
  }

  pub fn is_blank(&self) -> bool {
    self.image.pixels().all(|p| p.0 == [0, 0, 0])
  }
}

fn rgb(color: Color) -> Rgb<u8> {
  Rgb(color.0)
}

/// 标签文本：类别名与四舍五入后的百分比置信度
pub fn label_text(detection: &Detection) -> String {
  format!(
    "{} {}%",
    detection.class,
    (detection.confidence * 100.0).round() as i64
  )
}

/// 叠加层绘制器
pub struct OverlayRenderer {
  font: Option<FontArc>,
  font_size: f32,
  line_width: u32,
  warned: AtomicBool,
}

impl Default for OverlayRenderer {
  fn default() -> Self {
    Self::with_font(None, DEFAULT_LINE_WIDTH)
  }
}

impl OverlayRenderer {
  pub fn new(settings: &RenderSettings) -> Self {
    let font = settings.font.as_deref().and_then(load_font);
    Self::with_font(font, settings.line_width)
  }

  pub fn with_font(font: Option<FontArc>, line_width: u32) -> Self {
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      line_width: line_width.clamp(1, MAX_LINE_WIDTH),
      warned: AtomicBool::new(false),
    }
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 先绘制源图像，再逐个绘制边框与标签；每次完整重绘
  pub fn render(&self, canvas: &mut Canvas, source: &RgbImage, detections: &[Detection]) {
    canvas.image.clone_from(source);
    for detection in detections {
      self.draw_detection(&mut canvas.image, detection);
    }
  }

  fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
    let color = rgb(detection.color);
    let bbox = detection.bbox;
    if !bbox.is_finite() {
      warn!("忽略非法边界框: {:?}", bbox);
      return;
    }
    let (image_w, image_h) = (image.width() as f32, image.height() as f32);
    let (left, top) = bbox.top_left();
    let (right, bottom) = (left + bbox.width.max(1.0), top + bbox.height.max(1.0));
    if right <= 0.0 || bottom <= 0.0 || left >= image_w || top >= image_h {
      return;
    }

    // 先在浮点下裁剪到画布外一圈，再转为整数，被裁掉的边仍落在画布之外
    let margin = self.line_width as f32 + 1.0;
    let left = left.max(-margin).round();
    let top = top.max(-margin).round();
    let right = right.min(image_w + margin).round();
    let bottom = bottom.min(image_h + margin).round();
    let (x, y) = (left as i32, top as i32);
    let (w, h) = (
      (right - left).max(1.0) as i32,
      (bottom - top).max(1.0) as i32,
    );

    // 边框线宽向内外各扩展一半
    let half = (self.line_width / 2) as i32;
    for t in 0..self.line_width as i32 {
      let offset = t - half;
      let (rw, rh) = (w - 2 * offset, h - 2 * offset);
      if rw <= 0 || rh <= 0 {
        continue;
      }
      let rect = Rect::at(x + offset, y + offset).of_size(rw as u32, rh as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = label_text(detection);
    let scale = PxScale::from(self.font_size);
    let text_width = match &self.font {
      Some(font) => text_size(scale, font, &label).0,
      None => (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as u32,
    }
    .min(image.width());

    let label_x = x - LABEL_TEXT_INSET;
    let label_y = (y - LABEL_BOX_OFFSET).max(0);
    let rect = Rect::at(label_x, label_y).of_size(text_width + LABEL_BOX_PADDING, LABEL_BOX_HEIGHT);
    draw_filled_rect_mut(image, rect, color);

    match &self.font {
      Some(font) => draw_text_mut(
        image,
        rgb(Color::WHITE),
        x + LABEL_TEXT_INSET,
        label_y + (LABEL_BOX_HEIGHT as i32 - self.font_size as i32) / 2,
        scale,
        font,
        &label,
      ),
      None => {
        if !self.warned.swap(true, Ordering::Relaxed) {
          warn!("未加载字体，标签文字将不会绘制");
        }
      }
    }
  }
}

fn load_font(path: &Path) -> Option<FontArc> {
  let data = match std::fs::read(path) {
    Ok(data) => data,
    Err(e) => {
      warn!("无法读取字体文件 {}: {}", path.display(), e);
      return None;
    }
  };
  match FontArc::try_from_vec(data) {
    Ok(font) => Some(font),
    Err(e) => {
      warn!("无法解析字体文件 {}: {}", path.display(), e);
      None
    }
  }
}
