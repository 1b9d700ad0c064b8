// 该文件是 Huajia （花价） 项目的一部分。
// src/pricing.rs - 检测结果归并与计价
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

use std::{collections::HashMap, fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::model::{BBox, RawDetection};

/// 价格表中兜底条目的键名
pub const FALLBACK_LABEL: &str = "unknown";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
  #[error("价格表缺少兜底条目 'unknown'")]
  MissingFallback,
  #[error("调色板为空")]
  EmptyPalette,
  #[error("无效的颜色值: {0}")]
  InvalidColor(String),
}

/// RGB 颜色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(pub [u8; 3]);

impl Color {
  pub const WHITE: Color = Color([255, 255, 255]);

  /// HSV 转 RGB，h 取值 [0, 360)
  pub fn from_hsv(h: f32, s: f32, v: f32) -> Self {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
      (c, x, 0.0)
    } else if h < 120.0 {
      (x, c, 0.0)
    } else if h < 180.0 {
      (0.0, c, x)
    } else if h < 240.0 {
      (0.0, x, c)
    } else if h < 300.0 {
      (x, 0.0, c)
    } else {
      (c, 0.0, x)
    };

    Color([
      ((r + m) * 255.0) as u8,
      ((g + m) * 255.0) as u8,
      ((b + m) * 255.0) as u8,
    ])
  }
}

impl FromStr for Color {
  type Err = PricingError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let hex = s.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(PricingError::InvalidColor(s.to_string()));
    }
    let channel = |i: usize| {
      u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| PricingError::InvalidColor(s.to_string()))
    };
    Ok(Color([channel(0)?, channel(2)?, channel(4)?]))
  }
}

impl fmt::Display for Color {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let [r, g, b] = self.0;
    write!(f, "#{:02x}{:02x}{:02x}", r, g, b)
  }
}

impl Serialize for Color {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

/// 默认调色板
pub const DEFAULT_PALETTE: [&str; 25] = [
  "#e6194b", "#3cb44b", "#ffe119", "#0082c8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
  "#d2f53c", "#fabebe", "#008080", "#e6beff", "#aa6e28", "#fffac8", "#800000", "#aaffc3",
  "#808000", "#ffd8b1", "#000080", "#808080", "#FFFFFF", "#000000", "#B0E0E6", "#FF69B4",
  "#7FFF00",
];

/// 按类别编号取色的调色板，非空
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
  colors: Vec<Color>,
}

impl Default for Palette {
  fn default() -> Self {
    let colors = DEFAULT_PALETTE
      .iter()
      .filter_map(|hex| hex.parse().ok())
      .collect();
    Self { colors }
  }
}

impl Palette {
  pub fn new(colors: Vec<Color>) -> Result<Self, PricingError> {
    if colors.is_empty() {
      return Err(PricingError::EmptyPalette);
    }
    Ok(Self { colors })
  }

  pub fn from_hex<S: AsRef<str>>(hexes: &[S]) -> Result<Self, PricingError> {
    let colors = hexes
      .iter()
      .map(|s| s.as_ref().parse())
      .collect::<Result<Vec<Color>, _>>()?;
    Self::new(colors)
  }

  pub fn len(&self) -> usize {
    self.colors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.colors.is_empty()
  }

  /// 有类别编号时按编号取模取色，否则按类别名生成
  pub fn color_for(&self, class_id: Option<u32>, label: &str) -> Color {
    match class_id {
      Some(id) => self.colors[id as usize % self.colors.len()],
      None => procedural_color(label),
    }
  }
}

/// 由类别名生成稳定的颜色（FNV-1a 哈希映射到色相）
pub fn procedural_color(label: &str) -> Color {
  let mut hash: u32 = 0x811c_9dc5;
  for byte in label.bytes() {
    hash ^= byte as u32;
    hash = hash.wrapping_mul(0x0100_0193);
  }
  let hue = (hash % 360) as f32;
  Color::from_hsv(hue, 0.8, 0.9)
}

/// 类别名（小写）到单价的映射，必含兜底条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTable {
  prices: HashMap<String, u64>,
  fallback: u64,
}

impl Default for PriceTable {
  fn default() -> Self {
    let prices = HashMap::from([("rose".to_string(), 1900), (FALLBACK_LABEL.to_string(), 1200)]);
    Self {
      prices,
      fallback: 1200,
    }
  }
}

impl PriceTable {
  pub fn from_map<I, K>(entries: I) -> Result<Self, PricingError>
  where
    I: IntoIterator<Item = (K, u64)>,
    K: AsRef<str>,
  {
    let prices: HashMap<String, u64> = entries
      .into_iter()
      .map(|(k, v)| (k.as_ref().to_lowercase(), v))
      .collect();
    let fallback = *prices
      .get(FALLBACK_LABEL)
      .ok_or(PricingError::MissingFallback)?;
    Ok(Self { prices, fallback })
  }

  pub fn unit_price(&self, label: &str) -> u64 {
    self
      .prices
      .get(&label.to_lowercase())
      .copied()
      .unwrap_or(self.fallback)
  }

  pub fn fallback(&self) -> u64 {
    self.fallback
  }
}

/// 单个已着色的检测对象
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub class: String,
  pub class_id: Option<u32>,
  pub confidence: f32,
  pub bbox: BBox,
  pub color: Color,
}

/// 同一类别的聚合结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupedDetection {
  pub class: String,
  pub count: usize,
  pub average_confidence: f32,
  pub unit_price: u64,
  pub total_price: u64,
  pub color: Color,
}

/// 为原始检测结果分配颜色
pub fn colorize(raw: &[RawDetection], palette: &Palette) -> Vec<Detection> {
  raw
    .iter()
    .map(|r| Detection {
      class: r.class.clone(),
      class_id: r.class_id,
      confidence: r.confidence,
      bbox: r.bbox,
      color: palette.color_for(r.class_id, &r.class),
    })
    .collect()
}

/// 按类别归并，顺序为类别首次出现的顺序
pub fn group_detections(detections: &[Detection], prices: &PriceTable) -> Vec<GroupedDetection> {
  let mut index: HashMap<&str, usize> = HashMap::new();
  let mut partitions: Vec<Vec<&Detection>> = Vec::new();

  for det in detections {
    let slot = *index.entry(det.class.as_str()).or_insert_with(|| {
      partitions.push(Vec::new());
      partitions.len() - 1
    });
    partitions[slot].push(det);
  }

  partitions
    .into_iter()
    .map(|members| {
      let first = members[0];
      let count = members.len();
      let average_confidence = members.iter().map(|d| d.confidence).sum::<f32>() / count as f32;
      let unit_price = prices.unit_price(&first.class);
      GroupedDetection {
        class: first.class.clone(),
        count,
        average_confidence,
        unit_price,
        total_price: unit_price * count as u64,
        color: first.color,
      }
    })
    .collect()
}

/// 一次推理结果的计价汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceSummary {
  pub groups: Vec<GroupedDetection>,
  pub total_items: usize,
  pub total_price: u64,
}

impl PriceSummary {
  pub fn from_groups(groups: Vec<GroupedDetection>) -> Self {
    let total_items = groups.iter().map(|g| g.count).sum();
    let total_price = groups.iter().map(|g| g.total_price).sum();
    Self {
      groups,
      total_items,
      total_price,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }
}
