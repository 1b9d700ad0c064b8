// 该文件是 Huajia （花价） 项目的一部分。
// src/output/report.rs - 计价报告
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

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::pricing::PriceSummary;

#[derive(Debug, Clone, Serialize)]
pub struct PriceReport<'a> {
  pub generated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub summary: &'a PriceSummary,
}

impl<'a> PriceReport<'a> {
  pub fn new(summary: &'a PriceSummary) -> Self {
    Self {
      generated_at: Utc::now(),
      summary,
    }
  }

  pub fn write_json(&self, path: &Path) -> Result<(), std::io::Error> {
    let text = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
  }
}

/// 把计价结果输出到日志
pub fn log_summary(summary: &PriceSummary) {
  if summary.is_empty() {
    info!("未检测到对象");
    return;
  }
  for group in &summary.groups {
    info!(
      "  - {} x{} (平均置信度 {:.0}%) 单价 {} 小计 {}",
      group.class,
      group.count,
      group.average_confidence * 100.0,
      group.unit_price,
      group.total_price
    );
  }
  info!("共 {} 件，总价 {}", summary.total_items, summary.total_price);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pricing::{Color, GroupedDetection};

  #[test]
  fn report_serializes_summary_fields() {
    let summary = PriceSummary::from_groups(vec![GroupedDetection {
      class: "rose".to_string(),
      count: 2,
      average_confidence: 0.8,
      unit_price: 1900,
      total_price: 3800,
      color: Color([230, 25, 75]),
    }]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    PriceReport::new(&summary).write_json(&path).unwrap();

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["total_price"], 3800);
    assert_eq!(value["total_items"], 2);
    assert_eq!(value["groups"][0]["color"], "#e6194b");
    assert!(value["generated_at"].is_string());
  }
}
