// 该文件是 Huajia （花价） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像检测与计价
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

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use url::Url;

use huajia::{
  FromUrl, UserMessage,
  config::Settings,
  input::ImageFileInput,
  model::ModelBuilder,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};

/// Huajia 单张图像参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理服务地址（workflow:// 或 worker://），缺省使用配置文件中的工作流
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 输入图像，例如 image:///path/to/flowers.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///tmp/result.png?report
  #[arg(long, value_name = "OUTPUT", default_value = "null://")]
  pub output: Url,
  /// 配置文件路径
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 等待模型初始化的最长时间（秒）
  #[arg(long, value_name = "SECONDS", default_value_t = 30)]
  pub init_timeout: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let settings = Settings::load(args.config.as_deref())?;
  let model_url = match args.model {
    Some(url) => url,
    None => Url::parse(&settings.workflow.endpoint)?,
  };

  info!("推理服务: {}", model_url);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = ImageFileInput::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let model = ModelBuilder::from_url(&model_url)?
    .with_settings(&settings)
    .build()?;
  if let Err(e) = model.wait_ready(Duration::from_secs(args.init_timeout)) {
    error!("{}", e);
    return Err(anyhow::anyhow!(e.user_message()));
  }

  OneShotTask::new(settings).run_task(input, model, output)
}
