// 该文件是 Huajia （花价） 项目的一部分。
// src/bin/simple_camera.rs - 摄像头实时检测与计价
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use huajia::{
  FromUrl,
  config::Settings,
  input::CameraInput,
  model::ModelBuilder,
  output::OutputWrapper,
  task::{ContinuousTask, Task},
};

/// Huajia 摄像头参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理服务地址（workflow:// 或 worker://），缺省使用配置文件中的嵌入式模型
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 摄像头，例如 v4l:///dev/video0 或 stub://640x480
  #[arg(long, value_name = "SOURCE", default_value = "v4l:///dev/video0")]
  pub input: Url,
  /// 输出路径，例如 folder:///var/lib/huajia
  #[arg(long, value_name = "OUTPUT", default_value = "null://")]
  pub output: Url,
  /// 配置文件路径
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 处理指定帧数后退出
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<u64>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let settings = Settings::load(args.config.as_deref())?;
  let model_url = match args.model {
    Some(url) => url,
    None => Url::parse(&settings.worker.url())?,
  };

  info!("推理服务: {}", model_url);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let camera = CameraInput::from_url(&args.input)?
    .with_resolution(settings.camera_width, settings.camera_height);
  let output = OutputWrapper::from_url(&args.output)?;
  // 嵌入式模型在后台初始化，就绪前轮询会跳过推理
  let model = ModelBuilder::from_url(&model_url)?
    .with_settings(&settings)
    .build()?;

  ContinuousTask::new(settings)
    .with_tick_limit(args.frame_number)
    .run_task(camera, model, output)
}
