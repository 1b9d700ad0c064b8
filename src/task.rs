// 该文件是 Huajia （花价） 项目的一部分。
// src/task.rs - 任务与轮询循环
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
  io::BufRead,
  panic::{self, AssertUnwindSafe},
  str::FromStr,
  sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc},
  thread::{self, JoinHandle},
  time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
  UserMessage,
  config::Settings,
  input::{CameraInput, ImageFileInput, ImageFileInputError, MediaAccessError},
  model::FrameModel,
  output::{OutputError, OutputWrapper, Render, draw::Canvas, report::log_summary},
  pricing::{Detection, PriceSummary},
  session::{DetectionPipeline, DetectionSession},
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
  Stopped,
  Running,
  Paused,
}

/// 轮询循环的输出端
pub trait LoopOutput: Render<Canvas, PriceSummary, Error = OutputError> + Send + Sync {}

impl<T> LoopOutput for T where T: Render<Canvas, PriceSummary, Error = OutputError> + Send + Sync {}

struct LoopInner {
  state: LoopState,
  // 每次启动或重置都会递增，作为本轮循环的取消令牌
  generation: u64,
  canvas: Canvas,
  detections: Vec<Detection>,
  summary: PriceSummary,
  applied_ticks: u64,
}

struct LoopShared {
  inner: Mutex<LoopInner>,
  wake: Condvar,
}

impl LoopShared {
  fn lock(&self) -> MutexGuard<'_, LoopInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// 摄像头模式下的轮询循环：Stopped -> Running <-> Paused -> Stopped
pub struct PollingLoop<M: FrameModel + 'static, O: LoopOutput + 'static = OutputWrapper> {
  model: Arc<M>,
  pipeline: Arc<DetectionPipeline>,
  output: Arc<O>,
  camera: Arc<Mutex<CameraInput>>,
  shared: Arc<LoopShared>,
  interval: Duration,
  ticker: Mutex<Option<JoinHandle<()>>>,
}

fn lock_camera(camera: &Mutex<CameraInput>) -> MutexGuard<'_, CameraInput> {
  camera.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M: FrameModel + 'static> PollingLoop<M> {
  pub fn new(
    model: Arc<M>,
    camera: CameraInput,
    pipeline: Arc<DetectionPipeline>,
    interval: Duration,
  ) -> Self {
    Self::with_output(model, camera, pipeline, interval, Arc::new(OutputWrapper::Discard))
  }
}

impl<M: FrameModel + 'static, O: LoopOutput + 'static> PollingLoop<M, O> {
  /// 每次应用结果后交给 `output` 输出
  pub fn with_output(
    model: Arc<M>,
    camera: CameraInput,
    pipeline: Arc<DetectionPipeline>,
    interval: Duration,
    output: Arc<O>,
  ) -> Self {
    Self {
      model,
      pipeline,
      output,
      camera: Arc::new(Mutex::new(camera)),
      shared: Arc::new(LoopShared {
        inner: Mutex::new(LoopInner {
          state: LoopState::Stopped,
          generation: 0,
          canvas: Canvas::default(),
          detections: Vec::new(),
          summary: PriceSummary::default(),
          applied_ticks: 0,
        }),
        wake: Condvar::new(),
      }),
      interval,
      ticker: Mutex::new(None),
    }
  }

  /// 获取摄像头，收到第一帧后开始轮询
  pub fn start(&self) -> Result<(), MediaAccessError> {
    if self.state() != LoopState::Stopped {
      return Ok(());
    }
    lock_camera(&self.camera).start()?;

    let generation = {
      let mut inner = self.shared.lock();
      inner.generation += 1;
      inner.state = LoopState::Running;
      inner.generation
    };

    let ticker = Ticker {
      model: self.model.clone(),
      pipeline: self.pipeline.clone(),
      output: self.output.clone(),
      camera: self.camera.clone(),
      shared: self.shared.clone(),
      interval: self.interval,
      generation,
    };
    let handle = thread::Builder::new()
      .name(format!("polling-loop-{}", generation))
      .spawn(move || ticker.run());
    match handle {
      Ok(handle) => {
        // 上一轮的线程会在检查令牌后自行退出
        *self.ticker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("轮询循环已启动，间隔 {:?}", self.interval);
        Ok(())
      }
      Err(e) => {
        self.reset();
        Err(MediaAccessError::Thread(e.to_string()))
      }
    }
  }

  /// 暂停后不再调度新的轮询，画布保留最后一次结果
  pub fn pause(&self) -> bool {
    let mut inner = self.shared.lock();
    if inner.state != LoopState::Running {
      return false;
    }
    inner.state = LoopState::Paused;
    self.shared.wake.notify_all();
    info!("轮询循环已暂停");
    true
  }

  pub fn resume(&self) -> bool {
    let mut inner = self.shared.lock();
    if inner.state != LoopState::Paused {
      return false;
    }
    inner.state = LoopState::Running;
    self.shared.wake.notify_all();
    info!("轮询循环已恢复");
    true
  }

  /// 停止摄像头，清空画布与检测结果；进行中的推理结果将被丢弃
  pub fn reset(&self) {
    {
      let mut inner = self.shared.lock();
      inner.state = LoopState::Stopped;
      inner.generation += 1;
      inner.canvas.clear();
      inner.detections.clear();
      inner.summary = PriceSummary::default();
      self.shared.wake.notify_all();
    }
    lock_camera(&self.camera).stop();
    info!("轮询循环已重置");
  }

  pub fn state(&self) -> LoopState {
    self.shared.lock().state
  }

  pub fn canvas(&self) -> Canvas {
    self.shared.lock().canvas.clone()
  }

  pub fn detections(&self) -> Vec<Detection> {
    self.shared.lock().detections.clone()
  }

  pub fn summary(&self) -> PriceSummary {
    self.shared.lock().summary.clone()
  }

  pub fn applied_ticks(&self) -> u64 {
    self.shared.lock().applied_ticks
  }

  /// 当前一轮的轮询线程是否仍在运行
  pub fn is_ticking(&self) -> bool {
    self
      .ticker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }
}

impl<M: FrameModel + 'static, O: LoopOutput + 'static> Drop for PollingLoop<M, O> {
  fn drop(&mut self) {
    if self.state() != LoopState::Stopped {
      self.reset();
    }
  }
}

struct Ticker<M: FrameModel + 'static, O: LoopOutput + 'static> {
  model: Arc<M>,
  pipeline: Arc<DetectionPipeline>,
  output: Arc<O>,
  camera: Arc<Mutex<CameraInput>>,
  shared: Arc<LoopShared>,
  interval: Duration,
  generation: u64,
}

impl<M: FrameModel + 'static, O: LoopOutput + 'static> Ticker<M, O> {
  fn run(self) {
    debug!("轮询线程 #{} 启动", self.generation);
    while self.wait_turn() {
      // 单次轮询出错不应终止循环；锁在中毒后仍可继续使用
      if panic::catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
        error!("轮询线程 #{} 本次轮询异常中止，继续下一次", self.generation);
      }
      self.sleep();
    }
    debug!("轮询线程 #{} 退出", self.generation);
  }

  fn is_current(&self, inner: &LoopInner) -> bool {
    inner.generation == self.generation && inner.state != LoopState::Stopped
  }

  // 每次轮询开始前检查状态，暂停时阻塞等待
  fn wait_turn(&self) -> bool {
    let mut inner = self.shared.lock();
    loop {
      if !self.is_current(&inner) {
        return false;
      }
      if inner.state == LoopState::Running {
        return true;
      }
      inner = self
        .shared
        .wake
        .wait(inner)
        .unwrap_or_else(PoisonError::into_inner);
    }
  }

  fn tick(&self) {
    if !self.model.is_ready() {
      debug!("模型尚未就绪，跳过本次轮询");
      return;
    }
    let Some(frame) = lock_camera(&self.camera).latest_frame() else {
      debug!("暂无摄像头画面，跳过本次轮询");
      return;
    };

    let raw = match self.model.infer(&frame) {
      Ok(raw) => raw,
      Err(e) => {
        error!("第 {} 帧推理失败: {}", frame.index, e.log_message());
        return;
      }
    };
    let (detections, summary) = self.pipeline.price(&raw);

    let (canvas, summary) = {
      let mut inner = self.shared.lock();
      if !self.is_current(&inner) || inner.state != LoopState::Running {
        debug!("丢弃过期的推理结果 (第 {} 帧)", frame.index);
        return;
      }
      self
        .pipeline
        .draw(&mut inner.canvas, &frame.image, &detections);
      inner.detections = detections;
      inner.summary = summary;
      inner.applied_ticks += 1;
      debug!(
        "第 {} 帧: {} 件，总价 {}",
        frame.index, inner.summary.total_items, inner.summary.total_price
      );
      (inner.canvas.clone(), inner.summary.clone())
    };

    // 写盘可能较慢，不持有状态锁
    if let Err(e) = self.output.render_result(&canvas, &summary) {
      warn!("输出结果失败: {}", e);
    }
  }

  fn sleep(&self) {
    let inner = self.shared.lock();
    let _ = self
      .shared
      .wake
      .wait_timeout_while(inner, self.interval, |inner| {
        inner.generation == self.generation && inner.state == LoopState::Running
      });
  }
}

/// 上传流程：读取一张图像，推理一次并输出
pub struct OneShotTask {
  settings: Settings,
}

impl OneShotTask {
  pub fn new(settings: Settings) -> Self {
    Self { settings }
  }
}

impl<M: FrameModel + 'static> Task<ImageFileInput, M, OutputWrapper> for OneShotTask {
  type Error = anyhow::Error;

  fn run_task(self, mut input: ImageFileInput, model: M, output: OutputWrapper) -> Result<(), Self::Error> {
    info!("开始任务...");
    let file = match input.take_file(self.settings.max_upload_bytes) {
      Ok(Some(file)) => file,
      Ok(None) => return Err(anyhow::anyhow!("没有输入文件")),
      Err(ImageFileInputError::Validation(e)) => return Err(anyhow::anyhow!(e.user_message())),
      Err(e) => return Err(e.into()),
    };

    let mut session = DetectionSession::new(model, &self.settings).with_output(output);
    let now = std::time::Instant::now();
    if let Err(e) = session.select_file(file) {
      return Err(anyhow::anyhow!(e.user_message()));
    }
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    log_summary(&session.summary());

    Ok(())
  }
}

/// 摄像头交互命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Start,
  Pause,
  Resume,
  Reset,
  Status,
  Retry,
  Quit,
}

impl FromStr for Command {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "start" | "s" => Ok(Command::Start),
      "pause" | "p" => Ok(Command::Pause),
      "resume" | "r" => Ok(Command::Resume),
      "reset" => Ok(Command::Reset),
      "status" | "?" => Ok(Command::Status),
      "retry" => Ok(Command::Retry),
      "quit" | "q" | "exit" => Ok(Command::Quit),
      other => Err(format!("未知命令: {}", other)),
    }
  }
}

/// 摄像头流程：启动轮询循环，从标准输入读取控制命令，Ctrl-C 退出
#[derive(Debug)]
pub struct ContinuousTask {
  settings: Settings,
  tick_limit: Option<u64>,
}

impl ContinuousTask {
  pub fn new(settings: Settings) -> Self {
    Self {
      settings,
      tick_limit: None,
    }
  }

  /// 应用指定次数的轮询结果后退出
  pub fn with_tick_limit(mut self, tick_limit: Option<u64>) -> Self {
    self.tick_limit = tick_limit;
    self
  }
}

const STATUS_POLL: Duration = Duration::from_millis(200);

fn spawn_stdin_reader(tx: mpsc::Sender<Command>) {
  let spawned = thread::Builder::new()
    .name("stdin-commands".to_string())
    .spawn(move || {
      for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
          continue;
        }
        match line.parse::<Command>() {
          Ok(command) => {
            if tx.send(command).is_err() {
              break;
            }
          }
          Err(e) => warn!("{}", e),
        }
      }
      debug!("标准输入已关闭");
    });
  if let Err(e) = spawned {
    warn!("无法读取标准输入命令: {}", e);
  }
}

impl<M: FrameModel + 'static> Task<CameraInput, M, OutputWrapper> for ContinuousTask {
  type Error = anyhow::Error;

  fn run_task(self, input: CameraInput, model: M, output: OutputWrapper) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel();

    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = ctrlc_tx.send(Command::Quit);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;
    spawn_stdin_reader(tx);

    let mut session = DetectionSession::new(model, &self.settings).with_output(output);
    session.attach_camera(input);
    if let Err(e) = session.start_camera() {
      return Err(anyhow::anyhow!(e.user_message()));
    }
    info!("可用命令: start / pause / resume / reset / status / retry / quit");

    loop {
      match rx.recv_timeout(STATUS_POLL) {
        Ok(Command::Start) => {
          if let Err(e) = session.start_camera() {
            error!("{}", e.user_message());
          }
        }
        Ok(Command::Pause) => {
          if session.pause_camera() {
            log_summary(&session.summary());
          }
        }
        Ok(Command::Resume) => {
          session.resume_camera();
        }
        Ok(Command::Reset) => session.reset(),
        Ok(Command::Status) => {
          info!(
            "状态: {:?}，已处理 {} 帧",
            session.camera_state(),
            session.camera_ticks()
          );
          log_summary(&session.summary());
        }
        Ok(Command::Retry) => {
          if let Err(e) = session.model().retry_init() {
            error!("{}", e.log_message());
          }
        }
        Ok(Command::Quit) => break,
        Err(mpsc::RecvTimeoutError::Timeout) => {}
        Err(mpsc::RecvTimeoutError::Disconnected) => break,
      }

      if let Some(limit) = self.tick_limit
        && session.camera_ticks() >= limit
      {
        info!("达到指定帧数 {}，退出任务循环", limit);
        break;
      }
    }

    log_summary(&session.summary());
    session.reset();
    info!("任务完成，退出");
    Ok(())
  }
}
