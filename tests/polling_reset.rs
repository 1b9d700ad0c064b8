use std::{
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
    mpsc,
  },
  thread,
  time::{Duration, Instant},
};

use huajia::{
  config::Settings,
  frame::Frame,
  input::CameraInput,
  model::{BBox, InferenceError, Model, RawDetection},
  output::draw::OverlayRenderer,
  pricing::{Palette, PriceTable},
  session::{DetectionPipeline, DetectionSession, SessionMode},
  task::{LoopState, PollingLoop},
};

/// 每次推理都阻塞，直到测试放行
struct GatedModel {
  calls: AtomicUsize,
  entered: Mutex<mpsc::Sender<()>>,
  release: Mutex<mpsc::Receiver<()>>,
}

impl Model for GatedModel {
  type Input = Frame;
  type Output = Vec<RawDetection>;
  type Error = InferenceError;

  fn infer(&self, _input: &Frame) -> Result<Self::Output, Self::Error> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let _ = self.entered.lock().unwrap().send(());
    self
      .release
      .lock()
      .unwrap()
      .recv()
      .map_err(|_| InferenceError::WorkerGone)?;
    Ok(vec![RawDetection {
      class: "rose".to_string(),
      class_id: Some(0),
      confidence: 0.9,
      bbox: BBox::new(16.0, 16.0, 8.0, 8.0),
    }])
  }
}

fn gated() -> (Arc<GatedModel>, mpsc::Receiver<()>, mpsc::Sender<()>) {
  let (entered_tx, entered_rx) = mpsc::channel();
  let (release_tx, release_rx) = mpsc::channel();
  let model = Arc::new(GatedModel {
    calls: AtomicUsize::new(0),
    entered: Mutex::new(entered_tx),
    release: Mutex::new(release_rx),
  });
  (model, entered_rx, release_tx)
}

fn pipeline() -> DetectionPipeline {
  DetectionPipeline::new(PriceTable::default(), Palette::default(), OverlayRenderer::default())
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if f() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  f()
}

#[test]
fn pause_then_reset_discards_in_flight_result() {
  let (model, entered, release) = gated();
  let polling = PollingLoop::new(
    model.clone(),
    CameraInput::stub(32, 32),
    Arc::new(pipeline()),
    Duration::from_millis(10),
  );
  polling.start().expect("start stub camera");

  // 第一次推理进行中
  entered.recv_timeout(Duration::from_secs(5)).expect("tick in flight");
  assert!(polling.pause());
  polling.reset();
  release.send(()).expect("release inference");

  assert!(wait_until(Duration::from_secs(5), || !polling.is_ticking()));
  thread::sleep(Duration::from_millis(50));

  assert_eq!(polling.state(), LoopState::Stopped);
  assert_eq!(model.calls.load(Ordering::SeqCst), 1);
  assert_eq!(polling.applied_ticks(), 0);
  assert!(polling.canvas().is_blank());
  assert!(polling.detections().is_empty());
  assert!(polling.summary().is_empty());
}

#[test]
fn resume_after_pause_applies_result() {
  let (model, entered, release) = gated();
  let polling = PollingLoop::new(
    model.clone(),
    CameraInput::stub(32, 32),
    Arc::new(pipeline()),
    Duration::from_millis(10),
  );
  polling.start().expect("start stub camera");
  entered.recv_timeout(Duration::from_secs(5)).expect("tick in flight");

  // 暂停期间完成的推理不会被绘制
  assert!(polling.pause());
  release.send(()).expect("release inference");
  thread::sleep(Duration::from_millis(50));
  assert_eq!(polling.applied_ticks(), 0);
  assert_eq!(model.calls.load(Ordering::SeqCst), 1);

  assert!(polling.resume());
  entered.recv_timeout(Duration::from_secs(5)).expect("next tick");
  release.send(()).expect("release inference");
  assert!(wait_until(Duration::from_secs(5), || polling.applied_ticks() == 1));
  assert_eq!(polling.summary().total_price, 1900);

  polling.reset();
  let _ = release.send(());
}

#[test]
fn session_reset_stops_camera_mode() {
  let (model, entered, release) = gated();
  let gate = GatedHandle(model);
  let mut session = DetectionSession::new(gate, &Settings::default()).with_pipeline(pipeline());
  session.attach_camera(CameraInput::stub(32, 32));
  session.start_camera().expect("start camera");
  assert_eq!(session.mode(), SessionMode::Camera);

  entered.recv_timeout(Duration::from_secs(5)).expect("tick in flight");
  assert!(session.pause_camera());
  session.reset();
  release.send(()).expect("release inference");
  thread::sleep(Duration::from_millis(50));

  assert_eq!(session.mode(), SessionMode::Select);
  assert_eq!(session.camera_state(), Some(LoopState::Stopped));
  assert_eq!(session.camera_ticks(), 0);
  assert!(session.canvas().is_blank());
}

/// 会话按值持有模型，这里转发到共享的门控模型
struct GatedHandle(Arc<GatedModel>);

impl Model for GatedHandle {
  type Input = Frame;
  type Output = Vec<RawDetection>;
  type Error = InferenceError;

  fn infer(&self, input: &Frame) -> Result<Self::Output, Self::Error> {
    self.0.infer(input)
  }
}
