// 该文件是 Tianyan （天眼） 项目的一部分。
// src/task.rs - 检测循环
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

//! 检测循环：取最新帧 → 信箱缩放 → 推理 → 解码/NMS → 通过通道发出结果。
//!
//! 循环运行在独立线程中，与采集线程之间只共享 `LatestFrame`。
//! 致命错误通过通道发出一次后循环结束，状态回到 `Idle`。

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::Frame,
  input::LatestFrame,
  model::{DecodeError, DetectionSet, InferenceAdapter, InferenceError, Yolov8Postprocessor},
  output::draw::Draw,
  preprocess::{DEFAULT_PAD_COLOR, Letterbox, PreprocessError, prepare_input},
};

const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
  Idle,
  Running,
  Stopping,
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
  /// 没有可用帧时的等待时间
  pub idle_sleep: Duration,
  /// 信箱填充颜色，RGB
  pub pad_color: [u8; 3],
  /// 结果通道容量，满时丢弃新结果
  pub channel_capacity: usize,
  pub draw: Draw,
}

impl Default for LoopOptions {
  fn default() -> Self {
    Self {
      idle_sleep: Duration::from_millis(10),
      pad_color: DEFAULT_PAD_COLOR,
      channel_capacity: 4,
      draw: Draw::default(),
    }
  }
}

/// 1 秒滑动窗口的帧率统计
#[derive(Debug, Clone)]
pub struct FpsCounter {
  window_start: Instant,
  frames: u32,
  fps: f32,
}

impl FpsCounter {
  pub fn new(now: Instant) -> Self {
    Self {
      window_start: now,
      frames: 0,
      fps: 0.0,
    }
  }

  /// 记录一帧，返回当前帧率估计
  pub fn tick(&mut self, now: Instant) -> f32 {
    self.frames += 1;
    let elapsed = now.saturating_duration_since(self.window_start);
    if elapsed >= FPS_WINDOW {
      self.fps = self.frames as f32 / elapsed.as_secs_f32();
      self.frames = 0;
      self.window_start = now;
    }
    self.fps
  }
}

/// 一帧的处理结果
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
  /// 标注了检测框的原始帧
  pub frame: Frame,
  /// 模型输入空间坐标，可用 `letterbox` 映射回原始帧
  pub detections: DetectionSet,
  pub letterbox: Letterbox,
  pub fps: f32,
  pub inference_ms: f32,
  pub detection_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  ModelLoad,
  RuntimeInit,
  Inference,
  Decode,
  Preprocess,
}

impl std::fmt::Display for FailureKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let tag = match self {
      FailureKind::ModelLoad => "ModelLoadFailure",
      FailureKind::RuntimeInit => "RuntimeInitFailure",
      FailureKind::Inference => "InferenceFailure",
      FailureKind::Decode => "DecodeFailure",
      FailureKind::Preprocess => "PreprocessFailure",
    };
    f.write_str(tag)
  }
}

/// 使检测会话终止的错误
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct SessionFailure {
  pub kind: FailureKind,
  pub message: String,
}

impl SessionFailure {
  pub fn new(kind: FailureKind, message: impl ToString) -> Self {
    Self {
      kind,
      message: message.to_string(),
    }
  }

  fn panicked(kind: FailureKind, payload: Box<dyn Any + Send>) -> Self {
    let message = match payload.downcast::<String>() {
      Ok(message) => *message,
      Err(payload) => match payload.downcast::<&'static str>() {
        Ok(message) => (*message).to_string(),
        Err(_) => "未知错误".to_string(),
      },
    };
    Self::new(kind, format!("线程崩溃: {}", message))
  }
}

impl From<InferenceError> for SessionFailure {
  fn from(err: InferenceError) -> Self {
    let kind = match &err {
      InferenceError::ModelLoad(..) => FailureKind::ModelLoad,
      InferenceError::RuntimeInit(_)
      | InferenceError::UnsupportedBackend(_)
      | InferenceError::SchemeMismatch(_) => FailureKind::RuntimeInit,
      InferenceError::Inference(_)
      | InferenceError::NotInitialized
      | InferenceError::OutputShape(_) => FailureKind::Inference,
    };
    Self::new(kind, err)
  }
}

impl From<DecodeError> for SessionFailure {
  fn from(err: DecodeError) -> Self {
    Self::new(FailureKind::Decode, err)
  }
}

impl From<PreprocessError> for SessionFailure {
  fn from(err: PreprocessError) -> Self {
    Self::new(FailureKind::Preprocess, err)
  }
}

pub type DetectionEvent = Result<DetectionOutcome, SessionFailure>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 运行中的检测会话
pub struct DetectionLoop {
  state: Arc<Mutex<LoopState>>,
  stop: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl DetectionLoop {
  /// 用已加载的推理后端启动检测循环
  pub fn start<S, A>(
    source: Arc<S>,
    adapter: A,
    postprocessor: Yolov8Postprocessor,
    options: LoopOptions,
  ) -> std::io::Result<(Self, Receiver<DetectionEvent>)>
  where
    S: LatestFrame + ?Sized + 'static,
    A: InferenceAdapter + Send + 'static,
  {
    Self::start_with_loader(source, move || Ok(adapter), postprocessor, options)
  }

  /// 在循环线程中加载推理后端后启动
  ///
  /// 加载失败作为一次错误事件发出。
  pub fn start_with_loader<S, A, L>(
    source: Arc<S>,
    loader: L,
    postprocessor: Yolov8Postprocessor,
    options: LoopOptions,
  ) -> std::io::Result<(Self, Receiver<DetectionEvent>)>
  where
    S: LatestFrame + ?Sized + 'static,
    A: InferenceAdapter + 'static,
    L: FnOnce() -> Result<A, InferenceError> + Send + 'static,
  {
    let (tx, rx) = mpsc::sync_channel(options.channel_capacity.max(1));
    let state = Arc::new(Mutex::new(LoopState::Running));
    let stop = Arc::new(AtomicBool::new(false));

    let session = Session {
      postprocessor,
      options,
      stop: stop.clone(),
      tx,
    };
    let session_state = state.clone();

    let handle = thread::Builder::new()
      .name("detection-loop".to_string())
      .spawn(move || {
        let _idle = IdleOnExit(session_state);
        session.run(source, loader);
      });

    let handle = match handle {
      Ok(handle) => handle,
      Err(e) => {
        error!("检测线程启动失败: {}", e);
        *lock(&state) = LoopState::Idle;
        return Err(e);
      }
    };

    info!("检测循环已启动");
    Ok((
      Self {
        state,
        stop,
        handle: Some(handle),
      },
      rx,
    ))
  }

  pub fn state(&self) -> LoopState {
    *lock(&self.state)
  }

  /// 停止循环并等待线程退出，允许重复调用
  pub fn stop(&mut self) {
    let Some(handle) = self.handle.take() else {
      return;
    };

    {
      let mut state = lock(&self.state);
      if *state == LoopState::Running {
        *state = LoopState::Stopping;
      }
    }
    self.stop.store(true, Ordering::Release);

    if handle.join().is_err() {
      error!("检测线程异常退出");
    }
    *lock(&self.state) = LoopState::Idle;
    info!("检测循环已停止");
  }
}

impl Drop for DetectionLoop {
  fn drop(&mut self) {
    self.stop();
  }
}

// 线程无论如何退出都回到 Idle
struct IdleOnExit(Arc<Mutex<LoopState>>);

impl Drop for IdleOnExit {
  fn drop(&mut self) {
    *lock(&self.0) = LoopState::Idle;
  }
}

// 离开作用域时释放推理后端
struct Released<A: InferenceAdapter>(A);

impl<A: InferenceAdapter> Deref for Released<A> {
  type Target = A;

  fn deref(&self) -> &A {
    &self.0
  }
}

impl<A: InferenceAdapter> DerefMut for Released<A> {
  fn deref_mut(&mut self) -> &mut A {
    &mut self.0
  }
}

impl<A: InferenceAdapter> Drop for Released<A> {
  fn drop(&mut self) {
    self.0.release();
    debug!("推理后端已释放");
  }
}

struct Session {
  postprocessor: Yolov8Postprocessor,
  options: LoopOptions,
  stop: Arc<AtomicBool>,
  tx: SyncSender<DetectionEvent>,
}

impl Session {
  fn stopped(&self) -> bool {
    self.stop.load(Ordering::Acquire)
  }

  fn run<S, A, L>(self, source: Arc<S>, loader: L)
  where
    S: LatestFrame + ?Sized,
    A: InferenceAdapter,
    L: FnOnce() -> Result<A, InferenceError>,
  {
    let loaded = match panic::catch_unwind(AssertUnwindSafe(loader)) {
      Ok(loaded) => loaded.map_err(SessionFailure::from),
      Err(payload) => Err(SessionFailure::panicked(FailureKind::ModelLoad, payload)),
    };
    let mut adapter = match loaded {
      Ok(adapter) => Released(adapter),
      Err(failure) => {
        self.fail(failure);
        return;
      }
    };

    let config = self.postprocessor.config();
    if adapter.input_size() != (config.input_width, config.input_height) {
      warn!(
        "后端输入尺寸 {:?} 与后处理配置 {}x{} 不一致",
        adapter.input_size(),
        config.input_width,
        config.input_height
      );
    }

    let mut counter = FpsCounter::new(Instant::now());
    while !self.stopped() {
      let Some(frame) = source.latest_frame() else {
        thread::sleep(self.options.idle_sleep);
        continue;
      };

      let processed = panic::catch_unwind(AssertUnwindSafe(|| {
        self.process(&mut *adapter, &frame, &mut counter)
      }))
      .unwrap_or_else(|payload| Err(SessionFailure::panicked(FailureKind::Inference, payload)));

      match processed {
        Ok(outcome) => match self.tx.try_send(Ok(outcome)) {
          Ok(()) => {}
          Err(TrySendError::Full(_)) => debug!("结果通道已满，丢弃帧 {}", frame.sequence()),
          Err(TrySendError::Disconnected(_)) => {
            warn!("结果接收端已关闭，退出检测循环");
            break;
          }
        },
        Err(failure) => {
          self.fail(failure);
          break;
        }
      }
    }

    debug!("检测线程退出");
  }

  fn process<A: InferenceAdapter>(
    &self,
    adapter: &mut A,
    frame: &Frame,
    counter: &mut FpsCounter,
  ) -> Result<DetectionOutcome, SessionFailure> {
    let (input, letterbox) = prepare_input(
      frame,
      adapter.input_size(),
      adapter.input_order(),
      self.options.pad_color,
    )?;

    let started = Instant::now();
    let outputs = adapter.run(&input)?;
    let inference_ms = started.elapsed().as_secs_f32() * 1000.0;

    let detections = self.postprocessor.process(&outputs, frame.sequence())?;
    let rendered = self
      .options
      .draw
      .draw_detections(frame, &detections, &letterbox);
    let fps = counter.tick(Instant::now());

    debug!(
      "帧 {}: 推理 {:.2} ms, {} 个目标, {:.1} fps",
      frame.sequence(),
      inference_ms,
      detections.len(),
      fps
    );

    Ok(DetectionOutcome {
      frame: rendered,
      detection_count: detections.len(),
      detections,
      letterbox,
      fps,
      inference_ms,
    })
  }

  /// 发出错误事件；通道满时等待空位，直到被要求停止
  fn fail(&self, failure: SessionFailure) {
    error!("检测会话终止: {}", failure);
    let mut event = Err(failure);
    loop {
      match self.tx.try_send(event) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => return,
        Err(TrySendError::Full(back)) => {
          if self.stopped() {
            return;
          }
          event = back;
          thread::sleep(self.options.idle_sleep);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{ChannelOrder, InputTensor};
  use crate::input::FrameSlot;
  use crate::model::{DFL_BINS, OutputTensor, ScaleOutput};
  use std::sync::atomic::AtomicUsize;

  struct CountingAdapter {
    runs: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    fail_on: Option<usize>,
    panic_on: Option<usize>,
  }

  impl InferenceAdapter for CountingAdapter {
    fn input_size(&self) -> (u32, u32) {
      (64, 64)
    }

    fn run(&mut self, _input: &InputTensor) -> Result<Vec<ScaleOutput>, InferenceError> {
      let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
      if self.fail_on == Some(run) {
        return Err(InferenceError::Inference("npu timeout".to_string()));
      }
      if self.panic_on == Some(run) {
        panic!("driver fault");
      }
      Ok(
        [8usize, 4, 2]
          .iter()
          .map(|&g| ScaleOutput {
            box_dist: OutputTensor::zeros([1, 4 * DFL_BINS, g, g]),
            class_conf: OutputTensor::zeros([1, 2, g, g]),
          })
          .collect(),
      )
    }

    fn release(&mut self) {
      self.released.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn postprocessor() -> Yolov8Postprocessor {
    Yolov8Postprocessor::new(crate::model::PostprocessConfig {
      input_width: 64,
      input_height: 64,
      ..Default::default()
    })
  }

  fn adapter(fail_on: Option<usize>) -> (CountingAdapter, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    (
      CountingAdapter {
        runs: runs.clone(),
        released: released.clone(),
        fail_on,
        panic_on: None,
      },
      runs,
      released,
    )
  }

  fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
      if condition() {
        return true;
      }
      thread::sleep(Duration::from_millis(5));
    }
    false
  }

  #[test]
  fn fps_window_is_one_second() {
    let start = Instant::now();
    let mut counter = FpsCounter::new(start);
    for i in 1..10 {
      assert_eq!(counter.tick(start + Duration::from_millis(i * 100)), 0.0);
    }
    let fps = counter.tick(start + Duration::from_millis(1000));
    assert!((fps - 10.0).abs() < 1e-4);
    assert_eq!(counter.tick(start + Duration::from_millis(1100)), fps);
  }

  #[test]
  fn failure_kinds_follow_error_source() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    assert_eq!(
      SessionFailure::from(InferenceError::ModelLoad("m.rknn".into(), io)).kind,
      FailureKind::ModelLoad
    );
    assert_eq!(
      SessionFailure::from(InferenceError::RuntimeInit("ctx".into())).kind,
      FailureKind::RuntimeInit
    );
    assert_eq!(
      SessionFailure::from(InferenceError::NotInitialized).kind,
      FailureKind::Inference
    );
    assert_eq!(
      SessionFailure::from(DecodeError::ScaleCount {
        expected: 3,
        actual: 2
      })
      .kind,
      FailureKind::Decode
    );
  }

  #[test]
  fn missing_frames_keep_the_loop_running() {
    let slot = Arc::new(FrameSlot::new());
    let (adapter, runs, released) = adapter(None);
    let (mut detection, rx) =
      DetectionLoop::start(slot.clone(), adapter, postprocessor(), LoopOptions::default()).unwrap();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(detection.state(), LoopState::Running);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    slot.publish(Frame::filled(128, 96, ChannelOrder::Bgr, [0, 0, 0]));
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(outcome.detections.sequence(), 1);
    assert_eq!(outcome.detection_count, 0);
    assert_eq!((outcome.frame.width(), outcome.frame.height()), (128, 96));
    assert_eq!(outcome.letterbox.ratio, 0.5);

    detection.stop();
    detection.stop();
    assert_eq!(detection.state(), LoopState::Idle);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn inference_failure_is_reported_once() {
    let slot = Arc::new(FrameSlot::new());
    slot.publish(Frame::filled(64, 64, ChannelOrder::Rgb, [0, 0, 0]));
    let (adapter, runs, released) = adapter(Some(3));
    let (detection, rx) =
      DetectionLoop::start(slot, adapter, postprocessor(), LoopOptions::default()).unwrap();

    let events = rx.iter().collect::<Vec<_>>();
    assert_eq!(events.len(), 3);
    assert!(events[..2].iter().all(Result::is_ok));
    let failure = events[2].as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Inference);

    assert!(wait_until(|| detection.state() == LoopState::Idle));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn loader_failure_becomes_an_event() {
    let slot = Arc::new(FrameSlot::new());
    let (detection, rx) = DetectionLoop::start_with_loader(
      slot,
      || -> Result<CountingAdapter, InferenceError> {
        Err(InferenceError::RuntimeInit("no npu".to_string()))
      },
      postprocessor(),
      LoopOptions::default(),
    )
    .unwrap();

    let failure = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
    assert_eq!(failure.kind, FailureKind::RuntimeInit);
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err());
    assert!(wait_until(|| detection.state() == LoopState::Idle));
  }

  #[test]
  fn adapter_panic_is_reported_as_inference_failure() {
    let slot = Arc::new(FrameSlot::new());
    slot.publish(Frame::filled(64, 64, ChannelOrder::Rgb, [0, 0, 0]));
    let (mut adapter, runs, released) = adapter(None);
    adapter.panic_on = Some(2);
    let (detection, rx) =
      DetectionLoop::start(slot, adapter, postprocessor(), LoopOptions::default()).unwrap();

    let events = rx.iter().collect::<Vec<_>>();
    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    let failure = events[1].as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Inference);
    assert!(failure.message.contains("driver fault"));

    assert!(wait_until(|| detection.state() == LoopState::Idle));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn loader_panic_is_reported_as_load_failure() {
    let slot = Arc::new(FrameSlot::new());
    let (detection, rx) = DetectionLoop::start_with_loader(
      slot,
      || -> Result<CountingAdapter, InferenceError> { panic!("bad model blob") },
      postprocessor(),
      LoopOptions::default(),
    )
    .unwrap();

    let failure = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
    assert_eq!(failure.kind, FailureKind::ModelLoad);
    assert!(failure.message.contains("bad model blob"));
    assert!(wait_until(|| detection.state() == LoopState::Idle));
  }
}
