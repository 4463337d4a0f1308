// 该文件是 Tianyan （天眼） 项目的一部分。
// tests/pipeline.rs - 采集到检测结果的端到端测试
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

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use url::Url;

use tianyan::{
  FromUrl,
  frame::{ChannelOrder, Frame, InputTensor},
  input::{DeviceWrapper, FrameSlot, FrameSource, LatestFrame},
  model::{
    Backend, DEFAULT_CLASS_NUM, DEFAULT_STRIDES, DFL_BINS, InferenceAdapter, InferenceError,
    MODEL_INPUT_SIZE, OutputTensor, ScaleOutput, Yolov8Postprocessor,
  },
  output::draw::map_to_source,
  task::{DetectionLoop, FailureKind, LoopOptions, LoopState},
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// 在中间尺度 (40x40) 的 (row 10, col 20) 放一个类别 3 的高置信度单元
struct InjectedAdapter {
  confidence: f32,
  fail_after: Option<usize>,
  runs: usize,
}

impl InjectedAdapter {
  fn new(confidence: f32) -> Self {
    Self {
      confidence,
      fail_after: None,
      runs: 0,
    }
  }
}

impl InferenceAdapter for InjectedAdapter {
  fn input_size(&self) -> (u32, u32) {
    (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE)
  }

  fn run(&mut self, input: &InputTensor) -> Result<Vec<ScaleOutput>, InferenceError> {
    assert_eq!((input.width(), input.height()), (640, 640));
    assert_eq!(input.order(), ChannelOrder::Rgb);

    self.runs += 1;
    if self.fail_after.is_some_and(|n| self.runs > n) {
      return Err(InferenceError::Inference("injected failure".to_string()));
    }

    Ok(
      DEFAULT_STRIDES
        .iter()
        .enumerate()
        .map(|(scale, &stride)| {
          let grid = (MODEL_INPUT_SIZE / stride) as usize;
          let mut class_conf = OutputTensor::zeros([1, DEFAULT_CLASS_NUM, grid, grid]);
          if scale == 1 {
            class_conf.set(3, 10, 20, self.confidence);
          }
          ScaleOutput {
            box_dist: OutputTensor::zeros([1, 4 * DFL_BINS, grid, grid]),
            class_conf,
          }
        })
        .collect(),
    )
  }

  fn release(&mut self) {}
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + EVENT_TIMEOUT;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  false
}

#[test]
fn single_injected_cell_yields_single_box() {
  let slot = Arc::new(FrameSlot::new());
  slot.publish(Frame::filled(640, 640, ChannelOrder::Bgr, [40, 40, 40]));

  let (mut detection, events) = DetectionLoop::start(
    slot,
    InjectedAdapter::new(0.87),
    Yolov8Postprocessor::default(),
    LoopOptions::default(),
  )
  .unwrap();

  let outcome = events.recv_timeout(EVENT_TIMEOUT).unwrap().unwrap();
  detection.stop();

  assert_eq!(outcome.detection_count, 1);
  let item = outcome.detections.items()[0];
  assert_eq!(item.class_id, 3);
  assert_eq!(item.score, 0.87);
  assert_eq!(item.bbox, [208.0, 48.0, 448.0, 288.0]);
  assert_eq!(outcome.detections.sequence(), 1);
}

#[test]
fn fatal_inference_error_is_emitted_once() {
  let slot = Arc::new(FrameSlot::new());
  slot.publish(Frame::filled(320, 240, ChannelOrder::Bgr, [0, 0, 0]));

  let adapter = InjectedAdapter {
    fail_after: Some(1),
    ..InjectedAdapter::new(0.9)
  };
  let (detection, events) = DetectionLoop::start(
    slot,
    adapter,
    Yolov8Postprocessor::default(),
    LoopOptions::default(),
  )
  .unwrap();

  let events = events.iter().collect::<Vec<_>>();
  assert_eq!(events.len(), 2);
  assert!(events[0].is_ok());
  let failure = events[1].as_ref().unwrap_err();
  assert_eq!(failure.kind, FailureKind::Inference);
  assert!(failure.message.contains("injected failure"));

  assert!(wait_until(|| detection.state() == LoopState::Idle));
}

#[test]
fn image_source_feeds_detection_loop() {
  let dir = std::env::temp_dir().join(format!("tianyan-pipeline-{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let path = dir.join("frame.png");
  RgbImage::from_pixel(1280, 720, Rgb([200, 100, 50]))
    .save(&path)
    .unwrap();

  let url = Url::parse(&format!("image://{}", path.display())).unwrap();
  let source = Arc::new(FrameSource::<DeviceWrapper>::open(&url, 640, 480, 30).unwrap());
  let info = source.device_info().unwrap();
  assert_eq!((info.width, info.height), (640, 480));
  assert!(source.start_capture());
  assert!(wait_until(|| source.latest_frame().is_some()));

  let (mut detection, events) = DetectionLoop::start(
    source.clone(),
    InjectedAdapter::new(0.6),
    Yolov8Postprocessor::default(),
    LoopOptions::default(),
  )
  .unwrap();
  let outcome = events.recv_timeout(EVENT_TIMEOUT).unwrap().unwrap();
  detection.stop();
  source.stop_capture();

  assert_eq!((outcome.frame.width(), outcome.frame.height()), (640, 480));
  assert_eq!(outcome.letterbox.ratio, 1.0);
  assert_eq!(outcome.letterbox.pad_top, 80);

  let mapped = map_to_source(&outcome.detections, &outcome.letterbox);
  assert_eq!(mapped.items()[0].bbox, [208.0, 0.0, 448.0, 208.0]);

  assert!(source.latest_frame().is_none());
  assert!(source.device_info().is_none());
  std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn simulated_backend_runs_end_to_end() {
  let url = Url::parse("sim://?classes=4&seed=7").unwrap();

  let slot = Arc::new(FrameSlot::new());
  slot.publish(Frame::filled(800, 600, ChannelOrder::Bgr, [0, 0, 0]));

  let (mut detection, events) = DetectionLoop::start_with_loader(
    slot,
    move || Backend::from_url(&url),
    Yolov8Postprocessor::default(),
    LoopOptions::default(),
  )
  .unwrap();
  let outcome = events.recv_timeout(EVENT_TIMEOUT).unwrap().unwrap();
  detection.stop();

  assert_eq!(outcome.detection_count, outcome.detections.len());
  assert!(outcome.detections.iter().all(|b| b.class_id < 4));
  assert!(outcome.detections.iter().all(|b| b.score >= 0.25));
  assert_eq!(detection.state(), LoopState::Idle);
}

#[test]
fn missing_model_is_a_load_failure() {
  let slot: Arc<dyn LatestFrame> = Arc::new(FrameSlot::new());
  let (detection, events) = DetectionLoop::start_with_loader(
    slot,
    || -> Result<InjectedAdapter, InferenceError> {
      let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
      Err(InferenceError::ModelLoad("/models/missing.rknn".to_string(), io))
    },
    Yolov8Postprocessor::default(),
    LoopOptions::default(),
  )
  .unwrap();

  let failure = events.recv_timeout(EVENT_TIMEOUT).unwrap().unwrap_err();
  assert_eq!(failure.kind, FailureKind::ModelLoad);
  assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
  assert!(wait_until(|| detection.state() == LoopState::Idle));
}
