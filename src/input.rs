// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input.rs - 采集设备与最新帧发布
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

//! # 采集输入
//!
//! `FrameSource` 持有一个采集设备，在后台线程中不停读帧，
//! 只保留最新的一帧（`FrameSlot`）。消费者通过 [`FrameSource::latest_frame`]
//! 随时取得一份拷贝，不会等待生产者。
//!
//! 设备通过 URL 选择：
//! - `v4l:///dev/video21`（需要 `v4l_capture` 特性）
//! - `image:///path/to/frame.jpg`（循环回放一张静态图片）

use std::{
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError, Sender},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

mod image_file_device;
pub use self::image_file_device::ImageFileDevice;

#[cfg(feature = "v4l_capture")]
mod v4l_device;
#[cfg(feature = "v4l_capture")]
pub use self::v4l_device::V4lDevice;

/// 请求分辨率无法生效时依次尝试的分辨率
pub const FALLBACK_RESOLUTIONS: [(u32, u32); 4] = [(640, 480), (320, 240), (800, 600), (1024, 768)];

/// 探测设备支持分辨率时使用的候选列表
pub const PROBE_RESOLUTIONS: [(u32, u32); 8] = [
  (320, 240),
  (640, 480),
  (800, 600),
  (1024, 768),
  (1280, 720),
  (1280, 960),
  (1600, 1200),
  (1920, 1080),
];

/// 板载摄像头优先的设备编号顺序
pub const DEFAULT_DEVICE_PRIORITY: [u32; 5] = [21, 22, 0, 1, 2];

pub const DEFAULT_CAPTURE_WIDTH: u32 = 640;
pub const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
pub const DEFAULT_CAPTURE_FPS: u32 = 30;

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("无法打开采集设备 {device}: {reason}")]
  DeviceUnavailable { device: String, reason: String },
  #[error("不支持的分辨率 {width}x{height}")]
  ResolutionUnsupported { width: u32, height: u32 },
  #[error("设备参数设置失败: {0}")]
  Control(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl CaptureError {
  pub fn unavailable(device: impl ToString, reason: impl ToString) -> Self {
    CaptureError::DeviceUnavailable {
      device: device.to_string(),
      reason: reason.to_string(),
    }
  }
}

/// 设备当前参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceInfo {
  pub width: u32,
  pub height: u32,
  pub fps: f64,
}

/// 采集设备
///
/// 设备只在一个线程中使用：打开与分辨率协商在调用者线程，
/// 开始采集后整体移交给生产者线程。
pub trait CaptureDevice: Send + Sized + 'static {
  type Id: std::fmt::Debug;

  fn open(id: &Self::Id) -> Result<Self, CaptureError>;
  fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), CaptureError>;
  fn set_fps(&mut self, fps: u32) -> Result<(), CaptureError>;
  /// 读取一帧，失败返回 `None`
  fn read_frame(&mut self) -> Option<Frame>;
  fn info(&self) -> DeviceInfo;
  /// 释放设备，允许重复调用
  fn release(&mut self);
}

/// 可以提供最新帧的对象
pub trait LatestFrame: Send + Sync {
  fn latest_frame(&self) -> Option<Frame>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SlotInner {
  frame: Option<Frame>,
  sequence: u64,
  closed: bool,
}

/// 只保存最新一帧的共享槽
///
/// 只有生产者线程写入；读取方拿到的是独立拷贝。关闭后不再接受新帧。
#[derive(Debug, Default)]
pub struct FrameSlot {
  inner: Mutex<SlotInner>,
}

impl FrameSlot {
  pub fn new() -> Self {
    Self::default()
  }

  /// 覆盖槽中的帧并返回分配给它的序号，槽已关闭时丢弃该帧
  pub fn publish(&self, mut frame: Frame) -> Option<u64> {
    let mut inner = lock(&self.inner);
    if inner.closed {
      return None;
    }
    inner.sequence += 1;
    frame.set_sequence(inner.sequence);
    inner.frame = Some(frame);
    Some(inner.sequence)
  }

  pub fn latest(&self) -> Option<Frame> {
    lock(&self.inner).frame.clone()
  }

  /// 清空并关闭槽
  pub fn close(&self) {
    let mut inner = lock(&self.inner);
    inner.frame = None;
    inner.closed = true;
  }
}

impl LatestFrame for FrameSlot {
  fn latest_frame(&self) -> Option<Frame> {
    self.latest()
  }
}

/// `FrameSource` 的时间参数
#[derive(Debug, Clone, Copy)]
pub struct FrameSourceOptions {
  /// 设置分辨率后等待设备生效的时间
  pub settle: Duration,
  /// 读帧失败后的重试间隔
  pub retry_interval: Duration,
  /// 停止时等待生产者线程退出的上限
  pub join_timeout: Duration,
}

impl Default for FrameSourceOptions {
  fn default() -> Self {
    Self {
      settle: Duration::from_millis(200),
      retry_interval: Duration::from_millis(10),
      join_timeout: Duration::from_secs(1),
    }
  }
}

struct Producer {
  stop: Arc<AtomicBool>,
  handle: JoinHandle<()>,
  exited: Receiver<()>,
}

enum SourceState<D> {
  Closed,
  Opened(D),
  Capturing(Producer),
}

/// 最新帧采集源
pub struct FrameSource<D: CaptureDevice> {
  state: Mutex<SourceState<D>>,
  slot: Arc<FrameSlot>,
  info: Mutex<Option<DeviceInfo>>,
  options: FrameSourceOptions,
}

impl<D: CaptureDevice> FrameSource<D> {
  /// 打开设备并协商分辨率
  ///
  /// 只有设备无法打开时才返回错误；分辨率协商失败时使用设备默认值。
  pub fn open(id: &D::Id, width: u32, height: u32, fps: u32) -> Result<Self, CaptureError> {
    Self::open_with(id, width, height, fps, FrameSourceOptions::default())
  }

  pub fn open_with(
    id: &D::Id,
    width: u32,
    height: u32,
    fps: u32,
    options: FrameSourceOptions,
  ) -> Result<Self, CaptureError> {
    info!("打开采集设备: {:?}", id);
    let mut device = D::open(id)?;

    if negotiate_resolution(&mut device, width, height, options.settle).is_none() {
      warn!("无法设置分辨率 {}x{}，使用设备默认分辨率", width, height);
    }

    if let Err(e) = device.set_fps(fps) {
      warn!("设置帧率 {} 失败: {}", fps, e);
    }

    let info = device.info();
    info!(
      "采集设备已打开: {}x{} @ {:.1} fps",
      info.width, info.height, info.fps
    );

    Ok(Self {
      state: Mutex::new(SourceState::Opened(device)),
      slot: Arc::new(FrameSlot::new()),
      info: Mutex::new(Some(info)),
      options,
    })
  }

  /// 启动生产者线程，重复调用时返回当前采集状态
  pub fn start_capture(&self) -> bool {
    let mut state = lock(&self.state);
    let device = match std::mem::replace(&mut *state, SourceState::Closed) {
      SourceState::Opened(device) => device,
      other => {
        let capturing = matches!(other, SourceState::Capturing(_));
        *state = other;
        return capturing;
      }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let (exited_tx, exited) = mpsc::channel();
    let slot = self.slot.clone();
    let retry = self.options.retry_interval;
    let producer_stop = stop.clone();

    let spawned = thread::Builder::new()
      .name("frame-producer".to_string())
      .spawn(move || produce(device, slot, producer_stop, retry, exited_tx));

    match spawned {
      Ok(handle) => {
        info!("开始采集");
        *state = SourceState::Capturing(Producer {
          stop,
          handle,
          exited,
        });
        true
      }
      Err(e) => {
        error!("采集线程启动失败: {}", e);
        *lock(&self.info) = None;
        false
      }
    }
  }

  /// 停止采集并释放设备，允许重复调用
  ///
  /// 设备由生产者线程在退出前释放。等待超时时只记录告警，
  /// 线程退出后仍会自行释放设备。
  pub fn stop_capture(&self) {
    let previous = std::mem::replace(&mut *lock(&self.state), SourceState::Closed);

    match previous {
      SourceState::Closed => return,
      SourceState::Opened(mut device) => device.release(),
      SourceState::Capturing(producer) => {
        producer.stop.store(true, Ordering::Release);
        match producer.exited.recv_timeout(self.options.join_timeout) {
          Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if producer.handle.join().is_err() {
              error!("采集线程异常退出");
            }
          }
          Err(RecvTimeoutError::Timeout) => {
            warn!(
              "采集线程在 {:?} 内未退出，设备将在线程结束时释放",
              self.options.join_timeout
            );
          }
        }
      }
    }

    self.slot.close();
    *lock(&self.info) = None;
    info!("采集已停止");
  }

  pub fn is_capturing(&self) -> bool {
    matches!(*lock(&self.state), SourceState::Capturing(_))
  }

  /// 最新一帧的拷贝，从未采到帧时为 `None`
  pub fn latest_frame(&self) -> Option<Frame> {
    self.slot.latest()
  }

  /// 设备参数，设备未打开时为 `None`
  pub fn device_info(&self) -> Option<DeviceInfo> {
    *lock(&self.info)
  }

  /// 探测设备支持的分辨率，只能在开始采集前调用
  pub fn probe_resolutions(&self) -> Vec<(u32, u32)> {
    let mut state = lock(&self.state);
    let SourceState::Opened(device) = &mut *state else {
      return Vec::new();
    };

    let original = device.info();
    let supported = PROBE_RESOLUTIONS
      .iter()
      .copied()
      .filter(|&(w, h)| try_resolution(device, w, h, self.options.settle))
      .collect::<Vec<_>>();

    if let Err(e) = device.set_resolution(original.width, original.height) {
      warn!("恢复分辨率 {}x{} 失败: {}", original.width, original.height, e);
    }
    debug!("设备支持的分辨率: {:?}", supported);
    supported
  }
}

impl<D: CaptureDevice> LatestFrame for FrameSource<D> {
  fn latest_frame(&self) -> Option<Frame> {
    self.slot.latest()
  }
}

impl<D: CaptureDevice> Drop for FrameSource<D> {
  fn drop(&mut self) {
    self.stop_capture();
  }
}

fn produce<D: CaptureDevice>(
  mut device: D,
  slot: Arc<FrameSlot>,
  stop: Arc<AtomicBool>,
  retry: Duration,
  exited: Sender<()>,
) {
  let mut failures = 0u64;

  while !stop.load(Ordering::Acquire) {
    match device.read_frame() {
      // 读帧期间可能已请求停止
      Some(_) if stop.load(Ordering::Acquire) => break,
      Some(frame) => {
        if failures > 0 {
          debug!("连续 {} 次读帧失败后恢复", failures);
          failures = 0;
        }
        slot.publish(frame);
      }
      None => {
        if failures == 0 {
          warn!("读取帧失败，{:?} 后重试", retry);
        }
        failures += 1;
        thread::sleep(retry);
      }
    }
  }

  device.release();
  debug!("采集线程退出，设备已释放");
  let _ = exited.send(());
}

fn try_resolution<D: CaptureDevice>(
  device: &mut D,
  width: u32,
  height: u32,
  settle: Duration,
) -> bool {
  if let Err(e) = device.set_resolution(width, height) {
    debug!("设置分辨率 {}x{} 失败: {}", width, height, e);
    return false;
  }
  thread::sleep(settle);

  match device.read_frame() {
    Some(frame) if frame.width() == width && frame.height() == height => true,
    Some(frame) => {
      debug!(
        "分辨率不符: 请求 {}x{}, 实际 {}x{}",
        width,
        height,
        frame.width(),
        frame.height()
      );
      false
    }
    None => {
      debug!("分辨率 {}x{} 设置后无法读取帧", width, height);
      false
    }
  }
}

/// 设置分辨率并用读帧验证，失败时按回退列表尝试
///
/// 返回最终生效的分辨率。
pub fn negotiate_resolution<D: CaptureDevice>(
  device: &mut D,
  width: u32,
  height: u32,
  settle: Duration,
) -> Option<(u32, u32)> {
  if try_resolution(device, width, height, settle) {
    info!("成功设置分辨率: {}x{}", width, height);
    return Some((width, height));
  }

  for (w, h) in FALLBACK_RESOLUTIONS {
    if (w, h) == (width, height) {
      continue;
    }
    if try_resolution(device, w, h, settle) {
      info!("回退到支持的分辨率: {}x{}", w, h);
      return Some((w, h));
    }
  }

  warn!("无法找到支持的分辨率");
  None
}

/// 返回当前可以打开并读出一帧的设备
pub fn enumerate_devices<D>(candidates: &[D::Id]) -> Vec<D::Id>
where
  D: CaptureDevice,
  D::Id: Clone,
{
  candidates
    .iter()
    .filter(|id| match D::open(id) {
      Ok(mut device) => {
        let usable = device.read_frame().is_some();
        device.release();
        usable
      }
      Err(e) => {
        debug!("设备 {:?} 不可用: {}", id, e);
        false
      }
    })
    .cloned()
    .collect()
}

/// 按 URL 方案选择的采集设备
pub enum DeviceWrapper {
  #[cfg(feature = "v4l_capture")]
  V4l(V4lDevice),
  ImageFile(ImageFileDevice),
}

impl FromUrl for DeviceWrapper {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "v4l_capture")]
    {
      if url.scheme() == V4lDevice::SCHEME {
        return Ok(DeviceWrapper::V4l(V4lDevice::from_url(url)?));
      }
    }

    if url.scheme() == ImageFileDevice::SCHEME {
      return Ok(DeviceWrapper::ImageFile(ImageFileDevice::from_url(url)?));
    }

    Err(CaptureError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl CaptureDevice for DeviceWrapper {
  type Id = Url;

  fn open(id: &Url) -> Result<Self, CaptureError> {
    Self::from_url(id)
  }

  fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
    match self {
      #[cfg(feature = "v4l_capture")]
      DeviceWrapper::V4l(device) => device.set_resolution(width, height),
      DeviceWrapper::ImageFile(device) => device.set_resolution(width, height),
    }
  }

  fn set_fps(&mut self, fps: u32) -> Result<(), CaptureError> {
    match self {
      #[cfg(feature = "v4l_capture")]
      DeviceWrapper::V4l(device) => device.set_fps(fps),
      DeviceWrapper::ImageFile(device) => device.set_fps(fps),
    }
  }

  fn read_frame(&mut self) -> Option<Frame> {
    match self {
      #[cfg(feature = "v4l_capture")]
      DeviceWrapper::V4l(device) => device.read_frame(),
      DeviceWrapper::ImageFile(device) => device.read_frame(),
    }
  }

  fn info(&self) -> DeviceInfo {
    match self {
      #[cfg(feature = "v4l_capture")]
      DeviceWrapper::V4l(device) => device.info(),
      DeviceWrapper::ImageFile(device) => device.info(),
    }
  }

  fn release(&mut self) {
    match self {
      #[cfg(feature = "v4l_capture")]
      DeviceWrapper::V4l(device) => device.release(),
      DeviceWrapper::ImageFile(device) => device.release(),
    }
  }
}
