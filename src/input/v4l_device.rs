// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input/v4l_device.rs - V4L2 摄像头设备
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

use std::pin::Pin;

use tracing::{debug, error};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::video::capture::Parameters;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ChannelOrder, Frame},
  input::{CaptureDevice, CaptureError, DeviceInfo},
};

const V4L_BUFFER_COUNT: u32 = 2;

/// V4L2 摄像头
///
/// v4l 的 Stream 需要引用 Device，这里用 Pin<Box<Device>> 保证
/// Device 地址稳定，Stream 在修改格式前和 Drop 时先行释放。
pub struct V4lDevice {
  path: String,
  device: Option<Pin<Box<Device>>>,
  stream: Option<Stream<'static>>,
  width: u32,
  height: u32,
  fps: f64,
}

impl FromUrlWithScheme for V4lDevice {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lDevice {
  type Error = CaptureError;

  /// 形如 `v4l:///dev/video21`，路径为空时使用 `/dev/video0`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = if url.path().is_empty() || url.path() == "/" {
      "/dev/video0"
    } else {
      url.path()
    };
    Self::with_path(path)
  }
}

impl V4lDevice {
  /// 按编号打开 `/dev/video{index}`
  pub fn with_index(index: u32) -> Result<Self, CaptureError> {
    Self::with_path(&format!("/dev/video{}", index))
  }

  pub fn with_path(path: &str) -> Result<Self, CaptureError> {
    let device = Device::with_path(path).map_err(|e| CaptureError::unavailable(path, e))?;

    let mut format = device
      .format()
      .map_err(|e| CaptureError::unavailable(path, e))?;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device
      .set_format(&format)
      .map_err(|e| CaptureError::unavailable(path, e))?;

    let fps = device
      .params()
      .map(|p| p.interval.denominator as f64 / p.interval.numerator.max(1) as f64)
      .unwrap_or_default();

    debug!(
      "打开 V4L2 设备 {}: {}x{} {}",
      path, format.width, format.height, format.fourcc
    );

    Ok(Self {
      path: path.to_string(),
      device: Some(Box::pin(device)),
      stream: None,
      width: format.width,
      height: format.height,
      fps,
    })
  }

  fn device(&self) -> Result<&Device, CaptureError> {
    self
      .device
      .as_deref()
      .ok_or_else(|| CaptureError::Control(format!("{} 已释放", self.path)))
  }

  fn stream(&mut self) -> Option<&mut Stream<'static>> {
    if self.stream.is_none() {
      let device_ref: &Device = self.device.as_deref()?;
      // SAFETY: device 被 Pin<Box> 固定在堆上，不会移动；
      // stream 总是在 device 被替换或释放之前先被 drop。
      let device_static: &'static Device = unsafe { std::mem::transmute(device_ref) };
      match Stream::with_buffers(device_static, Type::VideoCapture, V4L_BUFFER_COUNT) {
        Ok(stream) => self.stream = Some(stream),
        Err(e) => {
          error!("无法创建捕获流 {}: {}", self.path, e);
          return None;
        }
      }
    }
    self.stream.as_mut()
  }

  /// 将 YUYV 转换为 BGR
  fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pixels = (width * height) as usize;
    let mut bgr = Vec::with_capacity(pixels * 3);

    for chunk in yuyv.chunks_exact(4).take(pixels / 2) {
      let y0 = chunk[0] as f32;
      let u = chunk[1] as f32 - 128.0;
      let y1 = chunk[2] as f32;
      let v = chunk[3] as f32 - 128.0;

      for y in [y0, y1] {
        let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
        let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
        let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
        bgr.extend_from_slice(&[b, g, r]);
      }
    }

    bgr
  }
}

impl CaptureDevice for V4lDevice {
  type Id = u32;

  fn open(id: &u32) -> Result<Self, CaptureError> {
    Self::with_index(*id)
  }

  fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
    // 流存在时不能修改格式
    self.stream = None;

    let device = self.device()?;
    let mut format = device
      .format()
      .map_err(|e| CaptureError::Control(e.to_string()))?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device
      .set_format(&format)
      .map_err(|e| CaptureError::Control(e.to_string()))?;

    self.width = format.width;
    self.height = format.height;

    if (format.width, format.height) != (width, height) {
      return Err(CaptureError::ResolutionUnsupported { width, height });
    }
    Ok(())
  }

  fn set_fps(&mut self, fps: u32) -> Result<(), CaptureError> {
    self.stream = None;

    let params = self
      .device()?
      .set_params(&Parameters::with_fps(fps))
      .map_err(|e| CaptureError::Control(e.to_string()))?;
    self.fps = params.interval.denominator as f64 / params.interval.numerator.max(1) as f64;
    Ok(())
  }

  fn read_frame(&mut self) -> Option<Frame> {
    let (width, height) = (self.width, self.height);
    let stream = self.stream()?;

    match stream.next() {
      Ok((buffer, _meta)) => {
        if buffer.len() < (width * height * 2) as usize {
          debug!("缓冲区过短: {} 字节", buffer.len());
          return None;
        }
        let bgr = Self::yuyv_to_bgr(buffer, width, height);
        Frame::rgb_like(bgr, width, height, ChannelOrder::Bgr)
      }
      Err(e) => {
        debug!("无法捕获帧: {}", e);
        None
      }
    }
  }

  fn info(&self) -> DeviceInfo {
    DeviceInfo {
      width: self.width,
      height: self.height,
      fps: self.fps,
    }
  }

  fn release(&mut self) {
    // stream 必须先于 device 释放
    self.stream.take();
    if self.device.take().is_some() {
      debug!("释放 V4L2 设备 {}", self.path);
    }
  }
}

impl Drop for V4lDevice {
  fn drop(&mut self) {
    self.release();
  }
}
