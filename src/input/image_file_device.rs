// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input/image_file_device.rs - 静态图片回放设备
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

use std::{thread, time::Duration};

use image::{ImageReader, RgbImage, imageops::FilterType};
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{ChannelOrder, Frame},
  input::{CaptureDevice, CaptureError, DeviceInfo},
};

/// 把一张图片当作摄像头，按设定帧率重复输出
///
/// 输出为 BGR 顺序，与 USB/MIPI 摄像头一致。
pub struct ImageFileDevice {
  original: Option<RgbImage>,
  current: Option<RgbImage>,
  fps: u32,
}

impl FromUrlWithScheme for ImageFileDevice {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileDevice {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = url.path();
    let image = ImageReader::open(path)
      .map_err(|e| CaptureError::unavailable(path, e))?
      .decode()
      .map_err(|e| CaptureError::unavailable(path, e))?
      .to_rgb8();
    debug!("载入图片 {}: {}x{}", path, image.width(), image.height());

    Ok(Self::from_image(image))
  }
}

impl ImageFileDevice {
  pub fn from_image(image: RgbImage) -> Self {
    Self {
      original: Some(image.clone()),
      current: Some(image),
      fps: 0,
    }
  }
}

impl CaptureDevice for ImageFileDevice {
  type Id = Url;

  fn open(id: &Url) -> Result<Self, CaptureError> {
    Self::from_url(id)
  }

  fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
    let original = self
      .original
      .as_ref()
      .ok_or_else(|| CaptureError::Control("设备已释放".to_string()))?;
    self.current = Some(image::imageops::resize(
      original,
      width,
      height,
      FilterType::Triangle,
    ));
    Ok(())
  }

  fn set_fps(&mut self, fps: u32) -> Result<(), CaptureError> {
    self.fps = fps;
    Ok(())
  }

  fn read_frame(&mut self) -> Option<Frame> {
    let image = self.current.as_ref()?;
    if self.fps > 0 {
      thread::sleep(Duration::from_secs(1) / self.fps);
    }

    let mut data = image.as_raw().clone();
    for pixel in data.chunks_exact_mut(3) {
      pixel.swap(0, 2);
    }
    Frame::rgb_like(data, image.width(), image.height(), ChannelOrder::Bgr)
  }

  fn info(&self) -> DeviceInfo {
    let (width, height) = self
      .current
      .as_ref()
      .map(|image| image.dimensions())
      .unwrap_or_default();
    DeviceInfo {
      width,
      height,
      fps: self.fps as f64,
    }
  }

  fn release(&mut self) {
    self.original = None;
    self.current = None;
  }
}

#[cfg(test)]
mod tests {
  use image::Rgb;

  use super::*;

  #[test]
  fn frames_are_bgr() {
    let mut device = ImageFileDevice::from_image(RgbImage::from_pixel(4, 2, Rgb([10, 20, 30])));
    let frame = device.read_frame().unwrap();
    assert_eq!(frame.order(), ChannelOrder::Bgr);
    assert_eq!(&frame.data()[..3], &[30, 20, 10]);
  }

  #[test]
  fn resolution_follows_request_and_release_stops_reads() {
    let mut device = ImageFileDevice::from_image(RgbImage::new(8, 8));
    device.set_resolution(4, 2).unwrap();
    let frame = device.read_frame().unwrap();
    assert_eq!((frame.width(), frame.height()), (4, 2));

    device.release();
    device.release();
    assert!(device.read_frame().is_none());
    assert!(device.set_resolution(4, 2).is_err());
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("v4l:///dev/video0").unwrap();
    assert!(matches!(
      ImageFileDevice::from_url(&url),
      Err(CaptureError::SchemeMismatch(_))
    ));
  }
}
