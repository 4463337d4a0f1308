// 该文件是 Tianyan （天眼） 项目的一部分。
// src/preprocess.rs - 信箱缩放与通道顺序转换
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

use image::{ImageBuffer, Rgb, RgbImage, imageops};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::frame::{ChannelOrder, Frame, InputTensor};

/// 默认填充颜色（黑色）
pub const DEFAULT_PAD_COLOR: [u8; 3] = [0, 0, 0];

#[derive(Error, Debug, PartialEq)]
pub enum PreprocessError {
  #[error("空帧: {0}x{1}")]
  EmptyFrame(u32, u32),
  #[error("不支持的通道数: {0}")]
  UnsupportedChannels(u32),
  #[error("目标尺寸无效: {0}x{1}")]
  InvalidTarget(u32, u32),
}

/// 信箱缩放的几何参数，用于把模型空间的坐标映射回原始帧
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Letterbox {
  pub ratio: f32,
  pub pad_left: u32,
  pub pad_top: u32,
  pub scaled_width: u32,
  pub scaled_height: u32,
  pub source_width: u32,
  pub source_height: u32,
}

impl Letterbox {
  /// 计算把 `source` 等比缩放进 `target` 时的缩放比与填充
  ///
  /// 填充的两半分别按 -0.1 与 +0.1 偏置后取整，奇数余量多出的一像素落在下/右侧。
  pub fn compute(
    source: (u32, u32),
    target: (u32, u32),
  ) -> Result<(Self, [u32; 4]), PreprocessError> {
    let (sw, sh) = source;
    let (tw, th) = target;
    if sw == 0 || sh == 0 {
      return Err(PreprocessError::EmptyFrame(sw, sh));
    }
    if tw == 0 || th == 0 {
      return Err(PreprocessError::InvalidTarget(tw, th));
    }

    let ratio = (th as f64 / sh as f64).min(tw as f64 / sw as f64);
    let scaled_width = ((sw as f64 * ratio).round_ties_even() as u32).clamp(1, tw);
    let scaled_height = ((sh as f64 * ratio).round_ties_even() as u32).clamp(1, th);

    let dw = (tw - scaled_width) as f64 / 2.0;
    let dh = (th - scaled_height) as f64 / 2.0;
    let top = (dh - 0.1).round_ties_even().max(0.0) as u32;
    let bottom = (dh + 0.1).round_ties_even().max(0.0) as u32;
    let left = (dw - 0.1).round_ties_even().max(0.0) as u32;
    let right = (dw + 0.1).round_ties_even().max(0.0) as u32;

    Ok((
      Self {
        ratio: ratio as f32,
        pad_left: left,
        pad_top: top,
        scaled_width,
        scaled_height,
        source_width: sw,
        source_height: sh,
      },
      [top, bottom, left, right],
    ))
  }

  /// 模型空间 [x1, y1, x2, y2] 映射回原始帧，并裁剪到帧范围内
  pub fn to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
    let (left, top) = (self.pad_left as f32, self.pad_top as f32);
    let (w, h) = (self.source_width as f32, self.source_height as f32);
    [
      ((bbox[0] - left) / self.ratio).clamp(0.0, w),
      ((bbox[1] - top) / self.ratio).clamp(0.0, h),
      ((bbox[2] - left) / self.ratio).clamp(0.0, w),
      ((bbox[3] - top) / self.ratio).clamp(0.0, h),
    ]
  }
}

/// 就地交换第 0 与第 2 通道
pub fn convert_order(data: &mut [u8], from: ChannelOrder, to: ChannelOrder) {
  if from == to {
    return;
  }
  for pixel in data.chunks_exact_mut(3) {
    pixel.swap(0, 2);
  }
}

/// 把 RGB 顺序的颜色转换到指定通道顺序
fn color_in(order: ChannelOrder, rgb: [u8; 3]) -> [u8; 3] {
  match order {
    ChannelOrder::Rgb => rgb,
    ChannelOrder::Bgr => [rgb[2], rgb[1], rgb[0]],
  }
}

/// 信箱缩放，输出帧保持原始通道顺序
///
/// `pad_color` 按 RGB 给出。
pub fn letterbox(
  frame: &Frame,
  target: (u32, u32),
  pad_color: [u8; 3],
) -> Result<(Frame, Letterbox), PreprocessError> {
  if frame.channels() != 3 {
    return Err(PreprocessError::UnsupportedChannels(frame.channels()));
  }
  let (geometry, [top, _bottom, left, _right]) =
    Letterbox::compute((frame.width(), frame.height()), target)?;

  let source: RgbImage =
    ImageBuffer::from_raw(frame.width(), frame.height(), frame.data().to_vec())
      .ok_or(PreprocessError::EmptyFrame(frame.width(), frame.height()))?;

  let unchanged = (geometry.scaled_width, geometry.scaled_height) == (frame.width(), frame.height());
  let resized = if unchanged {
    source
  } else {
    imageops::resize(
      &source,
      geometry.scaled_width,
      geometry.scaled_height,
      imageops::FilterType::Triangle,
    )
  };

  let fill = Rgb(color_in(frame.order(), pad_color));
  let mut canvas = RgbImage::from_pixel(target.0, target.1, fill);
  imageops::replace(&mut canvas, &resized, left as i64, top as i64);

  debug!(
    "信箱缩放: {}x{} -> {}x{}, 比例 {:.4}, 填充 上{} 左{}",
    frame.width(),
    frame.height(),
    geometry.scaled_width,
    geometry.scaled_height,
    geometry.ratio,
    top,
    left
  );

  let mut out = Frame::rgb_like(canvas.into_raw(), target.0, target.1, frame.order())
    .ok_or(PreprocessError::InvalidTarget(target.0, target.1))?;
  out.set_sequence(frame.sequence());
  Ok((out, geometry))
}

/// 帧到模型输入：信箱缩放后转换为推理后端要求的通道顺序
pub fn prepare_input(
  frame: &Frame,
  target: (u32, u32),
  order: ChannelOrder,
  pad_color: [u8; 3],
) -> Result<(InputTensor, Letterbox), PreprocessError> {
  let (boxed, geometry) = letterbox(frame, target, pad_color)?;
  let from = boxed.order();
  let mut data = boxed.into_data();
  convert_order(&mut data, from, order);
  let tensor = InputTensor::new(data, target.0, target.1, order)
    .ok_or(PreprocessError::InvalidTarget(target.0, target.1))?;
  Ok((tensor, geometry))
}
