// 该文件是 Tianyan （天眼） 项目的一部分。
// src/frame.rs - 采集帧与模型输入张量定义
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

const RGB_CHANNELS: u32 = 3;

/// 像素通道顺序
///
/// 摄像头一般给出 BGR，RKNN 模型输入一般要求 RGB。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

/// 采集得到的一帧图像（HWC 排列，8 位）
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  channels: u32,
  order: ChannelOrder,
  /// 帧序号，由 `FrameSlot` 在发布时写入，从 1 开始
  sequence: u64,
}

impl Frame {
  /// 由 HWC 数据构造一帧，数据长度必须等于 `width * height * channels`
  pub fn from_hwc(
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u32,
    order: ChannelOrder,
  ) -> Option<Self> {
    if data.len() != (width as usize) * (height as usize) * (channels as usize) {
      return None;
    }

    Some(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      channels,
      order,
      sequence: 0,
    })
  }

  /// 由三通道数据构造一帧
  pub fn rgb_like(data: Vec<u8>, width: u32, height: u32, order: ChannelOrder) -> Option<Self> {
    Self::from_hwc(data, width, height, RGB_CHANNELS, order)
  }

  /// 纯色帧，测试与占位使用
  pub fn filled(width: u32, height: u32, order: ChannelOrder, value: [u8; 3]) -> Self {
    let data = value
      .iter()
      .copied()
      .cycle()
      .take((width * height * RGB_CHANNELS) as usize)
      .collect::<Vec<_>>();

    Self {
      data: data.into_boxed_slice(),
      width,
      height,
      channels: RGB_CHANNELS,
      order,
      sequence: 0,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> u32 {
    self.channels
  }

  pub fn order(&self) -> ChannelOrder {
    self.order
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub(crate) fn set_sequence(&mut self, sequence: u64) {
    self.sequence = sequence;
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn into_data(self) -> Vec<u8> {
    self.data.into_vec()
  }
}

/// 模型输入张量，NHWC 排列，batch 固定为 1
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
  data: Box<[u8]>,
  width: u32,
  height: u32,
  order: ChannelOrder,
}

impl InputTensor {
  pub fn new(data: Vec<u8>, width: u32, height: u32, order: ChannelOrder) -> Option<Self> {
    if data.len() != (RGB_CHANNELS * width * height) as usize {
      return None;
    }

    Some(Self {
      data: data.into_boxed_slice(),
      width,
      height,
      order,
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> u32 {
    RGB_CHANNELS
  }

  pub fn order(&self) -> ChannelOrder {
    self.order
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_rejects_mismatched_length() {
    assert!(Frame::rgb_like(vec![0; 10], 2, 2, ChannelOrder::Bgr).is_none());
    assert!(Frame::rgb_like(vec![0; 12], 2, 2, ChannelOrder::Bgr).is_some());
  }

  #[test]
  fn filled_frame_repeats_pixel() {
    let frame = Frame::filled(2, 1, ChannelOrder::Bgr, [1, 2, 3]);
    assert_eq!(frame.data(), &[1, 2, 3, 1, 2, 3]);
    assert_eq!(frame.sequence(), 0);
  }
}
