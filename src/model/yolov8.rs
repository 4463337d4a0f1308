// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 后处理（DFL 解码、阈值过滤、NMS）
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

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::model::{DecodedBox, DetectionSet, MODEL_INPUT_SIZE, ScaleOutput};

pub const NUM_SCALES: usize = 3;
pub const DEFAULT_STRIDES: [u32; NUM_SCALES] = [8, 16, 32];
/// 每条边的距离分布桶数
pub const DFL_BINS: usize = 16;
pub const DEFAULT_OBJ_THRESHOLD: f32 = 0.25;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const IOU_EPSILON: f32 = 1e-5;
const BOX_SIDES: usize = 4;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
  #[error("预期 {expected} 个检测尺度, 实际 {actual}")]
  ScaleCount { expected: usize, actual: usize },
  #[error("检测尺度 {scale}: 框分布网格 {box_grid:?} 与类别网格 {cls_grid:?} 不一致")]
  GridMismatch {
    scale: usize,
    box_grid: (usize, usize),
    cls_grid: (usize, usize),
  },
  #[error("检测尺度 {scale}: 框分布通道数 {channels} 不能按 4 条边划分")]
  BinCount { scale: usize, channels: usize },
  #[error("检测尺度 {scale}: 类别数 {actual} 与前面的尺度 {expected} 不一致")]
  ClassCount {
    scale: usize,
    expected: usize,
    actual: usize,
  },
  #[error("检测尺度 {scale}: 网格 {grid:?} 大于输入尺寸 {input:?}")]
  GridTooLarge {
    scale: usize,
    grid: (usize, usize),
    input: (u32, u32),
  },
}

/// 所有尺度展平后的解码结果，`boxes` 与 `class_conf` 按网格单元一一对应
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
  pub boxes: Vec<[f32; 4]>,
  /// `[N, num_classes]` 行优先
  pub class_conf: Vec<f32>,
  pub num_classes: usize,
}

impl Decoded {
  pub fn len(&self) -> usize {
    self.boxes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.boxes.is_empty()
  }

  pub fn class_row(&self, index: usize) -> &[f32] {
    &self.class_conf[index * self.num_classes..(index + 1) * self.num_classes]
  }
}

/// 对一组 logits 做数值稳定的 softmax，返回以桶下标加权的期望
pub fn softmax_expectation<I>(logits: I) -> f32
where
  I: IntoIterator<Item = f32>,
  I::IntoIter: Clone,
{
  let logits = logits.into_iter();
  let max = logits.clone().fold(f32::NEG_INFINITY, f32::max);

  let (weighted, total) = logits
    .enumerate()
    .fold((0.0f32, 0.0f32), |(weighted, total), (i, x)| {
      let e = (x - max).exp();
      (weighted + i as f32 * e, total + e)
    });

  weighted / total
}

/// 把各尺度的原始输出解码为输入空间的绝对像素框
///
/// 尺度顺序沿用推理后端的输出顺序；步长按 输入尺寸 / 网格尺寸 取整。
pub fn decode(
  outputs: &[ScaleOutput],
  input_width: u32,
  input_height: u32,
) -> Result<Decoded, DecodeError> {
  if outputs.len() != NUM_SCALES {
    return Err(DecodeError::ScaleCount {
      expected: NUM_SCALES,
      actual: outputs.len(),
    });
  }

  let num_classes = outputs[0].class_conf.channels();
  let total = outputs
    .iter()
    .map(|o| o.box_dist.height() * o.box_dist.width())
    .sum::<usize>();
  let mut boxes = Vec::with_capacity(total);
  let mut class_conf = Vec::with_capacity(total * num_classes);

  for (scale, ScaleOutput { box_dist, class_conf: cls }) in outputs.iter().enumerate() {
    let (grid_h, grid_w) = (box_dist.height(), box_dist.width());
    if (cls.height(), cls.width()) != (grid_h, grid_w) {
      return Err(DecodeError::GridMismatch {
        scale,
        box_grid: (grid_h, grid_w),
        cls_grid: (cls.height(), cls.width()),
      });
    }
    if box_dist.channels() == 0 || box_dist.channels() % BOX_SIDES != 0 {
      return Err(DecodeError::BinCount {
        scale,
        channels: box_dist.channels(),
      });
    }
    if cls.channels() != num_classes {
      return Err(DecodeError::ClassCount {
        scale,
        expected: num_classes,
        actual: cls.channels(),
      });
    }
    if grid_h == 0 || grid_w == 0 || grid_w > input_width as usize || grid_h > input_height as usize
    {
      return Err(DecodeError::GridTooLarge {
        scale,
        grid: (grid_h, grid_w),
        input: (input_width, input_height),
      });
    }

    let bins = box_dist.channels() / BOX_SIDES;
    let stride_x = (input_width as usize / grid_w) as f32;
    let stride_y = (input_height as usize / grid_h) as f32;
    debug!(
      "检测尺度 {}: 网格 {}x{}, 步长 {}x{}, 每边 {} 个桶",
      scale, grid_w, grid_h, stride_x, stride_y, bins
    );

    for h in 0..grid_h {
      for w in 0..grid_w {
        let mut dist = [0.0f32; BOX_SIDES];
        for (side, d) in dist.iter_mut().enumerate() {
          *d = softmax_expectation((0..bins).map(|b| box_dist.get(side * bins + b, h, w)));
        }

        let cx = w as f32 + 0.5;
        let cy = h as f32 + 0.5;
        boxes.push([
          (cx - dist[0]) * stride_x,
          (cy - dist[1]) * stride_y,
          (cx + dist[2]) * stride_x,
          (cy + dist[3]) * stride_y,
        ]);

        class_conf.extend((0..num_classes).map(|c| cls.get(c, h, w)));
      }
    }
  }

  Ok(Decoded {
    boxes,
    class_conf,
    num_classes,
  })
}

/// 取类别最大值作为得分，保留得分不低于阈值的框
pub fn filter_boxes(decoded: &Decoded, obj_threshold: f32) -> Vec<DecodedBox> {
  (0..decoded.len())
    .filter_map(|i| {
      let (class_id, score) = decoded.class_row(i).iter().copied().enumerate().fold(
        (0usize, f32::NEG_INFINITY),
        |best, (c, s)| if s > best.1 { (c, s) } else { best },
      );

      (score >= obj_threshold).then(|| DecodedBox {
        bbox: decoded.boxes[i],
        class_id: class_id as u32,
        score,
      })
    })
    .collect()
}

/// 两个框的交并比，交集宽高各加一个极小值防止除零
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);

  let w = (a[2].min(b[2]) - a[0].max(b[0]) + IOU_EPSILON).max(0.0);
  let h = (a[3].min(b[3]) - a[1].max(b[1]) + IOU_EPSILON).max(0.0);
  let inter = w * h;

  inter / (area_a + area_b - inter)
}

/// 单个类别内的贪心 NMS，返回保留框的下标
///
/// 得分相同时按原下标升序。
pub fn nms(boxes: &[DecodedBox], nms_threshold: f32) -> Vec<usize> {
  let mut order = (0..boxes.len()).collect::<Vec<_>>();
  order.sort_by(|&a, &b| boxes[b].score.total_cmp(&boxes[a].score));

  let mut keep = Vec::new();
  while let Some((&best, rest)) = order.split_first() {
    keep.push(best);
    order = rest
      .iter()
      .copied()
      .filter(|&j| iou(&boxes[best].bbox, &boxes[j].bbox) <= nms_threshold)
      .collect();
  }

  keep
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessConfig {
  pub obj_threshold: f32,
  pub nms_threshold: f32,
  pub input_width: u32,
  pub input_height: u32,
}

impl Default for PostprocessConfig {
  fn default() -> Self {
    Self {
      obj_threshold: DEFAULT_OBJ_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      input_width: MODEL_INPUT_SIZE,
      input_height: MODEL_INPUT_SIZE,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct Yolov8Postprocessor {
  config: PostprocessConfig,
}

impl Yolov8Postprocessor {
  pub fn new(config: PostprocessConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PostprocessConfig {
    &self.config
  }

  /// 解码、过滤并按类别做 NMS
  ///
  /// 没有框留下时返回空的 `DetectionSet`。
  pub fn process(
    &self,
    outputs: &[ScaleOutput],
    sequence: u64,
  ) -> Result<DetectionSet, DecodeError> {
    let decoded = decode(outputs, self.config.input_width, self.config.input_height)?;
    let candidates = filter_boxes(&decoded, self.config.obj_threshold);

    let mut by_class: BTreeMap<u32, Vec<DecodedBox>> = BTreeMap::new();
    for item in candidates {
      by_class.entry(item.class_id).or_default().push(item);
    }

    let mut items = Vec::new();
    for boxes in by_class.values() {
      items.extend(nms(boxes, self.config.nms_threshold).into_iter().map(|i| boxes[i]));
    }

    debug!("帧 {}: 检测到 {} 个物体", sequence, items.len());
    Ok(DetectionSet::new(sequence, items))
  }
}
