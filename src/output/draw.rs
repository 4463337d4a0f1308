// 该文件是 Tianyan （天眼） 项目的一部分。
// src/output/draw.rs - 检测结果标注
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

use std::path::Path;
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  frame::{ChannelOrder, Frame},
  model::{DecodedBox, DetectionSet, Labels},
  preprocess::Letterbox,
};

const BOX_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const BOX_THICKNESS: u32 = 2;
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(String),
}

/// 把模型空间的检测框映射回原始帧坐标
pub fn map_to_source(set: &DetectionSet, geometry: &Letterbox) -> DetectionSet {
  DetectionSet::new(
    set.sequence(),
    set
      .iter()
      .map(|item| DecodedBox {
        bbox: geometry.to_source(item.bbox),
        ..*item
      })
      .collect(),
  )
}

/// 在帧上绘制检测框；配置字体后在框上方写出 `名称 分数`
#[derive(Clone)]
pub struct Draw {
  /// RGB 顺序
  color: [u8; 3],
  thickness: u32,
  labels: Labels,
  font: Option<Arc<FontVec>>,
}

impl std::fmt::Debug for Draw {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Draw")
      .field("color", &self.color)
      .field("thickness", &self.thickness)
      .field("labels", &self.labels.len())
      .field("font", &self.font.is_some())
      .finish()
  }
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      color: BOX_COLOR,
      thickness: BOX_THICKNESS,
      labels: Labels::default(),
      font: None,
    }
  }
}

impl Draw {
  pub fn with_labels(mut self, labels: Labels) -> Self {
    self.labels = labels;
    self
  }

  /// 从 TTF/OTF 文件加载标签字体
  pub fn with_font_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontVec::try_from_vec(data).map_err(|e| DrawError::InvalidFont(e.to_string()))?;
    info!("加载标签字体: {}", path.as_ref().display());
    self.font = Some(Arc::new(font));
    Ok(self)
  }

  fn label_text(&self, item: &DecodedBox) -> String {
    format!("{} {:.2}", self.labels.name(item.class_id), item.score)
  }

  fn color_for(&self, order: ChannelOrder) -> Rgb<u8> {
    let [r, g, b] = self.color;
    match order {
      ChannelOrder::Rgb => Rgb([r, g, b]),
      ChannelOrder::Bgr => Rgb([b, g, r]),
    }
  }

  // bbox 为原始帧中的绝对像素坐标，返回绘制后的左上角
  fn draw_bbox(&self, image: &mut RgbImage, bbox: &[f32; 4], color: Rgb<u8>) -> Option<(i32, i32)> {
    let (w, h) = (image.width() as i32, image.height() as i32);

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return None;
    }

    for t in 0..self.thickness as i32 {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }
    Some((x_min, y_min))
  }

  // 标签背景贴在框的上边缘外侧，超出图像时截断
  fn draw_label(
    &self,
    image: &mut RgbImage,
    font: &FontVec,
    (x_min, y_min): (i32, i32),
    label: &str,
    color: Rgb<u8>,
  ) {
    let text_width = (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as i32;
    let label_x = x_min.max(0);
    let label_y = (y_min - LABEL_TEXT_HEIGHT).max(0);

    let label_width = text_width.min((image.width() as i32 - label_x).max(0)) as u32;
    if label_width == 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width, LABEL_TEXT_HEIGHT as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      LABEL_TEXT_COLOR,
      label_x,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      PxScale::from(LABEL_FONT_SIZE),
      font,
      label,
    );
  }

  /// 在原始帧上标注检测结果，返回标注后的新帧
  ///
  /// `set` 为模型空间坐标，通过 `geometry` 映射回帧坐标。
  pub fn draw_detections(&self, frame: &Frame, set: &DetectionSet, geometry: &Letterbox) -> Frame {
    if frame.channels() != 3 {
      warn!("无法标注 {} 通道的帧", frame.channels());
      return frame.clone();
    }
    let Some(mut image): Option<RgbImage> =
      ImageBuffer::from_raw(frame.width(), frame.height(), frame.data().to_vec())
    else {
      return frame.clone();
    };

    let color = self.color_for(frame.order());
    for item in set.iter() {
      let corner = self.draw_bbox(&mut image, &geometry.to_source(item.bbox), color);
      if let (Some(corner), Some(font)) = (corner, self.font.as_deref()) {
        self.draw_label(&mut image, font, corner, &self.label_text(item), color);
      }
    }

    match Frame::rgb_like(image.into_raw(), frame.width(), frame.height(), frame.order()) {
      Some(mut out) => {
        out.set_sequence(frame.sequence());
        out
      }
      None => frame.clone(),
    }
  }
}

/// 按 RGB 顺序导出图像，用于保存
pub fn to_rgb_image(frame: &Frame) -> Option<RgbImage> {
  if frame.channels() != 3 {
    return None;
  }
  let mut data = frame.data().to_vec();
  crate::preprocess::convert_order(&mut data, frame.order(), ChannelOrder::Rgb);
  ImageBuffer::from_raw(frame.width(), frame.height(), data)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn identity(width: u32, height: u32) -> Letterbox {
    Letterbox::compute((width, height), (width, height)).unwrap().0
  }

  fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
    let idx = ((y * frame.width() + x) * 3) as usize;
    let d = frame.data();
    [d[idx], d[idx + 1], d[idx + 2]]
  }

  fn one_box(bbox: [f32; 4]) -> DetectionSet {
    DetectionSet::new(
      1,
      vec![DecodedBox {
        bbox,
        class_id: 0,
        score: 0.9,
      }],
    )
  }

  #[test]
  fn box_edges_are_two_pixels() {
    let frame = Frame::filled(20, 20, ChannelOrder::Rgb, [0, 0, 0]);
    let out = Draw::default().draw_detections(&frame, &one_box([5.0, 5.0, 15.0, 15.0]), &identity(20, 20));
    assert_eq!(pixel(&out, 5, 10), [0, 0, 255]);
    assert_eq!(pixel(&out, 6, 10), [0, 0, 255]);
    assert_eq!(pixel(&out, 7, 10), [0, 0, 0]);
    assert_eq!(pixel(&out, 10, 10), [0, 0, 0]);
    assert_eq!(pixel(&out, 15, 10), [0, 0, 255]);
  }

  #[test]
  fn color_follows_frame_order() {
    let frame = Frame::filled(10, 10, ChannelOrder::Bgr, [0, 0, 0]);
    let out = Draw::default().draw_detections(&frame, &one_box([1.0, 1.0, 8.0, 8.0]), &identity(10, 10));
    assert_eq!(pixel(&out, 1, 1), [255, 0, 0]);
    assert_eq!(out.order(), ChannelOrder::Bgr);
  }

  #[test]
  fn boxes_are_mapped_through_letterbox() {
    let (geometry, _) = Letterbox::compute((40, 20), (20, 20)).unwrap();
    let set = one_box([0.0, 5.0, 10.0, 15.0]);
    let mapped = map_to_source(&set, &geometry);
    assert_eq!(mapped.items()[0].bbox, [0.0, 0.0, 20.0, 20.0]);
    assert_eq!(mapped.sequence(), 1);
  }

  #[test]
  fn degenerate_boxes_are_skipped() {
    let frame = Frame::filled(10, 10, ChannelOrder::Rgb, [0, 0, 0]);
    let out = Draw::default().draw_detections(&frame, &one_box([4.0, 4.0, 4.0, 9.0]), &identity(10, 10));
    assert_eq!(out, frame);
  }

  fn font_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/DejaVuSans.ttf")
  }

  fn is_text(p: [u8; 3]) -> bool {
    p[0] > 128 && p[1] > 128
  }

  #[test]
  fn label_names_the_class_and_score() {
    let draw = Draw::default().with_labels(Labels::from_names(["person", "bicycle"]));
    let item = DecodedBox {
      bbox: [0.0; 4],
      class_id: 1,
      score: 0.876,
    };
    assert_eq!(draw.label_text(&item), "bicycle 0.88");
    assert_eq!(draw.label_text(&DecodedBox { class_id: 9, ..item }), "class9 0.88");
  }

  #[test]
  fn label_text_is_written_above_the_box() {
    let frame = Frame::filled(160, 100, ChannelOrder::Rgb, [0, 0, 0]);
    let set = one_box([10.0, 50.0, 150.0, 90.0]);
    let draw = Draw::default()
      .with_labels(Labels::from_names(["person"]))
      .with_font_file(font_path())
      .unwrap();
    let out = draw.draw_detections(&frame, &set, &identity(160, 100));

    let label_rows = 26..50;
    let text_pixels = label_rows
      .clone()
      .flat_map(|y| (10..150).map(move |x| (x, y)))
      .filter(|&(x, y)| is_text(pixel(&out, x, y)))
      .count();
    assert!(text_pixels > 20, "标签区域只有 {} 个文字像素", text_pixels);
    assert_eq!(pixel(&out, 10, 30), [0, 0, 255]);
    assert_eq!(pixel(&out, 10, 20), [0, 0, 0]);
    assert_eq!(pixel(&out, 80, 70), [0, 0, 0]);
  }

  #[test]
  fn without_font_only_boxes_are_drawn() {
    let frame = Frame::filled(160, 100, ChannelOrder::Rgb, [0, 0, 0]);
    let draw = Draw::default().with_labels(Labels::from_names(["person"]));
    let out = draw.draw_detections(&frame, &one_box([10.0, 50.0, 150.0, 90.0]), &identity(160, 100));
    assert!((0..50).all(|y| (0..160).all(|x| pixel(&out, x, y) == [0, 0, 0])));
  }

  #[test]
  fn missing_font_file_is_an_error() {
    let result = Draw::default().with_font_file("/nonexistent/font.ttf");
    assert!(matches!(result, Err(DrawError::Io(_))));
  }
}
