// 该文件是 Tianyan （天眼） 项目的一部分。
// src/output/directory_record.rs - 按日期目录保存检测快照
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

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{DateTime, Datelike, Local};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{DetectionSet, Labels},
  output::{Render, draw::to_rgb_image},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无法导出 {0} 通道的帧")]
  UnsupportedFrame(u32),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct RecordItem {
  label: String,
  class_id: u32,
  score: f32,
  bbox: [f32; 4],
}

#[derive(Serialize)]
struct Record {
  sequence: u64,
  timestamp: String,
  width: u32,
  height: u32,
  detections: Vec<RecordItem>,
}

/// 快照输出：`folder:///path/to/dir[?always][&labels=/path/labels.txt]`
///
/// 文件保存在 `dir/YYYY/MM/DD/HH-MM-SS-XXXX.png`，同名 `.json` 记录检测结果。
/// 默认只保存有检测结果的帧。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  labels: Labels,
  frame_counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let labels = match uri.query_pairs().find(|(k, _)| k == "labels") {
      Some((_, path)) => Labels::from_file(&*path)?,
      None => Labels::default(),
    };

    Ok(Self::new(uri.path(), labels, always))
  }
}

impl DirectoryRecordOutput {
  pub fn new<P: AsRef<Path>>(directory: P, labels: Labels, always: bool) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      labels,
      frame_counter: AtomicU16::new(0),
      always,
    }
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self, now: &DateTime<Local>) -> Result<PathBuf, DirectoryRecordError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }

  /// 保存一帧，返回图像路径；无检测且未设置 `always` 时跳过
  pub fn save(
    &self,
    frame: &Frame,
    result: &DetectionSet,
  ) -> Result<Option<PathBuf>, DirectoryRecordError> {
    if !self.always && result.is_empty() {
      return Ok(None);
    }

    let image =
      to_rgb_image(frame).ok_or(DirectoryRecordError::UnsupportedFrame(frame.channels()))?;
    let now = Local::now();
    let path = self.frame_path(&now)?;
    image.save(&path)?;

    let record = Record {
      sequence: result.sequence(),
      timestamp: now.to_rfc3339(),
      width: frame.width(),
      height: frame.height(),
      detections: result
        .iter()
        .map(|item| RecordItem {
          label: self.labels.name(item.class_id),
          class_id: item.class_id,
          score: item.score,
          bbox: item.bbox,
        })
        .collect(),
    };
    let file = std::fs::File::create(path.with_extension("json"))?;
    serde_json::to_writer_pretty(file, &record)?;

    debug!("保存快照 {} ({} 个目标)", path.display(), result.len());
    Ok(Some(path))
  }
}

impl Render<Frame, DetectionSet> for DirectoryRecordOutput {
  type Error = DirectoryRecordError;

  fn render_result(&self, frame: &Frame, result: &DetectionSet) -> Result<(), Self::Error> {
    self.save(frame, result).map(|_| ())
  }
}
