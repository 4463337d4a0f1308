// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model.rs - 推理后端与检测结果定义
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

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl,
  frame::{ChannelOrder, InputTensor},
};

mod labels;
mod simulated;
mod yolov8;

pub use self::labels::Labels;
pub use self::simulated::SimulatedAdapter;
pub use self::yolov8::{
  DEFAULT_NMS_THRESHOLD, DEFAULT_OBJ_THRESHOLD, DEFAULT_STRIDES, DFL_BINS, DecodeError, Decoded,
  NUM_SCALES, PostprocessConfig, Yolov8Postprocessor, decode, filter_boxes, iou, nms,
  softmax_expectation,
};

#[cfg(feature = "rknpu")]
mod rknn;
#[cfg(feature = "rknpu")]
pub use self::rknn::RknnAdapter;

/// 模型输入边长
pub const MODEL_INPUT_SIZE: u32 = 640;
pub const DEFAULT_CLASS_NUM: usize = 80;

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("模型加载错误 {0}: {1}")]
  ModelLoad(String, std::io::Error),
  #[error("运行时初始化失败: {0}")]
  RuntimeInit(String),
  #[error("推理失败: {0}")]
  Inference(String),
  #[error("模型未初始化")]
  NotInitialized,
  #[error("输出张量形状错误: {0}")]
  OutputShape(String),
  #[error("推理后端不可用: {0}")]
  UnsupportedBackend(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// NCHW 排列的浮点输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
  data: Vec<f32>,
  shape: [usize; 4],
}

impl OutputTensor {
  pub fn new(data: Vec<f32>, shape: [usize; 4]) -> Result<Self, InferenceError> {
    let expected = shape.iter().product::<usize>();
    if data.len() != expected || shape[0] != 1 {
      return Err(InferenceError::OutputShape(format!(
        "形状 {:?} 需要 {} 个元素, 实际 {}",
        shape,
        expected,
        data.len()
      )));
    }
    Ok(Self { data, shape })
  }

  pub fn zeros(shape: [usize; 4]) -> Self {
    Self {
      data: vec![0.0; shape.iter().product()],
      shape,
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn channels(&self) -> usize {
    self.shape[1]
  }

  pub fn height(&self) -> usize {
    self.shape[2]
  }

  pub fn width(&self) -> usize {
    self.shape[3]
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn get(&self, c: usize, h: usize, w: usize) -> f32 {
    self.data[(c * self.shape[2] + h) * self.shape[3] + w]
  }

  pub fn set(&mut self, c: usize, h: usize, w: usize, value: f32) {
    let idx = (c * self.shape[2] + h) * self.shape[3] + w;
    self.data[idx] = value;
  }
}

/// 单个检测尺度的输出：框分布 [1, 4*bins, H, W] 与类别置信度 [1, classes, H, W]
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleOutput {
  pub box_dist: OutputTensor,
  pub class_conf: OutputTensor,
}

/// 推理后端
///
/// `run` 按固定尺度顺序（步长 8、16、32）返回三组输出。
/// 后端只在检测线程中使用，不要求 `Send`。
pub trait InferenceAdapter {
  /// 模型输入 (宽, 高)
  fn input_size(&self) -> (u32, u32);

  fn input_order(&self) -> ChannelOrder {
    ChannelOrder::Rgb
  }

  fn run(&mut self, input: &InputTensor) -> Result<Vec<ScaleOutput>, InferenceError>;

  /// 释放后端资源，允许重复调用
  fn release(&mut self);
}

impl<A: InferenceAdapter + ?Sized> InferenceAdapter for Box<A> {
  fn input_size(&self) -> (u32, u32) {
    (**self).input_size()
  }

  fn input_order(&self) -> ChannelOrder {
    (**self).input_order()
  }

  fn run(&mut self, input: &InputTensor) -> Result<Vec<ScaleOutput>, InferenceError> {
    (**self).run(input)
  }

  fn release(&mut self) {
    (**self).release()
  }
}

/// 检测框，坐标为模型输入空间的绝对像素
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecodedBox {
  pub bbox: [f32; 4], // [x1, y1, x2, y2]
  pub class_id: u32,
  pub score: f32,
}

/// 一帧的检测结果，发出后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSet {
  sequence: u64,
  items: Box<[DecodedBox]>,
}

impl DetectionSet {
  pub fn new(sequence: u64, items: Vec<DecodedBox>) -> Self {
    Self {
      sequence,
      items: items.into_boxed_slice(),
    }
  }

  pub fn empty(sequence: u64) -> Self {
    Self::new(sequence, Vec::new())
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn items(&self) -> &[DecodedBox] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &DecodedBox> {
    self.items.iter()
  }
}

/// 按 URL 方案选择的推理后端
///
/// - `rknn:///path/to/model.rknn?classes=80`（需要 `rknpu` 特性）
/// - `sim://?classes=80&seed=7`
///
/// 后端在构造时确定，加载失败直接返回错误，不会退回到模拟后端。
pub enum Backend {
  #[cfg(feature = "rknpu")]
  Rknn(RknnAdapter),
  Simulated(SimulatedAdapter),
}

const RKNN_SCHEME: &str = "rknn";
const SIMULATED_SCHEME: &str = "sim";

fn query_param<T: std::str::FromStr>(url: &Url, key: &str) -> Result<Option<T>, InferenceError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    Some((_, v)) => v
      .parse()
      .map(Some)
      .map_err(|_| InferenceError::RuntimeInit(format!("参数 {}={} 无法解析", key, v))),
    None => Ok(None),
  }
}

impl FromUrl for Backend {
  type Error = InferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let classes = query_param(url, "classes")?.unwrap_or(DEFAULT_CLASS_NUM);

    match url.scheme() {
      RKNN_SCHEME => {
        #[cfg(feature = "rknpu")]
        {
          Ok(Backend::Rknn(RknnAdapter::load(url.path(), classes)?))
        }
        #[cfg(not(feature = "rknpu"))]
        {
          Err(InferenceError::UnsupportedBackend(format!(
            "{} 需要启用 rknpu 特性",
            url
          )))
        }
      }
      SIMULATED_SCHEME => {
        let seed = query_param(url, "seed")?;
        info!("使用模拟推理后端, 类别数 {}", classes);
        Ok(Backend::Simulated(SimulatedAdapter::new(classes, seed)))
      }
      other => Err(InferenceError::SchemeMismatch(other.to_string())),
    }
  }
}

impl InferenceAdapter for Backend {
  fn input_size(&self) -> (u32, u32) {
    match self {
      #[cfg(feature = "rknpu")]
      Backend::Rknn(adapter) => adapter.input_size(),
      Backend::Simulated(adapter) => adapter.input_size(),
    }
  }

  fn input_order(&self) -> ChannelOrder {
    match self {
      #[cfg(feature = "rknpu")]
      Backend::Rknn(adapter) => adapter.input_order(),
      Backend::Simulated(adapter) => adapter.input_order(),
    }
  }

  fn run(&mut self, input: &InputTensor) -> Result<Vec<ScaleOutput>, InferenceError> {
    match self {
      #[cfg(feature = "rknpu")]
      Backend::Rknn(adapter) => adapter.run(input),
      Backend::Simulated(adapter) => adapter.run(input),
    }
  }

  fn release(&mut self) {
    match self {
      #[cfg(feature = "rknpu")]
      Backend::Rknn(adapter) => adapter.release(),
      Backend::Simulated(adapter) => adapter.release(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn output_tensor_checks_length() {
    assert!(OutputTensor::new(vec![0.0; 8], [1, 2, 2, 2]).is_ok());
    assert!(OutputTensor::new(vec![0.0; 7], [1, 2, 2, 2]).is_err());
    assert!(OutputTensor::new(vec![0.0; 16], [2, 2, 2, 2]).is_err());
  }

  #[test]
  fn output_tensor_indexing_is_nchw() {
    let mut t = OutputTensor::zeros([1, 2, 3, 4]);
    t.set(1, 2, 3, 5.0);
    assert_eq!(t.data()[23], 5.0);
    assert_eq!(t.get(1, 2, 3), 5.0);
  }

  #[test]
  fn backend_selection_by_scheme() {
    let url = Url::parse("sim://?classes=3&seed=1").unwrap();
    let backend = Backend::from_url(&url).unwrap();
    assert!(matches!(backend, Backend::Simulated(_)));

    let url = Url::parse("onnx:///model.onnx").unwrap();
    assert!(matches!(
      Backend::from_url(&url),
      Err(InferenceError::SchemeMismatch(_))
    ));

    let url = Url::parse("sim://?classes=many").unwrap();
    assert!(Backend::from_url(&url).is_err());
  }

  #[cfg(not(feature = "rknpu"))]
  #[test]
  fn rknn_without_feature_is_an_error() {
    let url = Url::parse("rknn:///models/yolov8n.rknn").unwrap();
    assert!(matches!(
      Backend::from_url(&url),
      Err(InferenceError::UnsupportedBackend(_))
    ));
  }
}
