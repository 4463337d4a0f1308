// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model/rknn.rs - RKNN 硬件推理后端
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

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use crate::{
  frame::InputTensor,
  model::{
    DEFAULT_STRIDES, InferenceAdapter, InferenceError, MODEL_INPUT_SIZE, NUM_SCALES,
    OutputTensor, ScaleOutput,
  },
};

const YOLOV8_NUM_INPUTS: u32 = 1;

/// 每个检测尺度的输出张量个数：至少为框分布与类别两个，
/// 部分导出还附带类别分数和张量
fn outputs_per_scale(num_outputs: u32) -> Option<usize> {
  let num_outputs = num_outputs as usize;
  if num_outputs % NUM_SCALES != 0 || num_outputs / NUM_SCALES < 2 {
    return None;
  }
  Some(num_outputs / NUM_SCALES)
}

/// 检测尺度 `scale` 的框分布与类别张量在输出列表中的下标
fn scale_tensor_indices(per_scale: usize, scale: usize) -> (usize, usize) {
  (per_scale * scale, per_scale * scale + 1)
}

pub struct RknnAdapter {
  context: Option<Context>,
  num_classes: usize,
  per_scale: usize,
}

impl RknnAdapter {
  /// 读取 .rknn 模型并初始化 NPU 运行时
  pub fn load(model_path: &str, num_classes: usize) -> Result<Self, InferenceError> {
    info!("加载模型文件: {}", model_path);
    let model_data = std::fs::read(model_path)
      .map_err(|e| InferenceError::ModelLoad(model_path.to_string(), e))?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, InitFlags::default())
      .map_err(|e| InferenceError::RuntimeInit(format!("创建上下文失败: {}", e)))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(InferenceError::RuntimeInit(format!("无法查询 SDK 版本: {}", e)));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| InferenceError::RuntimeInit(format!("无法获取输入数量: {}", e)))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| InferenceError::RuntimeInit(format!("无法获取输出数量: {}", e)))?;

    let per_scale = match outputs_per_scale(num_outputs) {
      Some(per_scale) if num_inputs == YOLOV8_NUM_INPUTS => per_scale,
      _ => {
        error!(
          "预期模型输入数量为 {}、输出数量为 {} 的倍数, 实际为 {}/{}",
          YOLOV8_NUM_INPUTS, NUM_SCALES, num_inputs, num_outputs
        );
        return Err(InferenceError::RuntimeInit(format!(
          "预期模型输入数量为 {}、输出数量为 {} 的倍数, 实际为 {}/{}",
          YOLOV8_NUM_INPUTS, NUM_SCALES, num_inputs, num_outputs
        )));
      }
    };
    debug!("每个检测尺度 {} 个输出张量", per_scale);

    info!("模型加载完成");
    Ok(Self {
      context: Some(context),
      num_classes,
      per_scale,
    })
  }
}

/// 根据张量大小区分框分布与类别输出，返回 (box, cls)
fn match_box_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  spatial: usize,
  num_classes: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  let cls_expected = num_classes * spatial;
  let is_box = |t: &[f32]| t.len() != cls_expected && t.len() % (4 * spatial) == 0;

  if tensor2.len() == cls_expected && is_box(tensor1) {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && is_box(tensor2) {
    debug!("输出顺序交换: 类别张量在前");
    Some((tensor2, tensor1))
  } else {
    None
  }
}

impl InferenceAdapter for RknnAdapter {
  fn input_size(&self) -> (u32, u32) {
    (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE)
  }

  fn run(&mut self, input: &InputTensor) -> Result<Vec<ScaleOutput>, InferenceError> {
    let context = self.context.as_ref().ok_or(InferenceError::NotInitialized)?;
    let failed =
      |stage: &str, e: rknpu::Error| InferenceError::Inference(format!("{}: {}", stage, e));

    debug!("设置模型输入");
    context
      .set_input(0, input.as_nhwc(), TensorFormat::NHWC, TensorType::UInt8)
      .map_err(|e| failed("设置输入", e))?;

    debug!("执行模型推理");
    context.run().map_err(|e| failed("执行推理", e))?;

    let output = context.get_outputs().map_err(|e| failed("获取输出", e))?;

    let mut scales = Vec::with_capacity(NUM_SCALES);
    for (scale, stride) in DEFAULT_STRIDES.iter().enumerate() {
      let grid = (MODEL_INPUT_SIZE / stride) as usize;
      let spatial = grid * grid;

      let (first, second) = scale_tensor_indices(self.per_scale, scale);
      let tensor1: &[f32] = &output
        .get_f32(first)
        .map_err(|e| failed("读取输出", e))?;
      let tensor2: &[f32] = &output
        .get_f32(second)
        .map_err(|e| failed("读取输出", e))?;

      let (box_dist, class_conf) =
        match_box_cls_tensors(tensor1, tensor2, spatial, self.num_classes).ok_or_else(|| {
          InferenceError::OutputShape(format!(
            "检测尺度 {}: 张量大小 {} / {} 与网格 {}x{} 不符",
            scale,
            tensor1.len(),
            tensor2.len(),
            grid,
            grid
          ))
        })?;

      let box_channels = box_dist.len() / spatial;
      scales.push(ScaleOutput {
        box_dist: OutputTensor::new(box_dist.to_vec(), [1, box_channels, grid, grid])?,
        class_conf: OutputTensor::new(class_conf.to_vec(), [1, self.num_classes, grid, grid])?,
      });
    }

    Ok(scales)
  }

  fn release(&mut self) {
    if self.context.take().is_some() {
      info!("释放 RKNN 上下文");
    }
  }
}
