// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model/simulated.rs - 模拟推理后端
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

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::debug;

use crate::{
  frame::InputTensor,
  model::{
    DEFAULT_STRIDES, DFL_BINS, InferenceAdapter, InferenceError, MODEL_INPUT_SIZE, OutputTensor,
    ScaleOutput,
  },
};

/// 没有 NPU 的开发机上使用的后端，输出与真实模型同形状的随机张量
pub struct SimulatedAdapter {
  rng: Option<StdRng>,
  num_classes: usize,
}

impl SimulatedAdapter {
  pub fn new(num_classes: usize, seed: Option<u64>) -> Self {
    let rng = match seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
    };
    Self {
      rng: Some(rng),
      num_classes,
    }
  }

  fn random_tensor(rng: &mut StdRng, shape: [usize; 4]) -> OutputTensor {
    let mut tensor = OutputTensor::zeros(shape);
    let [_, c, h, w] = shape;
    for ci in 0..c {
      for hi in 0..h {
        for wi in 0..w {
          tensor.set(ci, hi, wi, rng.r#gen::<f32>());
        }
      }
    }
    tensor
  }
}

impl InferenceAdapter for SimulatedAdapter {
  fn input_size(&self) -> (u32, u32) {
    (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE)
  }

  fn run(&mut self, input: &InputTensor) -> Result<Vec<ScaleOutput>, InferenceError> {
    let rng = self.rng.as_mut().ok_or(InferenceError::NotInitialized)?;
    debug!("模拟推理: 输入 {}x{}", input.width(), input.height());

    Ok(
      DEFAULT_STRIDES
        .iter()
        .map(|&stride| {
          let grid = (MODEL_INPUT_SIZE / stride) as usize;
          ScaleOutput {
            box_dist: Self::random_tensor(rng, [1, 4 * DFL_BINS, grid, grid]),
            class_conf: Self::random_tensor(rng, [1, self.num_classes, grid, grid]),
          }
        })
        .collect(),
    )
  }

  fn release(&mut self) {
    self.rng = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::ChannelOrder;

  fn input() -> InputTensor {
    InputTensor::new(vec![0; 640 * 640 * 3], 640, 640, ChannelOrder::Rgb).unwrap()
  }

  #[test]
  fn outputs_have_model_shapes() {
    let mut adapter = SimulatedAdapter::new(9, Some(3));
    let outputs = adapter.run(&input()).unwrap();
    let shapes = outputs
      .iter()
      .map(|o| (o.box_dist.shape(), o.class_conf.shape()))
      .collect::<Vec<_>>();
    assert_eq!(
      shapes,
      vec![
        ([1, 64, 80, 80], [1, 9, 80, 80]),
        ([1, 64, 40, 40], [1, 9, 40, 40]),
        ([1, 64, 20, 20], [1, 9, 20, 20]),
      ]
    );
  }

  #[test]
  fn seeded_runs_repeat() {
    let a = SimulatedAdapter::new(2, Some(11)).run(&input()).unwrap();
    let b = SimulatedAdapter::new(2, Some(11)).run(&input()).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn release_is_idempotent() {
    let mut adapter = SimulatedAdapter::new(2, None);
    adapter.release();
    adapter.release();
    assert!(matches!(
      adapter.run(&input()),
      Err(InferenceError::NotInitialized)
    ));
  }
}
