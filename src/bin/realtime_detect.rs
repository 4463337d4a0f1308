// 该文件是 Tianyan （天眼） 项目的一部分。
// src/bin/realtime_detect.rs - 实时检测程序
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

use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{debug, error, info, warn};
use url::Url;

use tianyan::{
  FromUrl,
  input::{
    DEFAULT_CAPTURE_FPS, DEFAULT_CAPTURE_HEIGHT, DEFAULT_CAPTURE_WIDTH, DeviceWrapper, FrameSource,
  },
  model::{
    Backend, DEFAULT_NMS_THRESHOLD, DEFAULT_OBJ_THRESHOLD, Labels, PostprocessConfig,
    Yolov8Postprocessor,
  },
  output::{
    OutputWrapper, Render,
    draw::{Draw, map_to_source},
  },
  task::{DetectionLoop, LoopOptions},
};

/// Tianyan 实时检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 推理后端，例如 rknn:///models/yolov8n.rknn 或 sim://?seed=7
  #[arg(long, value_name = "MODEL", default_value = "sim://")]
  pub model: Url,
  /// 输入来源，例如 v4l:///dev/video21；缺省时按优先级查找摄像头
  #[arg(long, value_name = "SOURCE")]
  pub input: Option<Url>,
  /// 快照输出，例如 folder:///data/records
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  /// 类别名称文件，每行一个
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
  /// 标签字体文件 (TTF/OTF)；缺省时只绘制检测框
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,

  #[arg(long, default_value_t = DEFAULT_CAPTURE_WIDTH)]
  pub width: u32,
  #[arg(long, default_value_t = DEFAULT_CAPTURE_HEIGHT)]
  pub height: u32,
  #[arg(long, default_value_t = DEFAULT_CAPTURE_FPS)]
  pub fps: u32,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = DEFAULT_OBJ_THRESHOLD, value_name = "THRESHOLD")]
  pub confidence: f32,
  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = DEFAULT_NMS_THRESHOLD, value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 处理指定帧数后退出，0 表示不限制
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: usize,
}

#[cfg(feature = "v4l_capture")]
fn default_input() -> Result<Url> {
  use tianyan::input::{DEFAULT_DEVICE_PRIORITY, V4lDevice, enumerate_devices};

  let usable = enumerate_devices::<V4lDevice>(&DEFAULT_DEVICE_PRIORITY);
  match usable.first() {
    Some(index) => Ok(Url::parse(&format!("v4l:///dev/video{}", index))?),
    None => bail!("没有可用的摄像头 (尝试了 {:?})", DEFAULT_DEVICE_PRIORITY),
  }
}

#[cfg(not(feature = "v4l_capture"))]
fn default_input() -> Result<Url> {
  bail!("未指定 --input，且未启用 v4l_capture 特性")
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let input = match args.input {
    Some(url) => url,
    None => default_input()?,
  };
  info!("输入来源: {}", input);
  info!("推理后端: {}", args.model);

  let labels = match &args.labels {
    Some(path) => Labels::from_file(path)?,
    None => Labels::default(),
  };
  let output = args.output.as_ref().map(OutputWrapper::from_url).transpose()?;

  let mut draw = Draw::default().with_labels(labels.clone());
  if let Some(path) = &args.font {
    draw = draw.with_font_file(path)?;
  }

  let source = Arc::new(FrameSource::<DeviceWrapper>::open(
    &input,
    args.width,
    args.height,
    args.fps,
  )?);
  if !source.start_capture() {
    bail!("无法启动采集");
  }

  let postprocessor = Yolov8Postprocessor::new(PostprocessConfig {
    obj_threshold: args.confidence,
    nms_threshold: args.nms_threshold,
    ..Default::default()
  });
  let model = args.model.clone();
  let (mut detection, events) = DetectionLoop::start_with_loader(
    source.clone(),
    move || Backend::from_url(&model),
    postprocessor,
    LoopOptions {
      draw,
      ..Default::default()
    },
  )?;

  let (stop_tx, stop_rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = stop_tx.send(());
  })?;

  let mut frame_index = 0usize;
  let mut outcome = Ok(());
  loop {
    if stop_rx.try_recv().is_ok() {
      warn!("中断信号接收，退出检测循环");
      break;
    }

    let event = match events.recv_timeout(Duration::from_millis(100)) {
      Ok(event) => event,
      Err(mpsc::RecvTimeoutError::Timeout) => continue,
      Err(mpsc::RecvTimeoutError::Disconnected) => break,
    };

    match event {
      Ok(result) => {
        frame_index += 1;
        info!(
          "第 {} 帧: {} 个目标, 推理 {:.2} ms, {:.1} fps",
          frame_index, result.detection_count, result.inference_ms, result.fps
        );

        let mapped = map_to_source(&result.detections, &result.letterbox);
        for item in mapped.iter() {
          debug!(
            "  {} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}]",
            labels.name(item.class_id),
            item.score,
            item.bbox[0],
            item.bbox[1],
            item.bbox[2],
            item.bbox[3]
          );
        }

        if let Some(output) = &output {
          if let Err(e) = output.render_result(&result.frame, &mapped) {
            warn!("保存快照失败: {}", e);
          }
        }

        if args.frame_number > 0 && frame_index >= args.frame_number {
          info!("达到指定帧数 {}, 退出检测循环", frame_index);
          break;
        }
      }
      Err(failure) => {
        error!("检测会话失败: {}", failure);
        outcome = Err(failure.into());
        break;
      }
    }
  }

  detection.stop();
  source.stop_capture();
  info!("任务完成，退出");
  outcome
}
