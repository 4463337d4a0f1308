// 该文件是 Tianyan （天眼） 项目的一部分。
// src/bin/list_devices.rs - 列出可用摄像头
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tianyan::input::DEFAULT_DEVICE_PRIORITY;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 候选设备编号，缺省使用内置优先级
  #[arg(long, value_delimiter = ',')]
  pub candidates: Vec<u32>,
  /// 同时探测每个设备支持的分辨率
  #[arg(long)]
  pub probe: bool,
}

#[cfg(feature = "v4l_capture")]
fn list(candidates: &[u32], probe: bool) -> Result<()> {
  use tianyan::input::{
    DEFAULT_CAPTURE_FPS, DEFAULT_CAPTURE_HEIGHT, DEFAULT_CAPTURE_WIDTH, FrameSource, V4lDevice,
    enumerate_devices,
  };

  let usable = enumerate_devices::<V4lDevice>(candidates);
  if usable.is_empty() {
    info!("没有可用的摄像头");
    return Ok(());
  }

  for index in usable {
    if !probe {
      info!("/dev/video{}", index);
      continue;
    }
    let source = FrameSource::<V4lDevice>::open(
      &index,
      DEFAULT_CAPTURE_WIDTH,
      DEFAULT_CAPTURE_HEIGHT,
      DEFAULT_CAPTURE_FPS,
    )?;
    info!("/dev/video{}: {:?}", index, source.probe_resolutions());
  }
  Ok(())
}

#[cfg(not(feature = "v4l_capture"))]
fn list(_candidates: &[u32], _probe: bool) -> Result<()> {
  tracing::warn!("未启用 v4l_capture 特性，无法枚举摄像头");
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let candidates = if args.candidates.is_empty() {
    DEFAULT_DEVICE_PRIORITY.to_vec()
  } else {
    args.candidates
  };
  info!("候选设备: {:?}", candidates);

  list(&candidates, args.probe)
}
