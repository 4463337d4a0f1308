// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model/labels.rs - 类别名称表
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

use tracing::debug;

/// 类别编号到名称的映射，每行一个名称
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels {
  names: Vec<String>,
}

impl Labels {
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let labels = Self::parse(&text);
    debug!(
      "从 {} 读取 {} 个类别名称",
      path.as_ref().display(),
      labels.len()
    );
    Ok(labels)
  }

  pub fn parse(text: &str) -> Self {
    Self::from_names(
      text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty()),
    )
  }

  pub fn from_names<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  /// 未知编号显示为 `class{id}`
  pub fn name(&self, class_id: u32) -> String {
    self
      .names
      .get(class_id as usize)
      .cloned()
      .unwrap_or_else(|| format!("class{}", class_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn blank_lines_are_skipped() {
    let labels = Labels::parse("person\n\n  bicycle \r\ncar\n");
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.name(1), "bicycle");
    assert_eq!(labels.name(2), "car");
  }

  #[test]
  fn unknown_ids_fall_back() {
    let labels = Labels::from_names(["person"]);
    assert_eq!(labels.name(0), "person");
    assert_eq!(labels.name(42), "class42");
    assert_eq!(Labels::default().name(3), "class3");
  }

  #[test]
  fn missing_file_is_an_error() {
    assert!(Labels::from_file("/nonexistent/labels.txt").is_err());
  }
}
