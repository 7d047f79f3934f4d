// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/output/directory_record.rs - 按日期目录记录逐帧结果
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

//! `folder:///path?always&json=false`
//!
//! 每帧写入 `<path>/<年>/<月>/<日>/<时-分-秒>-<序号>.png` 叠加图，以及同名的
//! `.json` 结果。默认只记录检测到区域的帧，`always` 记录所有帧。

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Datelike, Utc};
use thiserror::Error;

use crate::aggregate::DetectionResult;
use crate::frame::Frame;
use crate::output::{Render, draw::Overlay};
use crate::{FromUrl, FromUrlWithScheme, url_path};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  overlay: Overlay,
  frame_counter: Mutex<u32>,
  always: bool,
  json: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let json = !uri.query_pairs().any(|(k, v)| k == "json" && v == "false");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_path(uri)),
      overlay: Overlay::default(),
      frame_counter: Mutex::new(0),
      always,
      json,
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_id(&self) -> u32 {
    let mut counter = self
      .frame_counter
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    *counter = counter.wrapping_add(1);
    *counter
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:06X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_frame(&self, frame: &Frame, result: &DetectionResult) -> Result<(), Self::Error> {
    if !self.always && result.regions.is_empty() {
      return Ok(());
    }
    let path = self.frame_path()?;
    self.overlay.draw(frame, result).save(&path)?;
    if self.json {
      let writer = BufWriter::new(File::create(path.with_extension("json"))?);
      serde_json::to_writer_pretty(writer, result)?;
    }
    Ok(())
  }
}
