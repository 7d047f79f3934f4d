// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/output.rs - 逐帧结果输出
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

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::FromUrl;
#[cfg(feature = "directory_record")]
use crate::FromUrlWithScheme;
use crate::aggregate::DetectionResult;
use crate::frame::Frame;

/// 每处理完一帧调用一次；输出失败不影响任务
pub trait Render {
  type Error;
  fn render_frame(&self, frame: &Frame, result: &DetectionResult) -> Result<(), Self::Error>;
}

pub mod draw;

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::{DirectoryRecordOutput, DirectoryRecordOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "directory_record")]
  #[error("目录记录输出错误: {0}")]
  DirectoryRecordOutputError(#[from] DirectoryRecordOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// `log:` 只把每帧的摘要写入日志
pub struct LogOutput;

impl Render for LogOutput {
  type Error = OutputError;

  fn render_frame(&self, _frame: &Frame, result: &DetectionResult) -> Result<(), Self::Error> {
    match result.best() {
      Some(best) => info!(
        "帧 {}: {} 个区域，最佳 ({:.1}, {:.1}) r={:.1} 置信度 {:.2}，跟踪状态 {:?}",
        result.frame_index,
        result.regions.len(),
        best.center.x,
        best.center.y,
        best.radius,
        best.confidence,
        result.tracker_state
      ),
      None => info!(
        "帧 {}: 未检测到区域，跟踪状态 {:?}",
        result.frame_index, result.tracker_state
      ),
    }
    Ok(())
  }
}

pub enum OutputWrapper {
  Log(LogOutput),
  #[cfg(feature = "directory_record")]
  DirectoryRecordOutput(DirectoryRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "log" => Ok(OutputWrapper::Log(LogOutput)),
      #[cfg(feature = "directory_record")]
      DirectoryRecordOutput::SCHEME => {
        let output = DirectoryRecordOutput::from_url(url)?;
        Ok(OutputWrapper::DirectoryRecordOutput(output))
      }
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Render for OutputWrapper {
  type Error = OutputError;

  fn render_frame(&self, frame: &Frame, result: &DetectionResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Log(output) => output.render_frame(frame, result),
      #[cfg(feature = "directory_record")]
      OutputWrapper::DirectoryRecordOutput(output) => output
        .render_frame(frame, result)
        .map_err(OutputError::from),
    }
  }
}
