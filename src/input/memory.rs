// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/input/memory.rs - 内存视频
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

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use image::RgbImage;

use super::{FrameDecoder, InputError, RawFrame, VideoMetadata};

/// 已解码的帧序列，可注入损坏帧、解码失败和解码延迟
#[derive(Debug, Clone)]
pub struct MemoryVideo {
  metadata: VideoMetadata,
  frames: VecDeque<RgbImage>,
  position: u64,
  corrupt: BTreeSet<u64>,
  failure_at: Option<u64>,
  open_failure: bool,
  delay: Option<Duration>,
}

impl MemoryVideo {
  pub fn new(frames: Vec<RgbImage>, fps: f64) -> Self {
    let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
    let metadata = VideoMetadata::new(Some(fps), Some(frames.len() as u64), width, height, None);
    Self {
      metadata,
      frames: frames.into(),
      position: 0,
      corrupt: BTreeSet::new(),
      failure_at: None,
      open_failure: false,
      delay: None,
    }
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  /// 第 `position` 帧（源帧序号）解码时报告损坏
  pub fn with_corrupt_frame(mut self, position: u64) -> Self {
    self.corrupt.insert(position);
    self
  }

  /// 第 `position` 帧起无法继续解码
  pub fn with_failure_at(mut self, position: u64) -> Self {
    self.failure_at = Some(position);
    self
  }

  pub fn with_open_failure(mut self) -> Self {
    self.open_failure = true;
    self
  }

  /// 每帧解码前等待，模拟 I/O
  pub fn with_frame_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// 覆盖元数据中的帧数，模拟容器报告不准确
  pub fn with_reported_frame_count(mut self, frame_count: Option<u64>) -> Self {
    self.metadata.frame_count = frame_count;
    self
  }

  pub(crate) fn check_open(&self) -> Result<(), InputError> {
    if self.open_failure {
      return Err(InputError::Open("容器无法识别".to_string()));
    }
    Ok(())
  }
}

impl FrameDecoder for MemoryVideo {
  fn metadata(&self) -> &VideoMetadata {
    &self.metadata
  }

  fn next_frame(&mut self) -> Option<Result<RawFrame, InputError>> {
    let position = self.position;
    if self.failure_at.is_some_and(|at| position >= at) {
      return Some(Err(InputError::Decode(format!(
        "第 {} 帧之后的数据不可读",
        position
      ))));
    }
    if let Some(delay) = self.delay {
      std::thread::sleep(delay);
    }
    let image = self.frames.pop_front()?;
    self.position += 1;
    if self.corrupt.contains(&position) {
      return Some(Err(InputError::CorruptFrame {
        position,
        reason: "数据校验失败".to_string(),
      }));
    }
    Some(Ok(RawFrame {
      image,
      timestamp_ms: None,
    }))
  }
}
