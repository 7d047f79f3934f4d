// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/input.rs - 视频输入与抽帧
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

//! # 视频输入
//!
//! 解码器（[`FrameDecoder`]）逐帧产出原始图像，[`FrameSource`] 在其上按目标
//! 帧率抽帧并重新编号。输入源由 URL 的 scheme 决定：
//!
//! | scheme | 输入 | 特性 |
//! |---|---|---|
//! | `frames` | 目录中的图像序列 | `read_image_file` |
//! | `gst` | GStreamer 解码的视频文件 | `gstreamer_input` |
//!
//! 测试与嵌入场景可以直接使用内存中的 [`MemoryVideo`]。

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::FromUrl;
use crate::frame::Frame;

mod memory;
pub use self::memory::MemoryVideo;

#[cfg(feature = "read_image_file")]
mod image_sequence;
#[cfg(feature = "read_image_file")]
pub use self::image_sequence::{ImageSequenceInput, ImageSequenceInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputError};

/// 源帧率未知或为 0 时使用的帧率
pub const FALLBACK_FPS: f64 = 25.0;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("无法打开视频: {0}")]
  Open(String),
  /// 单帧损坏，跳过后可以继续读取
  #[error("第 {position} 帧解码失败: {reason}")]
  CorruptFrame { position: u64, reason: String },
  #[error("视频解码失败: {0}")]
  Decode(String),
  #[error("不支持的输入 URL: {0}")]
  SchemeMismatch(String),
  #[error("URL 解析失败: {0}")]
  InvalidUrl(#[from] url::ParseError),
  #[cfg(feature = "read_image_file")]
  #[error("图像序列输入错误: {0}")]
  ImageSequence(#[from] ImageSequenceInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamer(#[from] GStreamerInputError),
}

impl InputError {
  pub fn is_corrupt_frame(&self) -> bool {
    matches!(self, InputError::CorruptFrame { .. })
  }
}

/// 容器元数据
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
  pub fps: f64,
  pub frame_count: Option<u64>,
  pub width: u32,
  pub height: u32,
  pub duration_secs: Option<f64>,
}

impl VideoMetadata {
  /// 帧数缺失时由时长推算，时长缺失时由帧数推算
  pub fn new(
    fps: Option<f64>,
    frame_count: Option<u64>,
    width: u32,
    height: u32,
    duration_secs: Option<f64>,
  ) -> Self {
    let fps = match fps {
      Some(fps) if fps.is_finite() && fps > 0.0 => fps,
      _ => FALLBACK_FPS,
    };
    let frame_count =
      frame_count.or_else(|| duration_secs.map(|d| (d * fps).round().max(0.0) as u64));
    let duration_secs = duration_secs.or_else(|| frame_count.map(|n| n as f64 / fps));
    Self {
      fps,
      frame_count,
      width,
      height,
      duration_secs,
    }
  }
}

/// 解码器产出的一帧
pub struct RawFrame {
  pub image: RgbImage,
  pub timestamp_ms: Option<u64>,
}

/// 逐帧解码
///
/// 返回 `Some(Err(InputError::CorruptFrame))` 表示该帧损坏但可以继续，
/// 其他错误表示无法继续读取。
pub trait FrameDecoder {
  fn metadata(&self) -> &VideoMetadata;
  fn next_frame(&mut self) -> Option<Result<RawFrame, InputError>>;
}

pub enum InputWrapper {
  Memory(MemoryVideo),
  #[cfg(feature = "read_image_file")]
  ImageSequence(ImageSequenceInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInput::SCHEME {
        return Ok(InputWrapper::GStreamer(GStreamerInput::from_url(url)?));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageSequenceInput::SCHEME {
        return Ok(InputWrapper::ImageSequence(ImageSequenceInput::from_url(url)?));
      }
    }
    Err(InputError::SchemeMismatch(url.to_string()))
  }
}

impl FrameDecoder for InputWrapper {
  fn metadata(&self) -> &VideoMetadata {
    match self {
      InputWrapper::Memory(input) => input.metadata(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageSequence(input) => input.metadata(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.metadata(),
    }
  }

  fn next_frame(&mut self) -> Option<Result<RawFrame, InputError>> {
    match self {
      InputWrapper::Memory(input) => input.next_frame(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageSequence(input) => input.next_frame(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.next_frame(),
    }
  }
}

/// 任务引用的视频
pub enum VideoHandle {
  Url(String),
  Memory(MemoryVideo),
}

impl VideoHandle {
  pub fn describe(&self) -> String {
    match self {
      VideoHandle::Url(url) => url.clone(),
      VideoHandle::Memory(video) => format!("memory({} frames)", video.len()),
    }
  }

  pub fn open(self, target_fps: f64) -> Result<FrameSource, InputError> {
    let decoder = match self {
      VideoHandle::Url(raw) => {
        let url = url::Url::parse(&raw)?;
        InputWrapper::from_url(&url)?
      }
      VideoHandle::Memory(video) => {
        video.check_open()?;
        InputWrapper::Memory(video)
      }
    };
    Ok(FrameSource::new(decoder, target_fps))
  }
}

/// 抽帧步长：`max(1, floor(源帧率 / 目标帧率))`，不会重复帧来提高帧率
pub fn sampling_stride(source_fps: f64, target_fps: f64) -> u64 {
  if target_fps.is_nan() || source_fps.is_nan() || target_fps <= 0.0 || source_fps <= 0.0 {
    return 1;
  }
  ((source_fps / target_fps).floor() as u64).max(1)
}

/// 按目标帧率抽帧后的有限帧序列，不可重新开始
pub struct FrameSource {
  decoder: InputWrapper,
  metadata: VideoMetadata,
  stride: u64,
  position: u64,
  emitted: u64,
  corrupt: u64,
  finished: bool,
}

impl FrameSource {
  pub fn new(decoder: InputWrapper, target_fps: f64) -> Self {
    let metadata = *decoder.metadata();
    let stride = sampling_stride(metadata.fps, target_fps);
    info!(
      "视频 {}x{} @ {:.2} fps，抽帧步长 {}",
      metadata.width, metadata.height, metadata.fps, stride
    );
    Self {
      decoder,
      metadata,
      stride,
      position: 0,
      emitted: 0,
      corrupt: 0,
      finished: false,
    }
  }

  pub fn metadata(&self) -> &VideoMetadata {
    &self.metadata
  }

  pub fn stride(&self) -> u64 {
    self.stride
  }

  /// 预计抽出的帧数；帧数未知时为 `None`
  pub fn expected_frames(&self) -> Option<u64> {
    self
      .metadata
      .frame_count
      .map(|n| n.div_ceil(self.stride))
  }

  pub fn corrupt_frames(&self) -> u64 {
    self.corrupt
  }
}

impl Iterator for FrameSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    while !self.finished {
      let position = self.position;
      match self.decoder.next_frame() {
        None => {
          self.finished = true;
          debug!("视频读取结束，共 {} 帧，抽出 {} 帧", position, self.emitted);
        }
        Some(Err(e)) if e.is_corrupt_frame() => {
          self.position += 1;
          self.corrupt += 1;
          warn!("跳过损坏帧: {}", e);
        }
        Some(Err(e)) => {
          self.finished = true;
          return Some(Err(e));
        }
        Some(Ok(raw)) => {
          self.position += 1;
          if position % self.stride != 0 {
            continue;
          }
          let timestamp_ms = raw
            .timestamp_ms
            .unwrap_or_else(|| (position as f64 * 1000.0 / self.metadata.fps).round() as u64);
          let index = self.emitted;
          self.emitted += 1;
          return Some(Ok(Frame::new(index, timestamp_ms, raw.image)));
        }
      }
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn video(n: usize, fps: f64) -> MemoryVideo {
    MemoryVideo::new(
      (0..n)
        .map(|i| RgbImage::from_pixel(8, 8, image::Rgb([i as u8, 0, 0])))
        .collect(),
      fps,
    )
  }

  #[test]
  fn stride_never_upsamples() {
    assert_eq!(sampling_stride(30.0, 8.0), 3);
    assert_eq!(sampling_stride(25.0, 8.0), 3);
    assert_eq!(sampling_stride(8.0, 8.0), 1);
    assert_eq!(sampling_stride(5.0, 8.0), 1);
    assert_eq!(sampling_stride(0.0, 8.0), 1);
  }

  #[test]
  fn metadata_falls_back_to_default_fps() {
    let meta = VideoMetadata::new(Some(0.0), Some(50), 10, 10, None);
    assert_eq!(meta.fps, FALLBACK_FPS);
    assert_eq!(meta.duration_secs, Some(2.0));
    let meta = VideoMetadata::new(Some(10.0), None, 10, 10, Some(3.0));
    assert_eq!(meta.frame_count, Some(30));
  }

  #[test]
  fn frames_are_sampled_and_renumbered() {
    let source = VideoHandle::Memory(video(30, 24.0)).open(8.0).unwrap();
    assert_eq!(source.stride(), 3);
    assert_eq!(source.expected_frames(), Some(10));
    let frames: Vec<Frame> = source.map(|f| f.unwrap()).collect();
    assert_eq!(frames.len(), 10);
    for (i, frame) in frames.iter().enumerate() {
      assert_eq!(frame.index, i as u64);
      assert_eq!(frame.image.get_pixel(0, 0).0[0], (i * 3) as u8);
    }
    assert_eq!(frames[1].timestamp_ms, 125);
  }

  #[test]
  fn corrupt_frame_is_skipped_and_counted() {
    let mut source = VideoHandle::Memory(video(6, 8.0).with_corrupt_frame(2))
      .open(8.0)
      .unwrap();
    let frames: Vec<Frame> = source.by_ref().map(|f| f.unwrap()).collect();
    assert_eq!(frames.len(), 5);
    assert_eq!(source.corrupt_frames(), 1);
    assert_eq!(frames[2].image.get_pixel(0, 0).0[0], 3);
  }

  #[test]
  fn decode_failure_ends_the_stream() {
    let mut source = VideoHandle::Memory(video(6, 8.0).with_failure_at(3))
      .open(8.0)
      .unwrap();
    let items: Vec<_> = source.by_ref().collect();
    assert_eq!(items.len(), 4);
    assert!(items[3].is_err());
    assert!(source.next().is_none());
  }

  #[test]
  fn open_failure_is_reported() {
    let result = VideoHandle::Memory(video(2, 8.0).with_open_failure()).open(8.0);
    assert!(matches!(result, Err(InputError::Open(_))));
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let result = VideoHandle::Url("ftp://host/video.mp4".to_string()).open(8.0);
    assert!(matches!(result, Err(InputError::SchemeMismatch(_))));
  }
}
