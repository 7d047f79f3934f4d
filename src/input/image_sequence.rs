// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/input/image_sequence.rs - 图像序列输入
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

//! 将目录中的图像按文件名排序后作为视频帧读取。
//!
//! URL 形如 `frames:///data/case-01?fps=25`，`fps` 缺省时为 25。

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use super::{FALLBACK_FPS, FrameDecoder, InputError, RawFrame, VideoMetadata};
use crate::{FromUrl, FromUrlWithScheme, url_path};

#[derive(Error, Debug)]
pub enum ImageSequenceInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("目录中没有图像: {0}")]
  Empty(String),
}

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

fn is_image(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

pub struct ImageSequenceInput {
  metadata: VideoMetadata,
  files: VecDeque<PathBuf>,
  position: u64,
}

impl FromUrlWithScheme for ImageSequenceInput {
  const SCHEME: &'static str = "frames";
}

impl FromUrl for ImageSequenceInput {
  type Error = ImageSequenceInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageSequenceInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let fps = query
      .get("fps")
      .and_then(|v| v.parse::<f64>().ok())
      .unwrap_or(FALLBACK_FPS);

    Self::open(url_path(url), fps)
  }
}

impl ImageSequenceInput {
  pub fn open<P: AsRef<Path>>(dir: P, fps: f64) -> Result<Self, ImageSequenceInputError> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
      let path = entry?.path();
      if path.is_file() && is_image(&path) {
        files.push(path);
      }
    }
    files.sort();

    let first = files
      .first()
      .ok_or_else(|| ImageSequenceInputError::Empty(dir.display().to_string()))?;
    let (width, height) = image::image_dimensions(first)?;
    let metadata = VideoMetadata::new(Some(fps), Some(files.len() as u64), width, height, None);
    info!(
      "图像序列 {}: {} 帧，{}x{}",
      dir.display(),
      files.len(),
      width,
      height
    );

    Ok(Self {
      metadata,
      files: files.into(),
      position: 0,
    })
  }
}

impl FrameDecoder for ImageSequenceInput {
  fn metadata(&self) -> &VideoMetadata {
    &self.metadata
  }

  fn next_frame(&mut self) -> Option<Result<RawFrame, InputError>> {
    let path = self.files.pop_front()?;
    let position = self.position;
    self.position += 1;

    let decoded = ImageReader::open(&path)
      .map_err(|e| e.to_string())
      .and_then(|reader| reader.decode().map_err(|e| e.to_string()));
    Some(match decoded {
      Ok(image) => Ok(RawFrame {
        image: image.to_rgb8(),
        timestamp_ms: None,
      }),
      Err(reason) => Err(InputError::CorruptFrame {
        position,
        reason: format!("{}: {}", path.display(), reason),
      }),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("jingmai-{}-{}", name, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  #[test]
  fn reads_sorted_frames_and_skips_broken_files() {
    let dir = scratch_dir("sequence");
    for i in 0..3u8 {
      RgbImage::from_pixel(6, 4, Rgb([i * 10, 0, 0]))
        .save(dir.join(format!("frame_{:03}.png", i)))
        .unwrap();
    }
    std::fs::write(dir.join("frame_001b.png"), b"not a png").unwrap();
    std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

    let url = Url::parse(&format!("frames://{}?fps=12", dir.display())).unwrap();
    let mut input = ImageSequenceInput::from_url(&url).unwrap();
    assert_eq!(input.metadata().fps, 12.0);
    assert_eq!(input.metadata().frame_count, Some(4));
    assert_eq!((input.metadata().width, input.metadata().height), (6, 4));

    let mut values = Vec::new();
    let mut corrupt = 0;
    while let Some(item) = input.next_frame() {
      match item {
        Ok(raw) => values.push(raw.image.get_pixel(0, 0).0[0]),
        Err(e) => {
          assert!(e.is_corrupt_frame());
          corrupt += 1;
        }
      }
    }
    assert_eq!(values, vec![0, 10, 20]);
    assert_eq!(corrupt, 1);
    std::fs::remove_dir_all(dir).ok();
  }

  #[test]
  fn empty_directory_is_an_error() {
    let dir = scratch_dir("empty");
    assert!(matches!(
      ImageSequenceInput::open(&dir, 25.0),
      Err(ImageSequenceInputError::Empty(_))
    ));
    std::fs::remove_dir_all(dir).ok();
  }
}
