// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/frame.rs - 帧与几何定义
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

use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::preprocess::luminance;

/// 采样后的视频帧，生成后不可变
#[derive(Debug, Clone)]
pub struct Frame {
  /// 采样后的帧序号（从 0 开始连续编号）
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
  /// RGB 图像数据
  pub image: RgbImage,
  /// 亮度加权得到的灰度图
  pub gray: GrayImage,
}

impl Frame {
  pub fn new(index: u64, timestamp_ms: u64, image: RgbImage) -> Self {
    let gray = luminance(&image);
    Self {
      index,
      timestamp_ms,
      image,
      gray,
    }
  }

  /// 单通道输入，RGB 三通道取相同值
  pub fn from_gray(index: u64, timestamp_ms: u64, gray: GrayImage) -> Self {
    let image = RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
      let Luma([v]) = *gray.get_pixel(x, y);
      Rgb([v, v, v])
    });
    Self {
      index,
      timestamp_ms,
      image,
      gray,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn full_roi(&self) -> Roi {
    Roi::full(self.width(), self.height())
  }
}

/// 预处理后的帧，坐标系仍为整帧坐标
#[derive(Debug, Clone)]
pub struct NormalizedFrame {
  pub index: u64,
  pub timestamp_ms: u64,
  /// 整帧尺寸的归一化灰度图，`region` 之外的像素为 0
  pub gray: GrayImage,
  /// 实际处理过的区域
  pub region: Roi,
}

impl NormalizedFrame {
  pub fn width(&self) -> u32 {
    self.gray.width()
  }

  pub fn height(&self) -> u32 {
    self.gray.height()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
  pub x: f32,
  pub y: f32,
}

impl Point {
  pub fn new(x: f32, y: f32) -> Self {
    Self { x, y }
  }

  pub fn distance(&self, other: &Point) -> f32 {
    ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
  }
}

/// 轴对齐包围盒（浮点坐标）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  /// 宽高比 width / height，高度为 0 时返回 0
  pub fn aspect_ratio(&self) -> f32 {
    if self.height <= 0.0 {
      0.0
    } else {
      self.width / self.height
    }
  }
}

/// 感兴趣区域
///
/// 不变量：完全位于帧内，且宽高均大于 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl Roi {
  pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
    Self {
      x,
      y,
      width: width.max(1),
      height: height.max(1),
    }
  }

  pub fn full(frame_width: u32, frame_height: u32) -> Self {
    Self::new(0, 0, frame_width, frame_height)
  }

  /// 以给定中心点构造 ROI，超出边界时平移而不缩放。
  /// 仅当 ROI 本身大于帧时才收缩到帧尺寸。
  pub fn centered_at(
    center: Point,
    width: u32,
    height: u32,
    frame_width: u32,
    frame_height: u32,
  ) -> Self {
    let frame_width = frame_width.max(1);
    let frame_height = frame_height.max(1);
    let width = width.clamp(1, frame_width);
    let height = height.clamp(1, frame_height);

    let x = (center.x - width as f32 / 2.0).round();
    let y = (center.y - height as f32 / 2.0).round();
    let max_x = (frame_width - width) as f32;
    let max_y = (frame_height - height) as f32;

    Self {
      x: x.clamp(0.0, max_x) as u32,
      y: y.clamp(0.0, max_y) as u32,
      width,
      height,
    }
  }

  /// 将任意矩形收敛到帧内，优先保持尺寸
  pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Self {
    Self::centered_at(
      self.center(),
      self.width,
      self.height,
      frame_width,
      frame_height,
    )
  }

  pub fn center(&self) -> Point {
    Point::new(
      self.x as f32 + self.width as f32 / 2.0,
      self.y as f32 + self.height as f32 / 2.0,
    )
  }

  pub fn right(&self) -> u32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> u32 {
    self.y + self.height
  }

  pub fn is_within(&self, frame_width: u32, frame_height: u32) -> bool {
    self.width > 0 && self.height > 0 && self.right() <= frame_width && self.bottom() <= frame_height
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn centered_roi_translates_instead_of_shrinking() {
    let roi = Roi::centered_at(Point::new(5.0, 5.0), 40, 30, 100, 80);
    assert_eq!((roi.x, roi.y, roi.width, roi.height), (0, 0, 40, 30));

    let roi = Roi::centered_at(Point::new(99.0, 79.0), 40, 30, 100, 80);
    assert_eq!((roi.x, roi.y, roi.width, roi.height), (60, 50, 40, 30));
    assert!(roi.is_within(100, 80));
  }

  #[test]
  fn oversized_roi_is_reduced_to_frame() {
    let roi = Roi::centered_at(Point::new(10.0, 10.0), 400, 400, 64, 48);
    assert_eq!(roi, Roi::new(0, 0, 64, 48));
  }

  #[test]
  fn gray_frame_keeps_values() {
    let gray = GrayImage::from_fn(4, 3, |x, y| Luma([(x * 40 + y * 10) as u8]));
    let frame = Frame::from_gray(2, 250, gray.clone());
    assert_eq!(frame.gray, gray);
    assert_eq!(luminance(&frame.image), gray);
  }
}
