// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/components.rs - 连通域标记
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

//! 8 连通的连通域标记。
//!
//! 使用真正的标记算法（`imageproc::region_labelling`），而不是轮廓追踪，
//! 带孔洞或互相接触的区域都能得到正确的面积。

use std::collections::BTreeMap;

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::frame::Point;

pub const FOREGROUND: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
  pub label: u32,
  pub area: u32,
  pub min_x: u32,
  pub min_y: u32,
  pub max_x: u32,
  pub max_y: u32,
}

impl Component {
  pub fn width(&self) -> u32 {
    self.max_x - self.min_x + 1
  }

  pub fn height(&self) -> u32 {
    self.max_y - self.min_y + 1
  }
}

pub struct Labeling {
  labels: ImageBuffer<Luma<u32>, Vec<u32>>,
  /// 按标签升序排列，不含背景
  components: Vec<Component>,
}

/// 将任意非零像素视为前景
pub fn binarize(mask: &GrayImage) -> GrayImage {
  GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
    Luma([if mask.get_pixel(x, y).0[0] > 0 { FOREGROUND } else { 0 }])
  })
}

/// 对掩码做 8 连通标记，背景标签 0 被丢弃
pub fn label(mask: &GrayImage) -> Labeling {
  let binary = binarize(mask);
  let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

  let mut stats: BTreeMap<u32, Component> = BTreeMap::new();
  for (x, y, pixel) in labels.enumerate_pixels() {
    let id = pixel.0[0];
    if id == 0 {
      continue;
    }
    stats
      .entry(id)
      .and_modify(|c| {
        c.area += 1;
        c.min_x = c.min_x.min(x);
        c.min_y = c.min_y.min(y);
        c.max_x = c.max_x.max(x);
        c.max_y = c.max_y.max(y);
      })
      .or_insert(Component {
        label: id,
        area: 1,
        min_x: x,
        min_y: y,
        max_x: x,
        max_y: y,
      });
  }

  Labeling {
    labels,
    components: stats.into_values().collect(),
  }
}

impl Labeling {
  pub fn components(&self) -> &[Component] {
    &self.components
  }

  pub fn is_empty(&self) -> bool {
    self.components.is_empty()
  }

  /// 面积最大的连通域，面积相同时取标签较小者
  pub fn largest(&self) -> Option<&Component> {
    self
      .components
      .iter()
      .fold(None, |best: Option<&Component>, c| match best {
        Some(b) if b.area >= c.area => Some(b),
        _ => Some(c),
      })
  }

  pub fn label_at(&self, point: Point) -> Option<u32> {
    if point.x < 0.0 || point.y < 0.0 {
      return None;
    }
    let (x, y) = (point.x as u32, point.y as u32);
    if x >= self.labels.width() || y >= self.labels.height() {
      return None;
    }
    match self.labels.get_pixel(x, y).0[0] {
      0 => None,
      id => Some(id),
    }
  }

  pub fn pixels(&self, label: u32) -> Vec<(u32, u32)> {
    self
      .labels
      .enumerate_pixels()
      .filter(|(_, _, p)| p.0[0] == label)
      .map(|(x, y, _)| (x, y))
      .collect()
  }

  pub fn mask_of(&self, label: u32) -> GrayImage {
    GrayImage::from_fn(self.labels.width(), self.labels.height(), |x, y| {
      Luma([if self.labels.get_pixel(x, y).0[0] == label {
        FOREGROUND
      } else {
        0
      }])
    })
  }
}

/// 只保留面积最大的连通域；没有前景像素时返回 `None`
pub fn largest_component(mask: &GrayImage) -> Option<GrayImage> {
  let labeling = label(mask);
  let largest = labeling.largest()?.label;
  Some(labeling.mask_of(largest))
}

/// 保留包含给定点的连通域；点落在背景上时保留全部前景
pub fn component_at(mask: &GrayImage, point: Point) -> Option<GrayImage> {
  let labeling = label(mask);
  if labeling.is_empty() {
    return None;
  }
  match labeling.label_at(point) {
    Some(id) => Some(labeling.mask_of(id)),
    None => Some(binarize(mask)),
  }
}
