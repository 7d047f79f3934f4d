// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/morphology.rs - 二值形态学
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

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};

use crate::detect::components::FOREGROUND;

/// 奇数核大小换算为圆形结构元素半径
pub fn kernel_radius(kernel_size: u32) -> u8 {
  (kernel_size / 2).min(u8::MAX as u32) as u8
}

/// 形态学强度映射为 `(半径, 迭代次数)`，强度不大于 0 时不做形态学处理
pub fn strength_params(strength: f32) -> Option<(u8, u32)> {
  if strength <= 0.0 {
    return None;
  }
  let s = strength.min(1.0);
  Some((1 + (3.0 * s) as u8, 1 + (2.0 * s) as u32))
}

pub fn dilate_n(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
  (0..iterations).fold(mask.clone(), |m, _| dilate(&m, Norm::L2, radius))
}

pub fn erode_n(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
  (0..iterations).fold(mask.clone(), |m, _| erode(&m, Norm::L2, radius))
}

/// 开运算：先腐蚀后膨胀
pub fn open(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
  if radius == 0 || iterations == 0 {
    return mask.clone();
  }
  dilate_n(&erode_n(mask, radius, iterations), radius, iterations)
}

/// 闭运算：先膨胀后腐蚀
pub fn close(mask: &GrayImage, radius: u8, iterations: u32) -> GrayImage {
  if radius == 0 || iterations == 0 {
    return mask.clone();
  }
  erode_n(&dilate_n(mask, radius, iterations), radius, iterations)
}

/// 灰度落在 `[lower, upper]` 内的像素置为前景
pub fn threshold_band(gray: &GrayImage, lower: u8, upper: u8) -> GrayImage {
  GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
    let v = gray.get_pixel(x, y).0[0];
    Luma([if v >= lower && v <= upper { FOREGROUND } else { 0 }])
  })
}

pub fn intersect(a: &GrayImage, b: &GrayImage) -> GrayImage {
  GrayImage::from_fn(a.width(), a.height(), |x, y| {
    let on = a.get_pixel(x, y).0[0] > 0 && b.get_pixel(x, y).0[0] > 0;
    Luma([if on { FOREGROUND } else { 0 }])
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn count(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p.0[0] > 0).count()
  }

  #[test]
  fn strength_mapping() {
    assert_eq!(strength_params(0.0), None);
    assert_eq!(strength_params(0.5), Some((2, 2)));
    assert_eq!(strength_params(1.0), Some((4, 3)));
  }

  #[test]
  fn open_removes_speckles() {
    let mut mask = GrayImage::new(40, 40);
    for y in 10..30 {
      for x in 10..30 {
        mask.put_pixel(x, y, Luma([FOREGROUND]));
      }
    }
    mask.put_pixel(2, 2, Luma([FOREGROUND]));
    let out = open(&mask, 1, 1);
    assert_eq!(out.get_pixel(2, 2).0[0], 0);
    assert_eq!(out.get_pixel(20, 20).0[0], FOREGROUND);
  }

  #[test]
  fn close_fills_small_gap() {
    let mut mask = GrayImage::new(40, 20);
    for y in 5..15 {
      for x in 5..35 {
        if x != 20 {
          mask.put_pixel(x, y, Luma([FOREGROUND]));
        }
      }
    }
    let out = close(&mask, 1, 1);
    assert_eq!(out.get_pixel(20, 10).0[0], FOREGROUND);
    assert!(count(&out) >= count(&mask));
  }

  #[test]
  fn band_threshold_is_inclusive() {
    let gray = GrayImage::from_fn(3, 1, |x, _| Luma([[49u8, 50, 150][x as usize]]));
    let mask = threshold_band(&gray, 50, 150);
    assert_eq!(count(&mask), 2);
  }
}
