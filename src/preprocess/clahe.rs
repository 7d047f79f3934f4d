// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/preprocess/clahe.rs - 限制对比度自适应直方图均衡
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

const BINS: usize = 256;

struct TileGrid {
  cols: u32,
  rows: u32,
  tile_w: f32,
  tile_h: f32,
  luts: Vec<[u8; BINS]>,
}

impl TileGrid {
  fn bounds(total: u32, count: u32, i: u32) -> (u32, u32) {
    (i * total / count, (i + 1) * total / count)
  }

  fn lut(&self, col: u32, row: u32) -> &[u8; BINS] {
    &self.luts[(row * self.cols + col) as usize]
  }
}

fn tile_lut(image: &GrayImage, x0: u32, x1: u32, y0: u32, y1: u32, clip_limit: f32) -> [u8; BINS] {
  let mut hist = [0u32; BINS];
  for y in y0..y1 {
    for x in x0..x1 {
      hist[image.get_pixel(x, y).0[0] as usize] += 1;
    }
  }
  let area = (x1 - x0) * (y1 - y0);

  // 裁剪直方图并把超出部分平均分配回所有灰度级
  let clip = ((clip_limit * area as f32 / BINS as f32) as u32).max(1);
  let mut excess = 0u32;
  for bin in hist.iter_mut() {
    if *bin > clip {
      excess += *bin - clip;
      *bin = clip;
    }
  }
  let share = excess / BINS as u32;
  let remainder = (excess % BINS as u32) as usize;
  for bin in hist.iter_mut() {
    *bin += share;
  }
  if remainder > 0 {
    let step = (BINS / remainder).max(1);
    for i in (0..BINS).step_by(step).take(remainder) {
      hist[i] += 1;
    }
  }

  let scale = 255.0 / area.max(1) as f32;
  let mut lut = [0u8; BINS];
  let mut sum = 0u32;
  for (value, bin) in hist.iter().enumerate() {
    sum += bin;
    lut[value] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
  }
  lut
}

/// 对灰度图执行 CLAHE
///
/// `grid` 为每个方向上的分块数，会被限制在图像尺寸之内；每块的直方图按
/// `clip_limit * 面积 / 256` 裁剪，像素值在相邻四块的映射表之间双线性插值。
pub fn equalize(image: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
  let (width, height) = image.dimensions();
  if width == 0 || height == 0 {
    return image.clone();
  }

  let cols = grid.clamp(1, width);
  let rows = grid.clamp(1, height);

  let mut luts = Vec::with_capacity((cols * rows) as usize);
  for row in 0..rows {
    let (y0, y1) = TileGrid::bounds(height, rows, row);
    for col in 0..cols {
      let (x0, x1) = TileGrid::bounds(width, cols, col);
      luts.push(tile_lut(image, x0, x1, y0, y1, clip_limit));
    }
  }

  let tiles = TileGrid {
    cols,
    rows,
    tile_w: width as f32 / cols as f32,
    tile_h: height as f32 / rows as f32,
    luts,
  };

  GrayImage::from_fn(width, height, |x, y| {
    let value = image.get_pixel(x, y).0[0] as usize;

    let tx = ((x as f32 + 0.5) / tiles.tile_w - 0.5).max(0.0);
    let ty = ((y as f32 + 0.5) / tiles.tile_h - 0.5).max(0.0);
    let c0 = (tx.floor() as u32).min(tiles.cols - 1);
    let r0 = (ty.floor() as u32).min(tiles.rows - 1);
    let c1 = (c0 + 1).min(tiles.cols - 1);
    let r1 = (r0 + 1).min(tiles.rows - 1);
    let wx = (tx - c0 as f32).clamp(0.0, 1.0);
    let wy = (ty - r0 as f32).clamp(0.0, 1.0);

    let top = tiles.lut(c0, r0)[value] as f32 * (1.0 - wx) + tiles.lut(c1, r0)[value] as f32 * wx;
    let bottom =
      tiles.lut(c0, r1)[value] as f32 * (1.0 - wx) + tiles.lut(c1, r1)[value] as f32 * wx;
    let v = top * (1.0 - wy) + bottom * wy;
    Luma([v.round().clamp(0.0, 255.0) as u8])
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spread(image: &GrayImage) -> u8 {
    let min = image.pixels().map(|p| p.0[0]).min().unwrap_or(0);
    let max = image.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    max - min
  }

  #[test]
  fn low_contrast_texture_is_stretched() {
    let image = GrayImage::from_fn(128, 128, |x, y| Luma([100 + ((x * 7 + y * 13) % 16) as u8]));
    let out = equalize(&image, 2.0, 2);
    assert!(spread(&out) > spread(&image));
  }

  #[test]
  fn grid_larger_than_image_is_clamped() {
    let image = GrayImage::from_fn(3, 2, |x, y| Luma([(x * 50 + y * 20) as u8]));
    let out = equalize(&image, 2.0, 8);
    assert_eq!(out.dimensions(), (3, 2));
  }

  #[test]
  fn bright_pixels_stay_at_top_of_range() {
    let image = GrayImage::from_fn(32, 32, |x, _| Luma([if x < 16 { 0 } else { 255 }]));
    let out = equalize(&image, 2.0, 4);
    assert_eq!(out.get_pixel(31, 0).0[0], 255);
    assert!(out.get_pixel(0, 0).0[0] < 64);
  }
}
