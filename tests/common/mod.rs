// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// tests/common/mod.rs - 合成视频
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

#![allow(dead_code)]

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_circle_mut;
use jingmai::frame::Point;

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
pub const BLOB_RADIUS: i32 = 15;

/// 亮色圆形斑块沿直线匀速移动，返回各帧图像与真实圆心
pub fn moving_blob(frames: usize) -> (Vec<RgbImage>, Vec<Point>) {
  let mut images = Vec::with_capacity(frames);
  let mut centers = Vec::with_capacity(frames);
  for i in 0..frames {
    let cx = 40 + 8 * i as i32;
    let cy = 50 + i as i32;
    let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([20, 20, 20]));
    draw_filled_circle_mut(&mut image, (cx, cy), BLOB_RADIUS, Rgb([220, 220, 220]));
    images.push(image);
    centers.push(Point::new(cx as f32, cy as f32));
  }
  (images, centers)
}

/// 带轻微亮度变化的静态帧，用于耗时较长的任务
pub fn textured_frames(frames: usize) -> Vec<RgbImage> {
  (0..frames)
    .map(|i| {
      RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let v = (40 + (x * 3 + y * 5 + i as u32 * 7) % 60) as u8;
        Rgb([v, v, v])
      })
    })
    .collect()
}
