// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/preprocess.rs - 帧预处理
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

use image::{GrayImage, Luma, RgbImage, imageops};
use imageproc::filter::gaussian_blur_f32;

use crate::frame::{Frame, NormalizedFrame, Roi};
use crate::settings::PreprocessSettings;

pub mod clahe;

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// 亮度加权灰度转换
pub fn luminance(image: &RgbImage) -> GrayImage {
  GrayImage::from_fn(image.width(), image.height(), |x, y| {
    let [r, g, b] = image.get_pixel(x, y).0;
    let v = LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32;
    Luma([v.round().clamp(0.0, 255.0) as u8])
  })
}

/// 与 OpenCV 一致的核大小到 sigma 的换算
pub fn kernel_sigma(kernel: u32) -> f32 {
  0.3 * ((kernel as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
  settings: PreprocessSettings,
}

impl Preprocessor {
  pub fn new(settings: PreprocessSettings) -> Self {
    Self { settings }
  }

  /// 灰度 -> 高斯模糊 -> CLAHE
  ///
  /// 提供 ROI 时只处理 ROI 覆盖的区域，输出仍是整帧尺寸，区域外为 0。
  pub fn process(&self, frame: &Frame, roi: Option<Roi>) -> NormalizedFrame {
    let (width, height) = (frame.width(), frame.height());
    let region = roi
      .map(|r| r.clamp_to(width, height))
      .unwrap_or_else(|| Roi::full(width, height));

    let cropped = if region == Roi::full(width, height) {
      frame.gray.clone()
    } else {
      imageops::crop_imm(&frame.gray, region.x, region.y, region.width, region.height).to_image()
    };

    let blurred = self.blur(&cropped);
    let equalized = clahe::equalize(
      &blurred,
      self.settings.clahe_clip_limit,
      self.settings.clahe_tile_grid,
    );

    let gray = if region == Roi::full(width, height) {
      equalized
    } else {
      let mut full = GrayImage::new(width, height);
      imageops::replace(&mut full, &equalized, region.x as i64, region.y as i64);
      full
    };

    NormalizedFrame {
      index: frame.index,
      timestamp_ms: frame.timestamp_ms,
      gray,
      region,
    }
  }

  fn blur(&self, image: &GrayImage) -> GrayImage {
    let kernel = self.settings.blur_kernel;
    if kernel <= 1 {
      return image.clone();
    }
    gaussian_blur_f32(image, kernel_sigma(kernel))
  }
}
