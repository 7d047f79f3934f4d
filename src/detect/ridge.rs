// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/ridge.rs - 多尺度血管响应（Frangi）+ 形态学
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

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contrast::otsu_level;
use imageproc::filter::{filter_clamped, gaussian_blur_f32};
use imageproc::kernel::Kernel;
use tracing::debug;

use crate::detect::components::{FOREGROUND, label};
use crate::detect::ellipse::fit_region;
use crate::detect::morphology::{close, intersect, kernel_radius, open};
use crate::detect::{
  ConfidenceTerms, ConfidenceWeights, DetectionError, Detector, VeinRegion, crop, search_region,
};
use crate::frame::{NormalizedFrame, Roi};
use crate::settings::RidgeSettings;

const WEIGHTS: ConfidenceWeights = ConfidenceWeights {
  fit: 0.4,
  ellipticity: 0.2,
  response: 0.4,
};

/// Frangi 中区分片状与线状结构的参数
const BETA: f32 = 0.5;

/// 二阶差分核
const DXX: [f32; 9] = [0.0, 0.0, 0.0, 1.0, -2.0, 1.0, 0.0, 0.0, 0.0];
const DYY: [f32; 9] = [0.0, 1.0, 0.0, 0.0, -2.0, 0.0, 0.0, 1.0, 0.0];
const DXY: [f32; 9] = [0.25, 0.0, -0.25, 0.0, 0.0, 0.0, -0.25, 0.0, 0.25];

/// 单通道浮点图
pub type Field = ImageBuffer<Luma<f32>, Vec<f32>>;

fn second_derivative(image: &Field, kernel: &[f32; 9]) -> Field {
  filter_clamped::<_, f32, f32>(image, Kernel::new(&kernel[..], 3, 3))
}

/// 计算暗色管状结构的多尺度 Frangi 响应，结果在 `[0, 1]`
pub fn vesselness(image: &GrayImage, scales: &[f32]) -> Field {
  let (width, height) = image.dimensions();
  let mut response = Field::new(width, height);
  if width < 3 || height < 3 {
    return response;
  }
  let field = Field::from_fn(width, height, |x, y| {
    Luma([image.get_pixel(x, y).0[0] as f32 / 255.0])
  });

  for &sigma in scales {
    let smooth = gaussian_blur_f32(&field, sigma);
    let hxx = second_derivative(&smooth, &DXX);
    let hyy = second_derivative(&smooth, &DYY);
    let hxy = second_derivative(&smooth, &DXY);
    let norm = sigma * sigma;

    let eigen: Vec<(f32, f32)> = hxx
      .iter()
      .zip(hyy.iter())
      .zip(hxy.iter())
      .map(|((&xx, &yy), &xy)| {
        let (xx, yy, xy) = (xx * norm, yy * norm, xy * norm);
        let root = ((xx - yy).powi(2) + 4.0 * xy * xy).sqrt();
        let mu1 = (xx + yy + root) / 2.0;
        let mu2 = (xx + yy - root) / 2.0;
        if mu1.abs() <= mu2.abs() {
          (mu1, mu2)
        } else {
          (mu2, mu1)
        }
      })
      .collect();
    let max_s = eigen
      .iter()
      .map(|(l1, l2)| (l1 * l1 + l2 * l2).sqrt())
      .fold(0.0f32, f32::max);
    if max_s <= f32::EPSILON {
      continue;
    }

    let c = 0.5 * max_s;
    for ((l1, l2), out) in eigen.into_iter().zip(response.iter_mut()) {
      // 暗色结构横截面上二阶导为正
      if l2 <= 0.0 {
        continue;
      }
      let rb = l1 / l2;
      let s2 = l1 * l1 + l2 * l2;
      let v = (-(rb * rb) / (2.0 * BETA * BETA)).exp() * (1.0 - (-s2 / (2.0 * c * c)).exp());
      if v > *out {
        *out = v;
      }
    }
  }
  response
}

/// 宽高比与纵向位置只接受开区间内的值
fn strictly_within(value: f32, low: f32, high: f32) -> bool {
  low < value && value < high
}

pub struct RidgeDetector {
  settings: RidgeSettings,
}

impl RidgeDetector {
  pub fn new(settings: RidgeSettings) -> Self {
    Self { settings }
  }

  fn scales(&self) -> Vec<f32> {
    let s = &self.settings;
    let mut scales = Vec::new();
    let mut sigma = s.scale_min;
    while sigma <= s.scale_max + 1e-4 {
      scales.push(sigma);
      sigma += s.scale_step;
    }
    scales
  }

  fn mask(&self, local: &GrayImage, response: &Field) -> GrayImage {
    let s = &self.settings;
    let mut mask = GrayImage::from_fn(local.width(), local.height(), |x, y| {
      let v = response.get_pixel(x, y).0[0];
      Luma([if v > s.threshold { FOREGROUND } else { 0 }])
    });

    if s.dark_gating {
      let level = otsu_level(local);
      let dark = GrayImage::from_fn(local.width(), local.height(), |x, y| {
        Luma([if local.get_pixel(x, y).0[0] <= level {
          FOREGROUND
        } else {
          0
        }])
      });
      mask = intersect(&mask, &dark);
    }

    let radius = kernel_radius(s.kernel_size);
    let mask = close(&mask, radius, s.close_iterations);
    open(&mask, radius, s.open_iterations)
  }
}

impl Detector for RidgeDetector {
  fn detect(&self, frame: &NormalizedFrame, roi: Roi) -> Result<Vec<VeinRegion>, DetectionError> {
    let s = &self.settings;
    let region = search_region(frame, roi)?;
    let local = crop(frame, region);
    let response = vesselness(&local, &self.scales());
    let mask = self.mask(&local, &response);

    let labeling = label(&mask);
    let mut regions = Vec::new();
    for component in labeling.components() {
      let area = component.area as f32;
      if area < s.min_area || area > s.max_area {
        continue;
      }
      let aspect = component.width() as f32 / component.height() as f32;
      if !strictly_within(aspect, s.min_aspect, s.max_aspect) {
        continue;
      }

      let pixels = labeling.pixels(component.label);
      let Some(ellipse) = fit_region(&pixels) else {
        continue;
      };
      let band = ellipse.center.y / local.height() as f32;
      if !strictly_within(band, s.band_min, s.band_max) {
        continue;
      }

      let mean_response = pixels
        .iter()
        .map(|&(x, y)| response.get_pixel(x, y).0[0])
        .sum::<f32>()
        / pixels.len() as f32;
      let terms = ConfidenceTerms {
        fit: area / ellipse.area(),
        ellipticity: ellipse.ellipticity(),
        response: mean_response,
      };
      regions.push(
        ellipse
          .translate(region.x as f32, region.y as f32)
          .to_region(WEIGHTS.score(terms)),
      );
    }
    debug!(
      "血管响应连通域 {} 个，保留 {} 个",
      labeling.components().len(),
      regions.len()
    );
    Ok(regions)
  }
}
