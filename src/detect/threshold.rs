// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/threshold.rs - 灰度阈值 + 形态学 + 椭圆拟合
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

use image::GrayImage;
use tracing::debug;

use crate::detect::components::{component_at, label, largest_component};
use crate::detect::ellipse::fit_region;
use crate::detect::morphology::{close, open, strength_params, threshold_band};
use crate::detect::{
  ConfidenceTerms, ConfidenceWeights, DetectionError, Detector, VeinRegion, crop, search_region,
};
use crate::frame::{NormalizedFrame, Point, Roi};
use crate::settings::ThresholdSettings;

const WEIGHTS: ConfidenceWeights = ConfidenceWeights {
  fit: 0.5,
  ellipticity: 0.3,
  response: 0.2,
};

/// 掩码的连通域筛选方式，按优先级排列
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentSelection {
  /// 面积最大的连通域
  Largest,
  /// 包含 ROI 中心的连通域
  RoiCenter,
  /// 包含用户选点的连通域（局部坐标）
  Point(Point),
  All,
}

impl ComponentSelection {
  /// 在局部掩码上应用筛选；没有前景时返回 `None`
  pub fn apply(&self, mask: &GrayImage) -> Option<GrayImage> {
    match self {
      ComponentSelection::Largest => largest_component(mask),
      ComponentSelection::RoiCenter => {
        let center = Point::new(mask.width() as f32 / 2.0, mask.height() as f32 / 2.0);
        component_at(mask, center)
      }
      ComponentSelection::Point(point) => component_at(mask, *point),
      ComponentSelection::All => {
        if mask.pixels().any(|p| p.0[0] > 0) {
          Some(mask.clone())
        } else {
          None
        }
      }
    }
  }
}

/// 将局部掩码的每个连通域拟合为椭圆区域
///
/// `intensity` 与掩码同尺寸，用于计算区域对比度；`origin` 为局部坐标系
/// 原点在整帧中的位置。
pub(crate) fn regions_from_mask(mask: &GrayImage, intensity: &GrayImage, origin: Roi) -> Vec<VeinRegion> {
  let labeling = label(mask);
  let mut regions = Vec::new();
  for component in labeling.components() {
    let pixels = labeling.pixels(component.label);
    let Some(ellipse) = fit_region(&pixels) else {
      continue;
    };

    let (min, max) = pixels.iter().fold((u8::MAX, u8::MIN), |(lo, hi), &(x, y)| {
      let v = intensity.get_pixel(x, y).0[0];
      (lo.min(v), hi.max(v))
    });
    let contrast = max.saturating_sub(min) as f32 / 255.0;

    let terms = ConfidenceTerms {
      fit: component.area as f32 / ellipse.area(),
      ellipticity: ellipse.ellipticity(),
      response: contrast,
    };
    regions.push(
      ellipse
        .translate(origin.x as f32, origin.y as f32)
        .to_region(WEIGHTS.score(terms)),
    );
  }
  regions
}

pub struct ThresholdDetector {
  settings: ThresholdSettings,
  selected_point: Option<Point>,
}

impl ThresholdDetector {
  pub fn new(settings: ThresholdSettings, selected_point: Option<Point>) -> Self {
    Self {
      settings,
      selected_point,
    }
  }

  fn selection(&self, origin: Roi) -> ComponentSelection {
    let s = &self.settings;
    if s.largest_component {
      return ComponentSelection::Largest;
    }
    if s.roi_center_component {
      return ComponentSelection::RoiCenter;
    }
    if s.selected_point_component
      && let Some(point) = self.selected_point
    {
      let local = Point::new(point.x - origin.x as f32, point.y - origin.y as f32);
      return ComponentSelection::Point(local);
    }
    ComponentSelection::All
  }

  /// 阈值与形态学处理后的局部掩码
  pub fn segment(&self, local: &GrayImage) -> GrayImage {
    let s = &self.settings;
    let mask = threshold_band(local, s.lower, s.upper);
    match strength_params(s.morph_strength) {
      Some((radius, iterations)) => close(&open(&mask, radius, iterations), radius, iterations),
      None => mask,
    }
  }
}

impl Detector for ThresholdDetector {
  fn detect(&self, frame: &NormalizedFrame, roi: Roi) -> Result<Vec<VeinRegion>, DetectionError> {
    let region = search_region(frame, roi)?;
    let local = crop(frame, region);
    let mask = self.segment(&local);

    let selection = self.selection(region);
    let Some(selected) = selection.apply(&mask) else {
      debug!("阈值分割没有前景像素");
      return Ok(Vec::new());
    };
    Ok(regions_from_mask(&selected, &local, region))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Luma;
  use imageproc::drawing::draw_filled_circle_mut;

  fn raw_frame(gray: GrayImage) -> NormalizedFrame {
    let region = Roi::full(gray.width(), gray.height());
    NormalizedFrame {
      index: 0,
      timestamp_ms: 0,
      gray,
      region,
    }
  }

  fn two_blobs() -> GrayImage {
    let mut gray = GrayImage::new(120, 80);
    draw_filled_circle_mut(&mut gray, (30, 40), 14, Luma([100u8]));
    draw_filled_circle_mut(&mut gray, (85, 40), 8, Luma([100u8]));
    gray
  }

  #[test]
  fn all_components_become_regions() {
    let detector = ThresholdDetector::new(ThresholdSettings::default(), None);
    let frame = raw_frame(two_blobs());
    let regions = detector.detect(&frame, frame.region).unwrap();
    assert_eq!(regions.len(), 2);
  }

  #[test]
  fn largest_component_reduction_keeps_one() {
    let settings = ThresholdSettings {
      largest_component: true,
      ..ThresholdSettings::default()
    };
    let detector = ThresholdDetector::new(settings, None);
    let frame = raw_frame(two_blobs());
    let regions = detector.detect(&frame, frame.region).unwrap();
    assert_eq!(regions.len(), 1);
    assert!(regions[0].center.distance(&Point::new(30.0, 40.0)) < 1.5);
    assert!((regions[0].radius - 14.0).abs() < 2.0);
  }

  #[test]
  fn selected_point_picks_its_component() {
    let settings = ThresholdSettings {
      selected_point_component: true,
      ..ThresholdSettings::default()
    };
    let detector = ThresholdDetector::new(settings, Some(Point::new(85.0, 40.0)));
    let frame = raw_frame(two_blobs());
    let regions = detector.detect(&frame, Roi::new(10, 0, 100, 80)).unwrap();
    assert_eq!(regions.len(), 1);
    assert!(regions[0].center.distance(&Point::new(85.0, 40.0)) < 1.5);
  }

  #[test]
  fn black_frame_reduction_returns_nothing() {
    let settings = ThresholdSettings {
      largest_component: true,
      ..ThresholdSettings::default()
    };
    let detector = ThresholdDetector::new(settings, None);
    let frame = raw_frame(GrayImage::new(50, 50));
    assert!(detector.detect(&frame, frame.region).unwrap().is_empty());
  }
}
