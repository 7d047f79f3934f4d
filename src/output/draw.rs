// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/output/draw.rs - 检测结果叠加绘制
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

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::aggregate::DetectionResult;
use crate::detect::VeinRegion;
use crate::frame::{Frame, Roi};
use crate::tracker::TrackerState;

const BEST_COLOR: [u8; 3] = [255, 0, 0];
const REGION_COLOR: [u8; 3] = [255, 160, 0];
// 椭圆折线的段数
const ELLIPSE_SEGMENTS: usize = 48;

pub struct Overlay {
  roi_thickness: u32,
  center_radius: i32,
}

impl Default for Overlay {
  fn default() -> Self {
    Self {
      roi_thickness: 2,
      center_radius: 2,
    }
  }
}

fn state_color(state: TrackerState) -> [u8; 3] {
  match state {
    TrackerState::Uninitialized => [128, 128, 128],
    TrackerState::Tracking => [0, 255, 0],
    TrackerState::Drifting => [255, 255, 0],
    TrackerState::Lost => [255, 0, 255],
  }
}

impl Overlay {
  fn draw_roi(&self, image: &mut RgbImage, roi: Roi, color: [u8; 3]) {
    for t in 0..self.roi_thickness {
      let width = roi.width.saturating_sub(2 * t);
      let height = roi.height.saturating_sub(2 * t);
      if width == 0 || height == 0 {
        break;
      }
      let rect = Rect::at((roi.x + t) as i32, (roi.y + t) as i32).of_size(width, height);
      draw_hollow_rect_mut(image, rect, Rgb(color));
    }
  }

  fn draw_region(&self, image: &mut RgbImage, region: &VeinRegion, color: [u8; 3]) {
    let (sin, cos) = region.angle.sin_cos();
    let point = |i: usize| {
      let t = i as f32 * std::f32::consts::TAU / ELLIPSE_SEGMENTS as f32;
      let (x, y) = (region.semi_major * t.cos(), region.semi_minor * t.sin());
      (
        region.center.x + x * cos - y * sin,
        region.center.y + x * sin + y * cos,
      )
    };
    for i in 0..ELLIPSE_SEGMENTS {
      draw_line_segment_mut(image, point(i), point(i + 1), Rgb(color));
    }
    draw_filled_circle_mut(
      image,
      (region.center.x.round() as i32, region.center.y.round() as i32),
      self.center_radius,
      Rgb(color),
    );
  }

  /// 在原始帧上画出 ROI（颜色表示跟踪状态）与各区域，最佳区域用红色
  pub fn draw(&self, frame: &Frame, result: &DetectionResult) -> RgbImage {
    let mut image = frame.image.clone();
    self.draw_roi(&mut image, result.roi, state_color(result.tracker_state));
    for (i, region) in result.regions.iter().enumerate().rev() {
      let color = if i == 0 { BEST_COLOR } else { REGION_COLOR };
      self.draw_region(&mut image, region, color);
    }
    image
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detect::Algorithm;
  use crate::detect::ellipse::Ellipse;
  use crate::frame::Point;

  #[test]
  fn roi_and_best_region_are_drawn() {
    let frame = Frame::new(0, 0, RgbImage::new(100, 80));
    let result = DetectionResult {
      frame_index: 0,
      timestamp_ms: 0,
      regions: vec![Ellipse::circle(Point::new(50.0, 40.0), 10.0).to_region(0.9)],
      confidence: 0.9,
      duration_ms: 0.0,
      algorithm: Algorithm::EdgeHoughEllipse,
      version: "1.1".to_string(),
      roi: Roi::new(10, 10, 60, 50),
      tracker_state: TrackerState::Tracking,
      error: None,
    };
    let image = Overlay::default().draw(&frame, &result);
    assert_eq!(image.get_pixel(10, 30).0, [0, 255, 0]);
    assert_eq!(image.get_pixel(11, 30).0, [0, 255, 0]);
    assert_eq!(image.get_pixel(50, 40).0, BEST_COLOR);
    assert_eq!(image.get_pixel(60, 40).0, BEST_COLOR);
    assert_eq!(image.get_pixel(90, 75).0, [0, 0, 0]);
  }
}
