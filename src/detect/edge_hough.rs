// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/edge_hough.rs - 边缘 + 霍夫圆 + 椭圆拟合
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

//! # 边缘霍夫检测
//!
//! 1. Canny 边缘图；
//! 2. 梯度方向投票的霍夫圆累加器（分辨率 `dp`）；
//! 3. 峰值按票数排序，圆心间距小于 `min_dist` 的候选被抑制；
//! 4. 用圆环附近的边缘点拟合椭圆，按面积和椭圆度过滤。

use std::f32::consts::PI;

use image::GrayImage;
use imageproc::edges::canny;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use tracing::debug;

use crate::detect::ellipse::{Ellipse, fit_boundary};
use crate::detect::{
  ConfidenceTerms, ConfidenceWeights, DetectionError, Detector, VeinRegion, crop, search_region,
};
use crate::frame::{NormalizedFrame, Point, Roi};
use crate::settings::EdgeHoughSettings;

const WEIGHTS: ConfidenceWeights = ConfidenceWeights {
  fit: 0.4,
  ellipticity: 0.3,
  response: 0.3,
};

/// 计算角度覆盖率时使用的扇区数
const ANGLE_BINS: usize = 36;
/// 参与 NMS 的最多峰值数
const MAX_PEAKS: usize = 64;

struct Accumulator {
  width: usize,
  height: usize,
  dp: f32,
  votes: Vec<u32>,
}

struct Peak {
  center: Point,
  votes: u32,
}

impl Accumulator {
  fn new(width: u32, height: u32, dp: f32) -> Self {
    let width = (width as f32 / dp).ceil() as usize + 1;
    let height = (height as f32 / dp).ceil() as usize + 1;
    Self {
      width,
      height,
      dp,
      votes: vec![0; width * height],
    }
  }

  fn vote(&mut self, x: f32, y: f32) {
    let bx = (x / self.dp).round();
    let by = (y / self.dp).round();
    if bx < 0.0 || by < 0.0 {
      return;
    }
    let (bx, by) = (bx as usize, by as usize);
    if bx < self.width && by < self.height {
      self.votes[by * self.width + bx] += 1;
    }
  }

  fn at(&self, x: isize, y: isize) -> u32 {
    if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
      return 0;
    }
    self.votes[y as usize * self.width + x as usize]
  }

  /// 3x3 邻域和
  fn smoothed(&self) -> Vec<u32> {
    let mut out = vec![0; self.votes.len()];
    for y in 0..self.height as isize {
      for x in 0..self.width as isize {
        let mut sum = 0;
        for oy in -1..=1 {
          for ox in -1..=1 {
            sum += self.at(x + ox, y + oy);
          }
        }
        out[y as usize * self.width + x as usize] = sum;
      }
    }
    out
  }

  fn centroid(&self, bx: usize, by: usize) -> Point {
    let (mut sx, mut sy, mut total) = (0.0f32, 0.0f32, 0.0f32);
    for oy in -1..=1isize {
      for ox in -1..=1isize {
        let (x, y) = (bx as isize + ox, by as isize + oy);
        let v = self.at(x, y) as f32;
        sx += v * x as f32;
        sy += v * y as f32;
        total += v;
      }
    }
    if total <= 0.0 {
      return Point::new(bx as f32 * self.dp, by as f32 * self.dp);
    }
    Point::new(sx / total * self.dp, sy / total * self.dp)
  }

  fn peaks(&self, threshold: u32, min_dist: f32) -> Vec<Peak> {
    let smoothed = self.smoothed();
    let value = |x: isize, y: isize| -> u32 {
      if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
        0
      } else {
        smoothed[y as usize * self.width + x as usize]
      }
    };

    let mut candidates = Vec::new();
    for y in 0..self.height as isize {
      for x in 0..self.width as isize {
        let v = value(x, y);
        if v < threshold.max(1) {
          continue;
        }
        let is_max = (-1..=1)
          .flat_map(|oy| (-1..=1).map(move |ox| (ox, oy)))
          .all(|(ox, oy)| value(x + ox, y + oy) <= v);
        if is_max {
          candidates.push((v, x as usize, y as usize));
        }
      }
    }
    // 票数降序，同票按光栅顺序
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.2.cmp(&b.2)).then(a.1.cmp(&b.1)));

    let mut peaks: Vec<Peak> = Vec::new();
    for (votes, bx, by) in candidates.into_iter().take(MAX_PEAKS * 4) {
      let center = self.centroid(bx, by);
      if peaks.iter().all(|p| p.center.distance(&center) >= min_dist) {
        peaks.push(Peak { center, votes });
        if peaks.len() >= MAX_PEAKS {
          break;
        }
      }
    }
    peaks
  }
}

pub struct EdgeHoughDetector {
  settings: EdgeHoughSettings,
}

impl EdgeHoughDetector {
  pub fn new(settings: EdgeHoughSettings) -> Self {
    Self { settings }
  }

  /// 搜索区域内可能出现的半径范围，超出对角线的半径不会有支持点
  fn radius_range(&self, width: u32, height: u32) -> Option<(u32, u32)> {
    let diagonal = (width as f32).hypot(height as f32).ceil() as u32;
    let max_r = self.settings.max_radius.min(diagonal);
    let min_r = self.settings.min_radius;
    (min_r <= max_r).then_some((min_r, max_r))
  }

  fn best_radius(&self, center: Point, edges: &[Point], (min_r, max_r): (u32, u32)) -> Option<f32> {
    let mut hist = vec![0u32; max_r as usize + 2];
    for p in edges {
      let d = p.distance(&center).round();
      if d >= 0.0 && (d as usize) < hist.len() {
        hist[d as usize] += 1;
      }
    }
    let mut best: Option<(u32, u32)> = None;
    for r in min_r..=max_r {
      let r = r as usize;
      let support = hist[r] + hist.get(r + 1).copied().unwrap_or(0) + hist[r.saturating_sub(1)];
      if support > 0 && best.is_none_or(|(s, _)| support > s) {
        best = Some((support, r as u32));
      }
    }
    best.map(|(_, r)| r as f32)
  }

  fn refine(
    &self,
    peak: &Peak,
    edges: &[Point],
    radii: (u32, u32),
  ) -> Option<(Ellipse, ConfidenceTerms)> {
    let radius = self.best_radius(peak.center, edges, radii)?;
    let tolerance = (0.2 * radius).max(2.0);
    let ring: Vec<Point> = edges
      .iter()
      .copied()
      .filter(|p| (p.distance(&peak.center) - radius).abs() <= tolerance)
      .collect();

    let mut sectors = [false; ANGLE_BINS];
    for p in &ring {
      let angle = (p.y - peak.center.y).atan2(p.x - peak.center.x) + PI;
      let bin = ((angle / (2.0 * PI)) * ANGLE_BINS as f32) as usize;
      sectors[bin.min(ANGLE_BINS - 1)] = true;
    }
    let coverage = sectors.iter().filter(|s| **s).count() as f32 / ANGLE_BINS as f32;
    let support = ring.len() as f32 / (2.0 * PI * radius);

    // 圆环不完整时拟合中心会偏移，退回霍夫圆
    let ellipse = match fit_boundary(&ring) {
      Some(e) if coverage >= 0.6 && e.center.distance(&peak.center) <= radius / 2.0 => e,
      _ => Ellipse::circle(peak.center, radius),
    };

    let terms = ConfidenceTerms {
      fit: coverage,
      ellipticity: ellipse.ellipticity(),
      response: support,
    };
    Some((ellipse, terms))
  }

  fn detect_local(&self, local: &GrayImage) -> Vec<(Ellipse, ConfidenceTerms)> {
    let s = &self.settings;
    let Some(radii) = self.radius_range(local.width(), local.height()) else {
      return Vec::new();
    };
    let edges = canny(local, s.canny_low, s.canny_high);
    let gx = horizontal_sobel(local);
    let gy = vertical_sobel(local);

    let mut accumulator = Accumulator::new(local.width(), local.height(), s.dp);
    let mut edge_points = Vec::new();
    for (x, y, pixel) in edges.enumerate_pixels() {
      if pixel.0[0] == 0 {
        continue;
      }
      edge_points.push(Point::new(x as f32, y as f32));

      let dx = gx.get_pixel(x, y).0[0] as f32;
      let dy = gy.get_pixel(x, y).0[0] as f32;
      let magnitude = dx.hypot(dy);
      if magnitude < s.param1 {
        continue;
      }
      let (nx, ny) = (dx / magnitude, dy / magnitude);
      for r in radii.0..=radii.1 {
        let r = r as f32;
        accumulator.vote(x as f32 + r * nx, y as f32 + r * ny);
        accumulator.vote(x as f32 - r * nx, y as f32 - r * ny);
      }
    }
    if edge_points.is_empty() {
      return Vec::new();
    }

    let peaks = accumulator.peaks(s.param2 as u32, s.min_dist);
    debug!("边缘点 {} 个，霍夫候选 {} 个", edge_points.len(), peaks.len());

    let mut ellipses = Vec::new();
    for peak in &peaks {
      let Some((ellipse, terms)) = self.refine(peak, &edge_points, radii) else {
        continue;
      };
      let area = ellipse.area();
      if area < s.min_area || area > s.max_area {
        continue;
      }
      if ellipse.ellipticity() < 1.0 - s.elliptical_tolerance {
        continue;
      }
      debug!(
        "霍夫候选 ({:.1}, {:.1}) 票数 {} 通过，覆盖率 {:.2}",
        ellipse.center.x, ellipse.center.y, peak.votes, terms.fit
      );
      ellipses.push((ellipse, terms));
    }
    ellipses
  }
}

impl Detector for EdgeHoughDetector {
  fn detect(&self, frame: &NormalizedFrame, roi: Roi) -> Result<Vec<VeinRegion>, DetectionError> {
    let region = search_region(frame, roi)?;
    let local = crop(frame, region);
    let regions = self
      .detect_local(&local)
      .into_iter()
      .map(|(ellipse, terms)| {
        ellipse
          .translate(region.x as f32, region.y as f32)
          .to_region(WEIGHTS.score(terms))
      })
      .collect();
    Ok(regions)
  }
}
