// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/ellipse.rs - 椭圆拟合
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

//! 基于二阶矩的椭圆拟合。
//!
//! 实心区域上均匀分布的点，沿主轴方向的方差为 `a² / 4`；
//! 椭圆边界上均匀分布的点，方差为 `a² / 2`。

use std::f32::consts::PI;

use crate::detect::VeinRegion;
use crate::frame::{BoundingBox, Point};

/// 拟合所需的最少点数
pub const MIN_POINTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
  pub center: Point,
  pub semi_major: f32,
  pub semi_minor: f32,
  /// 长轴与 x 轴夹角（弧度）
  pub angle: f32,
}

struct Moments {
  mean: Point,
  cxx: f32,
  cyy: f32,
  cxy: f32,
}

fn moments<I>(points: I) -> Option<Moments>
where
  I: Iterator<Item = (f32, f32)> + Clone,
{
  let mut n = 0usize;
  let (mut sx, mut sy) = (0.0f64, 0.0f64);
  for (x, y) in points.clone() {
    n += 1;
    sx += x as f64;
    sy += y as f64;
  }
  if n < MIN_POINTS {
    return None;
  }
  let mx = sx / n as f64;
  let my = sy / n as f64;

  let (mut cxx, mut cyy, mut cxy) = (0.0f64, 0.0f64, 0.0f64);
  for (x, y) in points {
    let dx = x as f64 - mx;
    let dy = y as f64 - my;
    cxx += dx * dx;
    cyy += dy * dy;
    cxy += dx * dy;
  }
  Some(Moments {
    mean: Point::new(mx as f32, my as f32),
    cxx: (cxx / n as f64) as f32,
    cyy: (cyy / n as f64) as f32,
    cxy: (cxy / n as f64) as f32,
  })
}

impl Moments {
  /// 协方差矩阵特征值（降序）与主轴角度
  fn principal(&self) -> (f32, f32, f32) {
    let half_trace = (self.cxx + self.cyy) / 2.0;
    let diff = (self.cxx - self.cyy) / 2.0;
    let root = (diff * diff + self.cxy * self.cxy).sqrt();
    let angle = 0.5 * (2.0 * self.cxy).atan2(self.cxx - self.cyy);
    (half_trace + root, (half_trace - root).max(0.0), angle)
  }
}

/// 对实心区域的像素拟合椭圆
pub fn fit_region(pixels: &[(u32, u32)]) -> Option<Ellipse> {
  let m = moments(pixels.iter().map(|&(x, y)| (x as f32, y as f32)))?;
  let (l1, l2, angle) = m.principal();
  // 离散像素自身有 1/12 的方差，半轴至少半个像素
  let semi_major = (2.0 * (l1 + 1.0 / 12.0).sqrt()).max(0.5);
  let semi_minor = (2.0 * (l2 + 1.0 / 12.0).sqrt()).max(0.5);
  Some(Ellipse {
    center: m.mean,
    semi_major,
    semi_minor,
    angle,
  })
}

/// 对边界点拟合椭圆
pub fn fit_boundary(points: &[Point]) -> Option<Ellipse> {
  let m = moments(points.iter().map(|p| (p.x, p.y)))?;
  let (l1, l2, angle) = m.principal();
  Some(Ellipse {
    center: m.mean,
    semi_major: (2.0 * l1).sqrt().max(0.5),
    semi_minor: (2.0 * l2).sqrt().max(0.5),
    angle,
  })
}

impl Ellipse {
  pub fn circle(center: Point, radius: f32) -> Self {
    Self {
      center,
      semi_major: radius,
      semi_minor: radius,
      angle: 0.0,
    }
  }

  pub fn area(&self) -> f32 {
    PI * self.semi_major * self.semi_minor
  }

  /// 等效半径
  pub fn radius(&self) -> f32 {
    (self.semi_major * self.semi_minor).sqrt()
  }

  pub fn ellipticity(&self) -> f32 {
    if self.semi_major <= 0.0 {
      return 0.0;
    }
    (self.semi_minor / self.semi_major).clamp(0.0, 1.0)
  }

  /// Ramanujan 近似
  pub fn perimeter(&self) -> f32 {
    let (a, b) = (self.semi_major, self.semi_minor);
    PI * (3.0 * (a + b) - ((3.0 * a + b) * (a + 3.0 * b)).sqrt())
  }

  pub fn bounding_box(&self) -> BoundingBox {
    let (sin, cos) = self.angle.sin_cos();
    let (a, b) = (self.semi_major, self.semi_minor);
    let half_w = (a * a * cos * cos + b * b * sin * sin).sqrt();
    let half_h = (a * a * sin * sin + b * b * cos * cos).sqrt();
    BoundingBox {
      x: self.center.x - half_w,
      y: self.center.y - half_h,
      width: 2.0 * half_w,
      height: 2.0 * half_h,
    }
  }

  pub fn translate(&self, dx: f32, dy: f32) -> Self {
    Self {
      center: Point::new(self.center.x + dx, self.center.y + dy),
      ..*self
    }
  }

  pub fn to_region(&self, confidence: f32) -> VeinRegion {
    VeinRegion {
      center: self.center,
      radius: self.radius(),
      area: self.area(),
      perimeter: self.perimeter(),
      ellipticity: self.ellipticity(),
      confidence: confidence.clamp(0.0, 1.0),
      bbox: self.bounding_box(),
      semi_major: self.semi_major,
      semi_minor: self.semi_minor,
      angle: self.angle,
    }
  }
}
