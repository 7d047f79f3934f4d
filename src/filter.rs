// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/filter.rs - 候选区域过滤与排序
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

use std::cmp::Ordering;

use tracing::debug;

use crate::detect::VeinRegion;
use crate::frame::{Point, Roi};
use crate::settings::FilterSettings;

/// 过滤时需要的帧级上下文
#[derive(Debug, Clone, Copy)]
pub struct FilterContext {
  pub roi: Roi,
  pub frame_height: u32,
  pub selected_point: Option<Point>,
}

/// 基于中心距离估计两个区域的重叠程度
///
/// 中心距离小于较小的半长轴时，重叠度为 `(r - d) / r`，否则为 0。
pub fn overlap_ratio(a: &VeinRegion, b: &VeinRegion) -> f32 {
  let distance = a.center.distance(&b.center);
  let min_radius = a.semi_major.min(b.semi_major);
  if min_radius <= 0.0 || distance >= min_radius {
    return 0.0;
  }
  (min_radius - distance) / min_radius
}

pub struct RegionFilter {
  settings: FilterSettings,
}

impl RegionFilter {
  pub fn new(settings: FilterSettings) -> Self {
    Self { settings }
  }

  /// 所有启用的约束同时满足（逻辑与）
  pub fn accepts(&self, region: &VeinRegion, ctx: &FilterContext) -> bool {
    let s = &self.settings;
    if region.area < s.min_area || region.area > s.max_area {
      return false;
    }
    let aspect = region.bbox.aspect_ratio();
    if aspect < s.min_aspect || aspect > s.max_aspect {
      return false;
    }
    if let Some((low, high)) = s.vertical_band {
      let position = region.center.y / ctx.frame_height.max(1) as f32;
      if position < low || position > high {
        return false;
      }
    }
    if let Some(max) = s.max_roi_distance
      && region.center.distance(&ctx.roi.center()) > max
    {
      return false;
    }
    if let (Some(max), Some(point)) = (s.max_point_distance, ctx.selected_point)
      && region.center.distance(&point) > max
    {
      return false;
    }
    true
  }

  /// 置信度降序；置信度相同时面积大者优先，再按与 ROI 中心的距离升序
  pub fn rank(a: &VeinRegion, b: &VeinRegion, ctx: &FilterContext) -> Ordering {
    let center = ctx.roi.center();
    b.confidence
      .total_cmp(&a.confidence)
      .then_with(|| b.area.total_cmp(&a.area))
      .then_with(|| {
        a.center
          .distance(&center)
          .total_cmp(&b.center.distance(&center))
      })
  }

  pub fn filter(&self, regions: Vec<VeinRegion>, ctx: &FilterContext) -> Vec<VeinRegion> {
    let total = regions.len();
    let mut accepted: Vec<VeinRegion> = regions
      .into_iter()
      .filter(|r| self.accepts(r, ctx))
      .collect();
    accepted.sort_by(|a, b| Self::rank(a, b, ctx));

    let mut kept: Vec<VeinRegion> = Vec::with_capacity(accepted.len());
    for region in accepted {
      let overlapping = kept
        .iter()
        .any(|k| overlap_ratio(&region, k) > self.settings.overlap_threshold);
      if !overlapping {
        kept.push(region);
      }
    }
    debug!("候选区域 {} 个，过滤后 {} 个", total, kept.len());
    kept
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::detect::ellipse::Ellipse;

  fn region(x: f32, y: f32, r: f32, confidence: f32) -> VeinRegion {
    Ellipse::circle(Point::new(x, y), r).to_region(confidence)
  }

  fn ctx() -> FilterContext {
    FilterContext {
      roi: Roi::new(0, 0, 200, 200),
      frame_height: 200,
      selected_point: None,
    }
  }

  #[test]
  fn area_bounds_are_applied() {
    let filter = RegionFilter::new(FilterSettings::default());
    let out = filter.filter(
      vec![region(50.0, 50.0, 3.0, 0.9), region(150.0, 150.0, 15.0, 0.8)],
      &ctx(),
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].center, Point::new(150.0, 150.0));
  }

  #[test]
  fn constraints_compose_as_and() {
    let settings = FilterSettings {
      vertical_band: Some((0.4, 0.8)),
      max_roi_distance: Some(40.0),
      ..FilterSettings::default()
    };
    let filter = RegionFilter::new(settings);
    // 在带内但离中心太远
    let far = region(20.0, 120.0, 10.0, 0.9);
    // 离中心近但不在带内
    let high = region(100.0, 70.0, 10.0, 0.9);
    let good = region(110.0, 110.0, 10.0, 0.9);
    let out = filter.filter(vec![far, high, good.clone()], &ctx());
    assert_eq!(out, vec![good]);
  }

  #[test]
  fn selected_point_distance_needs_a_point() {
    let settings = FilterSettings {
      max_point_distance: Some(10.0),
      ..FilterSettings::default()
    };
    let filter = RegionFilter::new(settings);
    let r = region(60.0, 60.0, 10.0, 0.9);
    assert!(filter.accepts(&r, &ctx()));
    let with_point = FilterContext {
      selected_point: Some(Point::new(150.0, 150.0)),
      ..ctx()
    };
    assert!(!filter.accepts(&r, &with_point));
  }

  #[test]
  fn ties_break_by_area_then_distance() {
    let filter = RegionFilter::new(FilterSettings::default());
    let small_near = region(100.0, 100.0, 8.0, 0.7);
    let big_far = region(20.0, 20.0, 12.0, 0.7);
    let same_far = region(180.0, 180.0, 8.0, 0.7);
    let out = filter.filter(vec![same_far.clone(), small_near.clone(), big_far.clone()], &ctx());
    assert_eq!(out, vec![big_far, small_near, same_far]);
  }

  #[test]
  fn overlapping_lower_ranked_region_is_dropped() {
    let filter = RegionFilter::new(FilterSettings::default());
    let strong = region(100.0, 100.0, 12.0, 0.9);
    let weak = region(103.0, 100.0, 10.0, 0.6);
    let out = filter.filter(vec![weak, strong.clone()], &ctx());
    assert_eq!(out, vec![strong]);
  }
}
