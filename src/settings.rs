// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/settings.rs - 检测参数与校验
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

//! # 检测参数
//!
//! [`DetectionSettings`] 描述一次任务所需的全部可调参数。任务提交时会对
//! 参数做一次快照（`Arc<DetectionSettings>`），之后对 [`LiveSettings`] 的
//! 修改只影响新任务。
//!
//! 参数可以直接从 JSON 反序列化，缺省字段使用默认值：
//!
//! ```
//! use jingmai::settings::DetectionSettings;
//!
//! let settings: DetectionSettings =
//!   serde_json::from_str(r#"{ "edge_hough": { "canny_low": 40.0 } }"#).unwrap();
//! assert_eq!(settings.edge_hough.canny_low, 40.0);
//! assert_eq!(settings.edge_hough.canny_high, 150.0);
//! assert!(settings.validate().is_ok());
//! ```

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::detect::Algorithm;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("参数 `{field}` 无效: {reason}")]
pub struct InvalidSettingsError {
  pub field: &'static str,
  pub reason: String,
}

impl InvalidSettingsError {
  pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
    Self {
      field,
      reason: reason.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
  /// 高斯模糊核大小（奇数，1 表示不模糊）
  pub blur_kernel: u32,
  pub clahe_clip_limit: f32,
  pub clahe_tile_grid: u32,
}

impl Default for PreprocessSettings {
  fn default() -> Self {
    Self {
      blur_kernel: 5,
      clahe_clip_limit: 2.0,
      clahe_tile_grid: 8,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeHoughSettings {
  pub canny_low: f32,
  pub canny_high: f32,
  /// 累加器分辨率与图像分辨率之比
  pub dp: f32,
  /// 圆心之间的最小距离
  pub min_dist: f32,
  /// 参与投票的梯度幅值下限
  pub param1: f32,
  /// 累加器峰值的票数下限
  pub param2: f32,
  pub min_radius: u32,
  pub max_radius: u32,
  pub min_area: f32,
  pub max_area: f32,
  /// 允许的椭圆度偏差，短轴/长轴需不小于 `1 - tolerance`
  pub elliptical_tolerance: f32,
}

impl Default for EdgeHoughSettings {
  fn default() -> Self {
    Self {
      canny_low: 50.0,
      canny_high: 150.0,
      dp: 1.0,
      min_dist: 50.0,
      param1: 50.0,
      param2: 30.0,
      min_radius: 5,
      max_radius: 50,
      min_area: 100.0,
      max_area: 2000.0,
      elliptical_tolerance: 0.3,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeSettings {
  pub scale_min: f32,
  pub scale_max: f32,
  pub scale_step: f32,
  /// 血管响应阈值
  pub threshold: f32,
  /// 与 Otsu 暗区掩码求交
  pub dark_gating: bool,
  pub min_area: f32,
  pub max_area: f32,
  pub min_aspect: f32,
  pub max_aspect: f32,
  /// 中心点纵向位置（占 ROI 高度的比例）
  pub band_min: f32,
  pub band_max: f32,
  pub kernel_size: u32,
  pub close_iterations: u32,
  pub open_iterations: u32,
}

impl Default for RidgeSettings {
  fn default() -> Self {
    Self {
      scale_min: 1.5,
      scale_max: 5.0,
      scale_step: 0.5,
      threshold: 0.04,
      dark_gating: true,
      min_area: 300.0,
      max_area: 3500.0,
      min_aspect: 0.6,
      max_aspect: 1.6,
      band_min: 0.4,
      band_max: 0.8,
      kernel_size: 5,
      close_iterations: 2,
      open_iterations: 1,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSettings {
  pub lower: u8,
  pub upper: u8,
  /// 形态学强度，映射为核半径与迭代次数
  pub morph_strength: f32,
  pub largest_component: bool,
  pub roi_center_component: bool,
  pub selected_point_component: bool,
}

impl Default for ThresholdSettings {
  fn default() -> Self {
    Self {
      lower: 50,
      upper: 150,
      morph_strength: 0.5,
      largest_component: false,
      roi_center_component: false,
      selected_point_component: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedSettings {
  /// 模型 URL，例如 `onnx:///models/vein.onnx`
  pub model: Option<String>,
  pub probability_threshold: f32,
}

impl Default for LearnedSettings {
  fn default() -> Self {
    Self {
      model: None,
      probability_threshold: 0.5,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
  pub min_area: f32,
  pub max_area: f32,
  pub min_aspect: f32,
  pub max_aspect: f32,
  /// 中心点需落在帧高度的 `[min, max]` 比例区间内
  pub vertical_band: Option<(f32, f32)>,
  /// 与 ROI 中心的最大距离
  pub max_roi_distance: Option<f32>,
  /// 与用户选点的最大距离
  pub max_point_distance: Option<f32>,
  pub overlap_threshold: f32,
}

impl Default for FilterSettings {
  fn default() -> Self {
    Self {
      min_area: 100.0,
      max_area: 3500.0,
      min_aspect: 0.3,
      max_aspect: 3.0,
      vertical_band: None,
      max_roi_distance: None,
      max_point_distance: None,
      overlap_threshold: 0.3,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
  pub roi_width: u32,
  pub roi_height: u32,
  pub process_noise: f32,
  pub measurement_noise: f32,
  pub drift_threshold: f32,
  pub drift_frames: u32,
  pub lost_threshold: f32,
  pub lost_frames: u32,
  pub history: usize,
  /// 每帧 ROI 中心的最大移动距离
  pub max_step: f32,
  pub lost_penalty: f32,
  /// 小于该位移视为稳定
  pub stable_movement: f32,
  /// 小于该位移视为漂移，否则为跳变
  pub drift_movement: f32,
}

impl Default for TrackerSettings {
  fn default() -> Self {
    Self {
      roi_width: 200,
      roi_height: 200,
      process_noise: 1.0,
      measurement_noise: 4.0,
      drift_threshold: 20.0,
      drift_frames: 3,
      lost_threshold: 60.0,
      lost_frames: 10,
      history: 10,
      max_step: 50.0,
      lost_penalty: 0.5,
      stable_movement: 3.0,
      drift_movement: 20.0,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
  pub max_frame_pixels: u64,
  pub max_duration_secs: Option<f64>,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      max_frame_pixels: 8192 * 8192,
      max_duration_secs: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
  pub algorithm: Algorithm,
  pub target_fps: f64,
  pub preprocess: PreprocessSettings,
  pub edge_hough: EdgeHoughSettings,
  pub ridge: RidgeSettings,
  pub threshold: ThresholdSettings,
  pub learned: LearnedSettings,
  pub filter: FilterSettings,
  pub tracker: TrackerSettings,
  pub limits: Limits,
}

impl Default for DetectionSettings {
  fn default() -> Self {
    Self {
      algorithm: Algorithm::default(),
      target_fps: 8.0,
      preprocess: PreprocessSettings::default(),
      edge_hough: EdgeHoughSettings::default(),
      ridge: RidgeSettings::default(),
      threshold: ThresholdSettings::default(),
      learned: LearnedSettings::default(),
      filter: FilterSettings::default(),
      tracker: TrackerSettings::default(),
      limits: Limits::default(),
    }
  }
}

fn in_range<T: PartialOrd + std::fmt::Display>(
  field: &'static str,
  value: T,
  min: T,
  max: T,
) -> Result<(), InvalidSettingsError> {
  if value < min || value > max {
    return Err(InvalidSettingsError::new(
      field,
      format!("{} 不在 [{}, {}] 范围内", value, min, max),
    ));
  }
  Ok(())
}

fn ordered<T: PartialOrd + std::fmt::Display>(
  field: &'static str,
  low: T,
  high: T,
) -> Result<(), InvalidSettingsError> {
  if low > high {
    return Err(InvalidSettingsError::new(
      field,
      format!("下限 {} 大于上限 {}", low, high),
    ));
  }
  Ok(())
}

fn odd(field: &'static str, value: u32) -> Result<(), InvalidSettingsError> {
  if value == 0 || value % 2 == 0 {
    return Err(InvalidSettingsError::new(
      field,
      format!("核大小必须为正奇数，当前为 {}", value),
    ));
  }
  Ok(())
}

fn positive(field: &'static str, value: f64) -> Result<(), InvalidSettingsError> {
  if !value.is_finite() || value <= 0.0 {
    return Err(InvalidSettingsError::new(
      field,
      format!("必须为正数，当前为 {}", value),
    ));
  }
  Ok(())
}

impl DetectionSettings {
  /// 检查所有参数范围，任务进入 PROCESSING 之前调用
  pub fn validate(&self) -> Result<(), InvalidSettingsError> {
    positive("target_fps", self.target_fps)?;

    let p = &self.preprocess;
    odd("preprocess.blur_kernel", p.blur_kernel)?;
    in_range("preprocess.blur_kernel", p.blur_kernel, 1, 31)?;
    in_range("preprocess.clahe_clip_limit", p.clahe_clip_limit, 0.1, 40.0)?;
    in_range("preprocess.clahe_tile_grid", p.clahe_tile_grid, 1, 64)?;

    let e = &self.edge_hough;
    in_range("edge_hough.canny_low", e.canny_low, 0.0, 255.0)?;
    in_range("edge_hough.canny_high", e.canny_high, 0.0, 255.0)?;
    ordered("edge_hough.canny_low", e.canny_low, e.canny_high)?;
    // 累加器分辨率不高于图像分辨率
    in_range("edge_hough.dp", e.dp, 1.0, 3.0)?;
    in_range("edge_hough.min_dist", e.min_dist, 10.0, 500.0)?;
    in_range("edge_hough.param1", e.param1, 10.0, 200.0)?;
    in_range("edge_hough.param2", e.param2, 10.0, 100.0)?;
    in_range("edge_hough.min_radius", e.min_radius, 1, 1000)?;
    in_range("edge_hough.max_radius", e.max_radius, 1, 1000)?;
    ordered("edge_hough.min_radius", e.min_radius, e.max_radius)?;
    in_range("edge_hough.min_area", e.min_area, 10.0, 5000.0)?;
    in_range("edge_hough.max_area", e.max_area, 100.0, 10000.0)?;
    ordered("edge_hough.min_area", e.min_area, e.max_area)?;
    in_range(
      "edge_hough.elliptical_tolerance",
      e.elliptical_tolerance,
      0.1,
      1.0,
    )?;

    let r = &self.ridge;
    in_range("ridge.scale_min", r.scale_min, 0.5, 20.0)?;
    in_range("ridge.scale_max", r.scale_max, 0.5, 20.0)?;
    in_range("ridge.scale_step", r.scale_step, 0.1, 10.0)?;
    ordered("ridge.scale_min", r.scale_min, r.scale_max)?;
    in_range("ridge.threshold", r.threshold, 0.0, 1.0)?;
    ordered("ridge.min_area", r.min_area, r.max_area)?;
    ordered("ridge.min_aspect", r.min_aspect, r.max_aspect)?;
    in_range("ridge.band_min", r.band_min, 0.0, 1.0)?;
    in_range("ridge.band_max", r.band_max, 0.0, 1.0)?;
    ordered("ridge.band_min", r.band_min, r.band_max)?;
    odd("ridge.kernel_size", r.kernel_size)?;

    let t = &self.threshold;
    ordered("threshold.lower", t.lower, t.upper)?;
    in_range("threshold.morph_strength", t.morph_strength, 0.0, 1.0)?;

    in_range(
      "learned.probability_threshold",
      self.learned.probability_threshold,
      0.0,
      1.0,
    )?;

    let f = &self.filter;
    ordered("filter.min_area", f.min_area, f.max_area)?;
    ordered("filter.min_aspect", f.min_aspect, f.max_aspect)?;
    if let Some((low, high)) = f.vertical_band {
      in_range("filter.vertical_band", low, 0.0, 1.0)?;
      in_range("filter.vertical_band", high, 0.0, 1.0)?;
      ordered("filter.vertical_band", low, high)?;
    }
    if let Some(distance) = f.max_roi_distance {
      positive("filter.max_roi_distance", distance as f64)?;
    }
    if let Some(distance) = f.max_point_distance {
      positive("filter.max_point_distance", distance as f64)?;
    }
    in_range("filter.overlap_threshold", f.overlap_threshold, 0.0, 1.0)?;

    let k = &self.tracker;
    in_range("tracker.roi_width", k.roi_width, 1, 8192)?;
    in_range("tracker.roi_height", k.roi_height, 1, 8192)?;
    positive("tracker.process_noise", k.process_noise as f64)?;
    positive("tracker.measurement_noise", k.measurement_noise as f64)?;
    positive("tracker.drift_threshold", k.drift_threshold as f64)?;
    ordered("tracker.drift_threshold", k.drift_threshold, k.lost_threshold)?;
    in_range("tracker.drift_frames", k.drift_frames, 1, 1000)?;
    ordered("tracker.drift_frames", k.drift_frames, k.lost_frames)?;
    in_range("tracker.history", k.history, 1, 10_000)?;
    positive("tracker.max_step", k.max_step as f64)?;
    in_range("tracker.lost_penalty", k.lost_penalty, 0.0, 1.0)?;
    ordered(
      "tracker.stable_movement",
      k.stable_movement,
      k.drift_movement,
    )?;

    if self.limits.max_frame_pixels == 0 {
      return Err(InvalidSettingsError::new(
        "limits.max_frame_pixels",
        "必须大于 0",
      ));
    }
    if let Some(secs) = self.limits.max_duration_secs {
      positive("limits.max_duration_secs", secs)?;
    }

    Ok(())
  }
}

/// 可在运行期修改的参数
///
/// 修改总是构造新的 `Arc` 并整体替换，已经拿到快照的任务不受影响。
#[derive(Debug, Default)]
pub struct LiveSettings {
  current: RwLock<Arc<DetectionSettings>>,
}

impl LiveSettings {
  pub fn new(settings: DetectionSettings) -> Result<Self, InvalidSettingsError> {
    settings.validate()?;
    Ok(Self {
      current: RwLock::new(Arc::new(settings)),
    })
  }

  pub fn snapshot(&self) -> Arc<DetectionSettings> {
    let guard = self
      .current
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(&guard)
  }

  pub fn replace(&self, settings: DetectionSettings) -> Result<(), InvalidSettingsError> {
    settings.validate()?;
    let mut guard = self
      .current
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Arc::new(settings);
    info!("实时参数已更新，仅对新任务生效");
    Ok(())
  }

  /// 在当前参数的副本上修改并替换
  pub fn update<F>(&self, f: F) -> Result<(), InvalidSettingsError>
  where
    F: FnOnce(&mut DetectionSettings),
  {
    let mut guard = self
      .current
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut next = DetectionSettings::clone(&guard);
    f(&mut next);
    next.validate()?;
    *guard = Arc::new(next);
    info!("实时参数已更新，仅对新任务生效");
    Ok(())
  }
}
