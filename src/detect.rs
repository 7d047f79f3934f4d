// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect.rs - 静脉检测引擎
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

//! # 检测引擎
//!
//! 四种检测算法组成一个封闭的枚举 [`DetectionEngine`]，通过同一个
//! [`Detector`] 接口调用。每个任务持有自己的引擎实例，引擎内部只保存
//! 参数快照，检测过程不修改任何共享状态。

use std::fmt;
use std::str::FromStr;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{BoundingBox, NormalizedFrame, Point, Roi};
use crate::settings::DetectionSettings;

pub mod components;
pub mod edge_hough;
pub mod ellipse;
pub mod learned;
pub mod morphology;
#[cfg(feature = "onnx_model")]
pub mod onnx;
pub mod ridge;
pub mod threshold;

pub use self::edge_hough::EdgeHoughDetector;
pub use self::learned::{LearnedDetector, Model, ModelError, ProbabilityMap, SharedModel};
pub use self::ridge::RidgeDetector;
pub use self::threshold::ThresholdDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
  #[default]
  EdgeHoughEllipse,
  RidgeFilterMorphology,
  ThresholdMorphology,
  LearnedSegmentation,
}

impl Algorithm {
  pub const ALL: [Algorithm; 4] = [
    Algorithm::EdgeHoughEllipse,
    Algorithm::RidgeFilterMorphology,
    Algorithm::ThresholdMorphology,
    Algorithm::LearnedSegmentation,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Algorithm::EdgeHoughEllipse => "edge_hough_ellipse",
      Algorithm::RidgeFilterMorphology => "ridge_filter_morphology",
      Algorithm::ThresholdMorphology => "threshold_morphology",
      Algorithm::LearnedSegmentation => "learned_segmentation",
    }
  }

  /// 算法实现版本，随结果一起记录
  pub fn version(&self) -> &'static str {
    match self {
      Algorithm::EdgeHoughEllipse => "1.1",
      Algorithm::RidgeFilterMorphology => "1.0",
      Algorithm::ThresholdMorphology => "1.1",
      Algorithm::LearnedSegmentation => "1.0",
    }
  }
}

impl fmt::Display for Algorithm {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("未知的检测算法: {0}")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for Algorithm {
  type Err = UnknownAlgorithm;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
      "edge_hough_ellipse" | "hough" | "traditional" => Ok(Algorithm::EdgeHoughEllipse),
      "ridge_filter_morphology" | "ridge" | "frangi" | "enhanced_cv" => {
        Ok(Algorithm::RidgeFilterMorphology)
      }
      "threshold_morphology" | "threshold" | "elliptical_morph" => {
        Ok(Algorithm::ThresholdMorphology)
      }
      "learned_segmentation" | "learned" | "samus" | "unet" => Ok(Algorithm::LearnedSegmentation),
      _ => Err(UnknownAlgorithm(s.to_string())),
    }
  }
}

/// 候选静脉区域
///
/// 几何量均由拟合椭圆给出，`radius` 为等效半径，满足
/// `area == π * radius²`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VeinRegion {
  pub center: Point,
  pub radius: f32,
  pub area: f32,
  pub perimeter: f32,
  /// 短轴 / 长轴
  pub ellipticity: f32,
  pub confidence: f32,
  pub bbox: BoundingBox,
  pub semi_major: f32,
  pub semi_minor: f32,
  /// 长轴方向（弧度）
  pub angle: f32,
}

/// 置信度的三个组成部分，均在 `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceTerms {
  pub fit: f32,
  pub ellipticity: f32,
  pub response: f32,
}

/// 各算法的置信度权重，权重均为非负数，保证对每一项单调
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceWeights {
  pub fit: f32,
  pub ellipticity: f32,
  pub response: f32,
}

impl ConfidenceWeights {
  pub fn score(&self, terms: ConfidenceTerms) -> f32 {
    let total = self.fit + self.ellipticity + self.response;
    if total <= 0.0 {
      return 0.0;
    }
    let value = self.fit * terms.fit.clamp(0.0, 1.0)
      + self.ellipticity * terms.ellipticity.clamp(0.0, 1.0)
      + self.response * terms.response.clamp(0.0, 1.0);
    (value / total).clamp(0.0, 1.0)
  }
}

#[derive(Error, Debug)]
pub enum DetectionError {
  #[error("模型错误: {0}")]
  Model(#[from] ModelError),
  #[error("检测区域为空: {width}x{height}")]
  EmptyRegion { width: u32, height: u32 },
}

pub trait Detector {
  fn detect(&self, frame: &NormalizedFrame, roi: Roi) -> Result<Vec<VeinRegion>, DetectionError>;
}

/// 检测区域取 ROI 与预处理区域的交集
pub(crate) fn search_region(frame: &NormalizedFrame, roi: Roi) -> Result<Roi, DetectionError> {
  let roi = roi.clamp_to(frame.width(), frame.height());
  let region = frame.region;
  let x0 = roi.x.max(region.x);
  let y0 = roi.y.max(region.y);
  let x1 = roi.right().min(region.right());
  let y1 = roi.bottom().min(region.bottom());
  if x1 <= x0 || y1 <= y0 {
    return Err(DetectionError::EmptyRegion {
      width: x1.saturating_sub(x0),
      height: y1.saturating_sub(y0),
    });
  }
  Ok(Roi::new(x0, y0, x1 - x0, y1 - y0))
}

pub(crate) fn crop(frame: &NormalizedFrame, region: Roi) -> GrayImage {
  image::imageops::crop_imm(&frame.gray, region.x, region.y, region.width, region.height)
    .to_image()
}

/// 每个任务独立构造的检测引擎
pub enum DetectionEngine {
  EdgeHoughEllipse(EdgeHoughDetector),
  RidgeFilterMorphology(RidgeDetector),
  ThresholdMorphology(ThresholdDetector),
  LearnedSegmentation(LearnedDetector),
}

impl DetectionEngine {
  /// 按参数快照中的算法构造引擎
  ///
  /// `model` 仅用于深度分割算法；为 `None` 时按参数中的模型 URL 加载，
  /// 加载失败时该算法退化为空结果。
  pub fn new(
    settings: &DetectionSettings,
    selected_point: Option<Point>,
    model: Option<SharedModel>,
  ) -> Self {
    match settings.algorithm {
      Algorithm::EdgeHoughEllipse => {
        DetectionEngine::EdgeHoughEllipse(EdgeHoughDetector::new(settings.edge_hough.clone()))
      }
      Algorithm::RidgeFilterMorphology => {
        DetectionEngine::RidgeFilterMorphology(RidgeDetector::new(settings.ridge.clone()))
      }
      Algorithm::ThresholdMorphology => DetectionEngine::ThresholdMorphology(
        ThresholdDetector::new(settings.threshold.clone(), selected_point),
      ),
      Algorithm::LearnedSegmentation => {
        let detector = match model {
          Some(model) => LearnedDetector::with_model(settings.learned.clone(), model),
          None => LearnedDetector::from_settings(settings.learned.clone()),
        };
        DetectionEngine::LearnedSegmentation(detector)
      }
    }
  }

  pub fn algorithm(&self) -> Algorithm {
    match self {
      DetectionEngine::EdgeHoughEllipse(_) => Algorithm::EdgeHoughEllipse,
      DetectionEngine::RidgeFilterMorphology(_) => Algorithm::RidgeFilterMorphology,
      DetectionEngine::ThresholdMorphology(_) => Algorithm::ThresholdMorphology,
      DetectionEngine::LearnedSegmentation(_) => Algorithm::LearnedSegmentation,
    }
  }

  /// 算法退化为空结果的原因，目前只有模型不可用一种
  pub fn degradation(&self) -> Option<&str> {
    match self {
      DetectionEngine::LearnedSegmentation(detector) => detector.unavailable_reason(),
      _ => None,
    }
  }
}

impl Detector for DetectionEngine {
  fn detect(&self, frame: &NormalizedFrame, roi: Roi) -> Result<Vec<VeinRegion>, DetectionError> {
    match self {
      DetectionEngine::EdgeHoughEllipse(detector) => detector.detect(frame, roi),
      DetectionEngine::RidgeFilterMorphology(detector) => detector.detect(frame, roi),
      DetectionEngine::ThresholdMorphology(detector) => detector.detect(frame, roi),
      DetectionEngine::LearnedSegmentation(detector) => detector.detect(frame, roi),
    }
  }
}
