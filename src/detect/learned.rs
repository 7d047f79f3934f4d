// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/learned.rs - 深度分割模型检测
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

use std::sync::Arc;

use image::{GrayImage, ImageBuffer, Luma};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::components::FOREGROUND;
use crate::detect::threshold::{ComponentSelection, regions_from_mask};
use crate::detect::{DetectionError, Detector, VeinRegion, crop, search_region};
use crate::frame::{NormalizedFrame, Roi};
use crate::settings::LearnedSettings;

/// 与输入同尺寸的逐像素前景概率
pub type ProbabilityMap = ImageBuffer<Luma<f32>, Vec<f32>>;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 可在任务间共享的分割模型，推理过程中不持有任何跟踪器相关的锁
pub type SharedModel =
  Arc<dyn Model<Input = GrayImage, Output = ProbabilityMap, Error = ModelError> + Send + Sync>;

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型不可用: {0}")]
  Unavailable(String),
  #[error("不支持的模型 URL 方案: {0}")]
  UnsupportedScheme(String),
  #[error("模型 URL 无效: {0}")]
  InvalidUrl(#[from] url::ParseError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("输出尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

/// 按 URL 加载模型
pub fn load_model(url: &str) -> Result<SharedModel, ModelError> {
  let url = url::Url::parse(url)?;
  #[cfg(feature = "onnx_model")]
  {
    use crate::{FromUrl, FromUrlWithScheme, detect::onnx::OnnxSegmentation};

    if url.scheme() == OnnxSegmentation::SCHEME {
      let model = OnnxSegmentation::from_url(&url)?;
      return Ok(Arc::new(model));
    }
  }
  Err(ModelError::UnsupportedScheme(url.scheme().to_string()))
}

pub struct LearnedDetector {
  settings: LearnedSettings,
  model: Option<SharedModel>,
  unavailable: Option<String>,
}

impl LearnedDetector {
  /// 按参数中的模型 URL 加载；失败时记录原因并退化为空结果
  pub fn from_settings(settings: LearnedSettings) -> Self {
    let loaded = match settings.model.as_deref() {
      None => Err(ModelError::Unavailable("未配置模型".to_string())),
      Some(url) => {
        info!("加载分割模型: {}", url);
        load_model(url)
      }
    };
    match loaded {
      Ok(model) => Self {
        settings,
        model: Some(model),
        unavailable: None,
      },
      Err(e) => {
        warn!("分割模型不可用，深度分割将返回空结果: {}", e);
        Self {
          settings,
          model: None,
          unavailable: Some(e.to_string()),
        }
      }
    }
  }

  pub fn with_model(settings: LearnedSettings, model: SharedModel) -> Self {
    Self {
      settings,
      model: Some(model),
      unavailable: None,
    }
  }

  pub fn is_available(&self) -> bool {
    self.model.is_some()
  }

  /// 模型不可用的原因
  pub fn unavailable_reason(&self) -> Option<&str> {
    self.unavailable.as_deref()
  }

  fn mask(&self, probability: &ProbabilityMap) -> GrayImage {
    let threshold = self.settings.probability_threshold;
    GrayImage::from_fn(probability.width(), probability.height(), |x, y| {
      Luma([if probability.get_pixel(x, y).0[0] >= threshold {
        FOREGROUND
      } else {
        0
      }])
    })
  }
}

impl Detector for LearnedDetector {
  fn detect(&self, frame: &NormalizedFrame, roi: Roi) -> Result<Vec<VeinRegion>, DetectionError> {
    let Some(model) = &self.model else {
      debug!("分割模型不可用，跳过第 {} 帧", frame.index);
      return Ok(Vec::new());
    };

    let region = search_region(frame, roi)?;
    let local = crop(frame, region);
    let probability = model.infer(&local)?;
    if probability.dimensions() != local.dimensions() {
      return Err(
        ModelError::ShapeMismatch {
          expected: local.dimensions(),
          actual: probability.dimensions(),
        }
        .into(),
      );
    }

    let mask = self.mask(&probability);
    let Some(selected) = ComponentSelection::Largest.apply(&mask) else {
      return Ok(Vec::new());
    };
    Ok(regions_from_mask(&selected, &local, region))
  }
}
