// 该文件是 Jingmai （静脉追踪） 项目的一部分。
// src/detect/onnx.rs - ONNX Runtime 分割模型
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

//! 单通道输入、单通道概率输出的分割网络。
//!
//! URL 形如 `onnx:///models/vein.onnx?width=256&height=256&input=input&threads=4`。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use image::{GrayImage, Luma, imageops::FilterType};
use ort::session::{Session, builder::GraphOptimizationLevel};
use tracing::{debug, info};
use url::Url;

use crate::detect::learned::{Model, ModelError, ProbabilityMap};
use crate::{FromUrl, FromUrlWithScheme, url_path};

const DEFAULT_INPUT_SIZE: u32 = 256;
const DEFAULT_INPUT_NAME: &str = "input";
const DEFAULT_THREADS: usize = 4;

pub struct OnnxSegmentation {
  session: Mutex<Session>,
  input_name: String,
  input_width: u32,
  input_height: u32,
}

fn runtime_error(e: ort::Error) -> ModelError {
  ModelError::Inference(e.to_string())
}

impl FromUrlWithScheme for OnnxSegmentation {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxSegmentation {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::UnsupportedScheme(url.scheme().to_string()));
    }

    let path = url_path(url);
    if !Path::new(&path).exists() {
      return Err(ModelError::Unavailable(format!("模型文件不存在: {}", path)));
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let input_width = query
      .get("width")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_INPUT_SIZE);
    let input_height = query
      .get("height")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_INPUT_SIZE);
    let threads = query
      .get("threads")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_THREADS);
    let input_name = query
      .get("input")
      .cloned()
      .unwrap_or_else(|| DEFAULT_INPUT_NAME.to_string());

    info!("加载 ONNX 模型: {} ({}x{})", path, input_width, input_height);
    let session = Session::builder()
      .map_err(runtime_error)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(runtime_error)?
      .with_intra_threads(threads)
      .map_err(runtime_error)?
      .commit_from_file(&path)
      .map_err(|e| ModelError::Unavailable(e.to_string()))?;

    Ok(OnnxSegmentation {
      session: Mutex::new(session),
      input_name,
      input_width,
      input_height,
    })
  }
}

fn sigmoid(v: f32) -> f32 {
  1.0 / (1.0 + (-v).exp())
}

impl Model for OnnxSegmentation {
  type Input = GrayImage;
  type Output = ProbabilityMap;
  type Error = ModelError;

  fn infer(&self, input: &GrayImage) -> Result<ProbabilityMap, ModelError> {
    let (w, h) = (self.input_width, self.input_height);
    let resized = image::imageops::resize(input, w, h, FilterType::Triangle);
    let data: Vec<f32> = resized.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
    let shape = [1usize, 1, h as usize, w as usize];
    let input_value = ort::value::Value::from_array((shape.as_slice(), data.into_boxed_slice()))
      .map_err(runtime_error)?;

    let output: Vec<f32> = {
      let mut session = self
        .session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      let outputs = session
        .run(ort::inputs![self.input_name.as_str() => input_value])
        .map_err(runtime_error)?;
      let (output_shape, slice) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(runtime_error)?;
      debug!("模型输出形状: {:?}", output_shape);
      slice.to_vec()
    };

    let plane = (w * h) as usize;
    if output.len() < plane {
      return Err(ModelError::ShapeMismatch {
        expected: (w, h),
        actual: (output.len() as u32, 1),
      });
    }
    // 多通道输出时取最后一个通道作为前景
    let foreground = &output[output.len() - plane..];
    let logits = foreground.iter().any(|v| *v < 0.0 || *v > 1.0);
    let probability = ProbabilityMap::from_fn(w, h, |x, y| {
      let v = foreground[(y * w + x) as usize];
      Luma([if logits { sigmoid(v) } else { v }])
    });

    Ok(image::imageops::resize(
      &probability,
      input.width(),
      input.height(),
      FilterType::Triangle,
    ))
  }
}
