// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/replay.rs - 回放预先导出的模型输出
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use crate::{
  input::DumpPayload,
  model::{Model, ModelBuilder, RawTensor},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("导出数据中没有任何输出张量")]
  NoOutputs,
  #[error("导出文件无法读取 {path}: {reason}")]
  Unreadable { path: PathBuf, reason: String },
}

/// 把数据集中已导出的输出张量当作推理结果返回，用于脱离加速器的离线评测
///
/// 输出数量是否与尺度数一致由后处理检查，不匹配属于配置错误。
#[derive(Debug, Clone, Default)]
pub struct ReplayModel;

impl Model for ReplayModel {
  type Input = DumpPayload;
  type Error = ReplayError;

  fn infer(&self, input: &Self::Input) -> Result<Vec<RawTensor>, Self::Error> {
    match input {
      DumpPayload::Outputs(outputs) if outputs.is_empty() => Err(ReplayError::NoOutputs),
      DumpPayload::Outputs(outputs) => {
        debug!("回放 {} 个输出张量", outputs.len());
        Ok(outputs.clone())
      }
      DumpPayload::Unreadable { path, reason } => Err(ReplayError::Unreadable {
        path: path.clone(),
        reason: reason.clone(),
      }),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayModelBuilder;

impl ModelBuilder for ReplayModelBuilder {
  type Model = ReplayModel;
  type Error = ReplayError;

  fn build(&self) -> Result<Self::Model, Self::Error> {
    Ok(ReplayModel)
  }
}
