// 该文件是 Shanan （山南西风） 项目的一部分。
// src/postprocess/nms.rs - 按类别的非极大值抑制
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

use std::collections::BTreeMap;

use tracing::debug;

use crate::{config::NmsMethod, model::DetectItem};

/// 按类别独立执行非极大值抑制。
///
/// 每一轮选出剩余框中分数最高者（并列时取输入顺序中最靠前的），
/// 保留它并更新同类其余框的分数：
/// - `Nms`：IoU 大于 `iou_threshold` 的框分数置 0；
/// - `SoftNms`：分数乘以 `exp(-iou² / sigma)`。
///
/// 分数不大于 0 的框被移除，循环直到该类别没有剩余框。
/// 输出按类别编号升序、类内按保留顺序排列。
pub fn nms(
  boxes: &[DetectItem],
  iou_threshold: f32,
  method: NmsMethod,
  sigma: f32,
) -> Vec<DetectItem> {
  let mut classes: BTreeMap<usize, Vec<DetectItem>> = BTreeMap::new();
  for b in boxes {
    classes.entry(b.class_id).or_default().push(*b);
  }

  let mut kept = Vec::new();
  for (class_id, mut remaining) in classes {
    let before = remaining.len();
    let start = kept.len();

    while !remaining.is_empty() {
      let best = remaining.remove(argmax_first(&remaining));
      kept.push(best);

      remaining.retain_mut(|b| {
        let iou = best.iou(b);
        match method {
          NmsMethod::Nms => {
            if iou > iou_threshold {
              b.score = 0.0;
            }
          }
          NmsMethod::SoftNms => {
            b.score *= (-(iou * iou) / sigma).exp();
          }
        }
        b.score > 0.0
      });
    }

    debug!(
      "类别 {}: NMS 前 {} 个，保留 {} 个",
      class_id,
      before,
      kept.len() - start
    );
  }
  kept
}

/// 分数最高的 `k` 个框，分数相同时保持原顺序
pub fn top_k(mut boxes: Vec<DetectItem>, k: usize) -> Vec<DetectItem> {
  if boxes.len() > k {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    boxes.truncate(k);
  }
  boxes
}

fn argmax_first(boxes: &[DetectItem]) -> usize {
  let mut best = 0;
  for (i, b) in boxes.iter().enumerate().skip(1) {
    if b.score > boxes[best].score {
      best = i;
    }
  }
  best
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(class_id: usize, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem::new(class_id, score, bbox)
  }

  #[test]
  fn suppresses_overlapping_boxes_of_same_class() {
    let boxes = vec![
      item(0, 0.8, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.9, [1.0, 1.0, 11.0, 11.0]),
      item(0, 0.7, [50.0, 50.0, 60.0, 60.0]),
    ];
    let kept = nms(&boxes, 0.5, NmsMethod::Nms, 0.3);
    assert_eq!(kept, vec![boxes[1], boxes[2]]);
  }

  #[test]
  fn classes_do_not_interact() {
    let boxes = vec![
      item(1, 0.9, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.8, [0.0, 0.0, 10.0, 10.0]),
    ];
    let kept = nms(&boxes, 0.5, NmsMethod::Nms, 0.3);
    assert_eq!(kept, vec![boxes[1], boxes[0]]);
  }

  #[test]
  fn equal_scores_keep_first_occurrence() {
    let boxes = vec![
      item(0, 0.5, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.5, [0.5, 0.5, 10.5, 10.5]),
    ];
    let kept = nms(&boxes, 0.5, NmsMethod::Nms, 0.3);
    assert_eq!(kept, vec![boxes[0]]);
    assert_eq!(kept, nms(&boxes, 0.5, NmsMethod::Nms, 0.3));
  }

  #[test]
  fn overlap_at_threshold_is_not_suppressed() {
    // IoU = 50 / 150 = 1/3
    let boxes = vec![
      item(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.8, [5.0, 0.0, 15.0, 10.0]),
    ];
    let iou = boxes[0].iou(&boxes[1]);
    assert_eq!(nms(&boxes, iou, NmsMethod::Nms, 0.3).len(), 2);
    assert_eq!(nms(&boxes, iou - 1e-3, NmsMethod::Nms, 0.3).len(), 1);
  }

  #[test]
  fn soft_nms_decays_instead_of_dropping() {
    let boxes = vec![
      item(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.8, [1.0, 1.0, 11.0, 11.0]),
    ];
    let iou = boxes[0].iou(&boxes[1]);
    let kept = nms(&boxes, 0.5, NmsMethod::SoftNms, 0.3);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0], boxes[0]);
    assert_eq!(kept[1].bbox, boxes[1].bbox);
    let expected = 0.8 * (-(iou * iou) / 0.3).exp();
    assert!((kept[1].score - expected).abs() < 1e-6);
    assert!(kept[1].score < boxes[1].score);
  }

  #[test]
  fn soft_nms_selects_until_empty() {
    let boxes: Vec<DetectItem> = (0..20)
      .map(|i| item(0, 0.9 - i as f32 * 0.01, [0.0, 0.0, 10.0, 10.0]))
      .collect();
    // 完全重叠的框分数被衰减但不会为 0，全部被依次选出
    let kept = nms(&boxes, 0.5, NmsMethod::SoftNms, 0.3);
    assert_eq!(kept.len(), 20);
    assert_eq!(nms(&boxes, 0.5, NmsMethod::Nms, 0.3).len(), 1);
  }

  #[test]
  fn empty_input_gives_empty_output() {
    assert!(nms(&[], 0.5, NmsMethod::Nms, 0.3).is_empty());
  }

  #[test]
  fn top_k_keeps_highest_scores() {
    let boxes = vec![
      item(0, 0.1, [0.0, 0.0, 1.0, 1.0]),
      item(1, 0.9, [0.0, 0.0, 1.0, 1.0]),
      item(2, 0.5, [0.0, 0.0, 1.0, 1.0]),
    ];
    let top = top_k(boxes.clone(), 2);
    assert_eq!(top, vec![boxes[1], boxes[2]]);
    assert_eq!(top_k(boxes.clone(), 5), boxes);
  }
}
