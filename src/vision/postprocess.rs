//! Post-processing of PaddleOCR model outputs
//!
//! Turns the detection probability map into quadrilateral text boxes (DB
//! post-processing) and recognition logits into strings (greedy CTC).

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::geometry::min_area_rect;
use imageproc::morphology::dilate;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Parameters for turning a probability map into boxes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbParams {
    /// Pixel threshold for the binary text mask
    pub thresh: f32,
    /// Minimum mean probability inside a box
    pub box_thresh: f32,
    /// How far boxes are grown, relative to area / perimeter
    pub unclip_ratio: f32,
    /// Upper bound on contours examined per image
    pub max_candidates: usize,
    /// Dilate the mask before tracing contours
    pub use_dilation: bool,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            thresh: 0.3,
            box_thresh: 0.6,
            unclip_ratio: 1.5,
            max_candidates: 1000,
            use_dilation: true,
        }
    }
}

/// Boxes shorter than this on either side are dropped
const MIN_BOX_SIDE: f32 = 3.0;

/// Boxes whose tops are within this many pixels count as the same line
const SAME_LINE_TOLERANCE: f32 = 10.0;

/// A detected text quadrilateral in source image coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct TextBox {
    /// Corners clockwise from top-left
    pub points: [(f32, f32); 4],
    /// Mean text probability inside the box
    pub score: f32,
}

/// Extract text boxes from a `[H, W]` probability map
///
/// `source` is the (width, height) of the original image; box coordinates are
/// scaled back to it and clamped to its bounds.
pub fn boxes_from_bitmap(pred: ArrayView2<f32>, source: (u32, u32), params: &DbParams) -> Vec<TextBox> {
    let (height, width) = pred.dim();
    if height == 0 || width == 0 {
        return vec![];
    }
    let (src_w, src_h) = source;
    let scale_x = src_w as f32 / width as f32;
    let scale_y = src_h as f32 / height as f32;

    let mut mask = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        if pred[[y as usize, x as usize]] > params.thresh {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });
    if params.use_dilation {
        mask = dilate(&mask, Norm::LInf, 1);
    }

    let mut boxes = Vec::new();

    for contour in find_contours::<i32>(&mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .take(params.max_candidates)
    {
        if contour.points.len() < 4 {
            continue;
        }

        let rect = order_points(min_area_rect(&contour.points).map(|p| (p.x as f32, p.y as f32)));
        if min_side(&rect) < MIN_BOX_SIDE {
            continue;
        }

        let score = box_score_fast(&pred, &rect);
        if score < params.box_thresh {
            continue;
        }

        let expanded = unclip(&rect, params.unclip_ratio);
        if min_side(&expanded) < MIN_BOX_SIDE + 2.0 {
            continue;
        }

        let points = expanded.map(|(x, y)| {
            (
                (x * scale_x).round().clamp(0.0, src_w as f32),
                (y * scale_y).round().clamp(0.0, src_h as f32),
            )
        });

        let rect_w = distance(points[0], points[1]);
        let rect_h = distance(points[0], points[3]);
        if rect_w <= MIN_BOX_SIDE || rect_h <= MIN_BOX_SIDE {
            continue;
        }

        boxes.push(TextBox { points, score });
    }

    sort_boxes(boxes)
}

/// Order four corners clockwise starting at the top-left
pub fn order_points(mut points: [(f32, f32); 4]) -> [(f32, f32); 4] {
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let (mut tl, mut bl) = (points[0], points[1]);
    if bl.1 < tl.1 {
        std::mem::swap(&mut tl, &mut bl);
    }
    let (mut tr, mut br) = (points[2], points[3]);
    if br.1 < tr.1 {
        std::mem::swap(&mut tr, &mut br);
    }

    [tl, tr, br, bl]
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

fn min_side(rect: &[(f32, f32); 4]) -> f32 {
    distance(rect[0], rect[1]).min(distance(rect[0], rect[3]))
}

/// Mean probability over the box's axis-aligned bounds
fn box_score_fast(pred: &ArrayView2<f32>, rect: &[(f32, f32); 4]) -> f32 {
    let (height, width) = pred.dim();

    let clamp_x = |v: f32| (v.max(0.0) as usize).min(width - 1);
    let clamp_y = |v: f32| (v.max(0.0) as usize).min(height - 1);

    let xmin = clamp_x(rect.iter().map(|p| p.0).fold(f32::INFINITY, f32::min).floor());
    let xmax = clamp_x(rect.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max).ceil());
    let ymin = clamp_y(rect.iter().map(|p| p.1).fold(f32::INFINITY, f32::min).floor());
    let ymax = clamp_y(rect.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max).ceil());

    let region = pred.slice(ndarray::s![ymin..=ymax, xmin..=xmax]);
    region.mean().unwrap_or(0.0)
}

/// Grow a rectangle outward by `area * ratio / perimeter` on every side
pub fn unclip(rect: &[(f32, f32); 4], ratio: f32) -> [(f32, f32); 4] {
    let w = distance(rect[0], rect[1]);
    let h = distance(rect[0], rect[3]);
    let perimeter = 2.0 * (w + h);
    if perimeter <= 0.0 || w <= 0.0 || h <= 0.0 {
        return *rect;
    }
    let offset = w * h * ratio / perimeter;

    // Unit vectors along the top edge and down the left edge
    let u = ((rect[1].0 - rect[0].0) / w, (rect[1].1 - rect[0].1) / w);
    let v = ((rect[3].0 - rect[0].0) / h, (rect[3].1 - rect[0].1) / h);

    let cx = rect.iter().map(|p| p.0).sum::<f32>() / 4.0;
    let cy = rect.iter().map(|p| p.1).sum::<f32>() / 4.0;
    let hw = w / 2.0 + offset;
    let hh = h / 2.0 + offset;

    let corner = |su: f32, sv: f32| {
        (
            cx + su * hw * u.0 + sv * hh * v.0,
            cy + su * hw * u.1 + sv * hh * v.1,
        )
    };

    [corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0)]
}

/// Sort boxes top-to-bottom, then left-to-right within a line
pub fn sort_boxes(mut boxes: Vec<TextBox>) -> Vec<TextBox> {
    boxes.sort_by(|a, b| {
        a.points[0]
            .1
            .total_cmp(&b.points[0].1)
            .then(a.points[0].0.total_cmp(&b.points[0].0))
    });

    for i in 0..boxes.len().saturating_sub(1) {
        for j in (0..=i).rev() {
            let same_line = (boxes[j + 1].points[0].1 - boxes[j].points[0].1).abs() < SAME_LINE_TOLERANCE;
            if same_line && boxes[j + 1].points[0].0 < boxes[j].points[0].0 {
                boxes.swap(j, j + 1);
            } else {
                break;
            }
        }
    }

    boxes
}

/// Build the CTC label list from a dictionary file's contents
///
/// Index 0 is the CTC blank; a space token is appended at the end.
pub fn load_character_dict(contents: &str) -> Vec<String> {
    let mut characters = vec!["blank".to_string()];
    characters.extend(
        contents
            .lines()
            .map(|line| line.trim_end_matches(['\r', '\n']))
            .filter(|line| !line.is_empty())
            .map(String::from),
    );
    characters.push(" ".to_string());
    characters
}

/// Greedy CTC decode of a `[T, C]` probability sequence
///
/// Returns the text and the mean probability of the kept characters
/// (0.0 when nothing was decoded).
pub fn ctc_decode(preds: ArrayView2<f32>, characters: &[String]) -> (String, f32) {
    const BLANK: usize = 0;

    let best: Vec<(usize, f32)> = preds
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map_or((BLANK, 0.0), |(idx, &prob)| (idx, prob))
        })
        .collect();

    let mut text = String::new();
    let mut probs = Vec::new();

    for (i, &(idx, prob)) in best.iter().enumerate() {
        let repeated = i > 0 && best[i - 1].0 == idx;
        if idx == BLANK || repeated {
            continue;
        }
        if let Some(ch) = characters.get(idx) {
            text.push_str(ch);
            probs.push(prob);
        }
    }

    if probs.is_empty() {
        return (String::new(), 0.0);
    }

    let confidence = probs.iter().sum::<f32>() / probs.len() as f32;
    (text.trim().to_string(), confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn map_with_block(width: usize, height: usize, x0: usize, y0: usize, x1: usize, y1: usize) -> Array2<f32> {
        Array2::from_shape_fn((height, width), |(y, x)| {
            if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
                0.9
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_empty_map_has_no_boxes() {
        let pred = Array2::<f32>::zeros((64, 64));
        let boxes = boxes_from_bitmap(pred.view(), (64, 64), &DbParams::default());
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_single_block_becomes_one_box() {
        let pred = map_with_block(96, 64, 20, 20, 60, 36);

        let boxes = boxes_from_bitmap(pred.view(), (96, 64), &DbParams::default());

        assert_eq!(boxes.len(), 1);
        let text_box = &boxes[0];
        assert!(text_box.score > 0.6);

        // Unclipping grows the box past the thresholded block
        let [tl, tr, br, bl] = text_box.points;
        assert!(tl.0 < 20.0 && tl.1 < 20.0);
        assert!(br.0 > 59.0 && br.1 > 35.0);
        assert!(tr.0 > tl.0 && bl.1 > tl.1);
    }

    #[test]
    fn test_boxes_scale_to_source_size() {
        let pred = map_with_block(96, 64, 20, 20, 60, 36);

        let boxes = boxes_from_bitmap(pred.view(), (192, 128), &DbParams::default());

        assert_eq!(boxes.len(), 1);
        let [tl, _, br, _] = boxes[0].points;
        assert!(tl.0 < 40.0 && br.0 > 118.0);
        assert!(br.0 <= 192.0 && br.1 <= 128.0);
    }

    #[test]
    fn test_tiny_specks_are_dropped() {
        let pred = map_with_block(64, 64, 10, 10, 12, 12);
        let params = DbParams {
            use_dilation: false,
            ..Default::default()
        };
        assert!(boxes_from_bitmap(pred.view(), (64, 64), &params).is_empty());
    }

    #[test]
    fn test_low_score_boxes_are_dropped() {
        let pred = Array2::from_shape_fn((64, 96), |(y, x)| {
            if (20..60).contains(&x) && (20..36).contains(&y) {
                0.4
            } else {
                0.0
            }
        });
        assert!(boxes_from_bitmap(pred.view(), (96, 64), &DbParams::default()).is_empty());
    }

    #[test]
    fn test_order_points() {
        let ordered = order_points([(10.0, 30.0), (50.0, 10.0), (10.0, 10.0), (50.0, 30.0)]);
        assert_eq!(ordered, [(10.0, 10.0), (50.0, 10.0), (50.0, 30.0), (10.0, 30.0)]);
    }

    #[test]
    fn test_unclip_grows_every_side() {
        let rect = [(10.0, 10.0), (50.0, 10.0), (50.0, 30.0), (10.0, 30.0)];
        // area 800, perimeter 120, ratio 1.5 -> offset 10
        let grown = unclip(&rect, 1.5);

        let expected = [(0.0, 0.0), (60.0, 0.0), (60.0, 40.0), (0.0, 40.0)];
        for (g, e) in grown.iter().zip(expected.iter()) {
            assert!((g.0 - e.0).abs() < 1e-3 && (g.1 - e.1).abs() < 1e-3, "{g:?} != {e:?}");
        }
    }

    #[test]
    fn test_sort_boxes_reading_order() {
        let make = |x: f32, y: f32| TextBox {
            points: [(x, y), (x + 10.0, y), (x + 10.0, y + 5.0), (x, y + 5.0)],
            score: 1.0,
        };
        // Second box sits slightly higher but on the same line, to the right
        let sorted = sort_boxes(vec![make(100.0, 50.0), make(60.0, 12.0), make(10.0, 15.0)]);

        let xs: Vec<f32> = sorted.iter().map(|b| b.points[0].0).collect();
        assert_eq!(xs, vec![10.0, 60.0, 100.0]);
    }

    #[test]
    fn test_load_character_dict() {
        let characters = load_character_dict("a\nb\r\nc\n");
        assert_eq!(characters, vec!["blank", "a", "b", "c", " "]);
    }

    #[test]
    fn test_ctc_decode_collapses_repeats_and_blanks() {
        let characters = load_character_dict("H\nE\nL\nO");
        // Sequence: H H blank E L blank L O O
        let sequence = [1, 1, 0, 2, 3, 0, 3, 4, 4];
        let preds = Array2::from_shape_fn((sequence.len(), characters.len()), |(t, c)| {
            if c == sequence[t] {
                0.8
            } else {
                0.01
            }
        });

        let (text, confidence) = ctc_decode(preds.view(), &characters);

        assert_eq!(text, "HELLO");
        assert!((confidence - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_decode_all_blank() {
        let characters = load_character_dict("a");
        let preds = Array2::from_shape_fn((5, characters.len()), |(_, c)| if c == 0 { 0.9 } else { 0.05 });

        assert_eq!(ctc_decode(preds.view(), &characters), (String::new(), 0.0));
    }
}
