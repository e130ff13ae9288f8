//! Mask annotations and the mask geometry used to filter them

use ndarray::{Array2, ArrayView2, Axis};

/// One generated mask and the record describing it
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Binary mask, `(height, width)` of the source image
    pub segmentation: Array2<bool>,
    /// Number of true pixels
    pub area: u64,
    /// Bounding box, XYWH in pixels
    pub bbox: [f32; 4],
    pub predicted_iou: f32,
    pub stability_score: f32,
    /// Prompt that produced the mask, `(x, y)` in the image frame
    pub point_coords: [f32; 2],
    /// Region the prompt grid covered, XYWH
    pub crop_box: [f32; 4],
}

impl Annotation {
    /// Build an annotation from a binary mask; `None` when the mask is empty
    pub fn from_mask(
        segmentation: Array2<bool>,
        predicted_iou: f32,
        stability_score: f32,
        point_coords: [f32; 2],
    ) -> Option<Self> {
        let bbox = mask_bbox(segmentation.view())?;
        let area = mask_area(segmentation.view());
        let (height, width) = segmentation.dim();
        Some(Self {
            segmentation,
            area,
            bbox,
            predicted_iou,
            stability_score,
            point_coords,
            crop_box: [0.0, 0.0, width as f32, height as f32],
        })
    }

    pub fn height(&self) -> usize {
        self.segmentation.nrows()
    }

    pub fn width(&self) -> usize {
        self.segmentation.ncols()
    }
}

pub fn mask_area(mask: ArrayView2<'_, bool>) -> u64 {
    mask.iter().filter(|v| **v).count() as u64
}

/// Tight box around the true pixels, XYWH with an inclusive far edge
/// (a single pixel has zero width). `None` for an empty mask.
pub fn mask_bbox(mask: ArrayView2<'_, bool>) -> Option<[f32; 4]> {
    let rows: Vec<usize> = mask
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().any(|v| *v))
        .map(|(y, _)| y)
        .collect();
    let (&y0, &y1) = (rows.first()?, rows.last()?);

    let cols: Vec<usize> = mask
        .axis_iter(Axis(1))
        .enumerate()
        .filter(|(_, col)| col.iter().any(|v| *v))
        .map(|(x, _)| x)
        .collect();
    let (&x0, &x1) = (cols.first()?, cols.last()?);

    Some([x0 as f32, y0 as f32, (x1 - x0) as f32, (y1 - y0) as f32])
}

/// Agreement of a mask's logits under a shifted binarisation threshold.
///
/// Ratio of pixels above `threshold + offset` to pixels above
/// `threshold - offset`; zero when nothing passes the lower threshold.
pub fn stability_score<'a, I>(logits: I, threshold: f32, offset: f32) -> f32
where
    I: IntoIterator<Item = &'a f32>,
{
    let high = threshold + offset;
    let low = threshold - offset;
    let (intersections, unions) = logits.into_iter().fold((0u64, 0u64), |(i, u), &v| {
        (i + (v > high) as u64, u + (v > low) as u64)
    });
    if unions == 0 {
        0.0
    } else {
        intersections as f32 / unions as f32
    }
}

/// Intersection over union of two XYWH boxes
pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return 0.0;
    }
    let [x1, y1, w1, h1] = *a;
    let [x2, y2, w2, h2] = *b;
    if w1 < 0.0 || h1 < 0.0 || w2 < 0.0 || h2 < 0.0 {
        return 0.0;
    }

    let inter_x_min = x1.max(x2);
    let inter_y_min = y1.max(y2);
    let inter_x_max = (x1 + w1).min(x2 + w2);
    let inter_y_max = (y1 + h1).min(y2 + h2);

    if inter_x_max <= inter_x_min || inter_y_max <= inter_y_min {
        return 0.0;
    }

    let inter_area = (inter_x_max - inter_x_min) * (inter_y_max - inter_y_min);
    let union_area = w1 * h1 + w2 * h2 - inter_area;
    if union_area <= 0.0 || !union_area.is_finite() {
        return 0.0;
    }
    (inter_area / union_area).clamp(0.0, 1.0)
}

/// Greedy box non-maximum suppression scored by predicted IoU.
///
/// Survivors come back in descending score order.
pub fn non_max_suppression(mut annotations: Vec<Annotation>, iou_thresh: f32) -> Vec<Annotation> {
    annotations.sort_by(|a, b| b.predicted_iou.total_cmp(&a.predicted_iou));

    let mut kept: Vec<Annotation> = Vec::with_capacity(annotations.len());
    for candidate in annotations {
        if kept.iter().all(|k| box_iou(&k.bbox, &candidate.bbox) <= iou_thresh) {
            kept.push(candidate);
        }
    }
    kept
}
