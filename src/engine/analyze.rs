use crate::error::{EngineError, Result};
use crate::registry::model::{l2_normalize, EMBEDDING_DIM};
use image::RgbImage;
use ndarray::{Array, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// Detections below this score are discarded.
pub const MIN_DETECTION_SCORE: f32 = 0.5;
/// IoU threshold for non-maximum suppression.
const NMS_IOU: f32 = 0.4;
/// Detector input is padded to a multiple of the coarsest stride grid.
const DET_ALIGN: u32 = 32;
/// Longest detector input side; larger images are scaled down first.
const DET_MAX_SIDE: u32 = 640;
/// Embedder input resolution (ArcFace-standard crop).
const EMBED_SIDE: u32 = 112;

/// One detected face with its recognition embedding.
#[derive(Debug, Clone)]
pub struct Face {
    /// [x1, y1, x2, y2] in source-image pixel coordinates.
    pub bbox: [f32; 4],
    pub score: f32,
    /// L2-normalised, EMBEDDING_DIM long.
    pub embedding: Vec<f32>,
}

/// Seam between the engine and the inference stack. The production
/// implementation runs ONNX models; tests substitute scripted analyzers.
pub trait FaceAnalysis: Send {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<Face>>;
}

/// YuNet-style detector + 512-dim embedder, both CPU-only ONNX sessions
/// loaded once per worker process.
pub struct OnnxFaceAnalyzer {
    detector: Session,
    embedder: Session,
}

impl OnnxFaceAnalyzer {
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self> {
        let detector = Self::build_session(detector_path)?;
        let embedder = Self::build_session(embedder_path)?;
        tracing::info!(
            "analyze: models loaded ({:?}, {:?})",
            detector_path,
            embedder_path
        );
        Ok(Self { detector, embedder })
    }

    fn build_session(path: &Path) -> Result<Session> {
        if !path.is_file() {
            return Err(EngineError::Model(format!("model file {:?} not found", path)));
        }
        Session::builder()
            .and_then(|b| b.with_intra_threads(crate::engine::util::capped_num_threads()))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| EngineError::Model(format!("cannot load {:?}: {}", path, e)))
    }

    /// Run YuNet detection on a BGR 0-255 tensor of shape (1, 3, H, W).
    ///
    /// The model emits 12 tensors across 3 FPN strides (8, 16, 32):
    ///   cls_*  classification scores (1, N, 1)
    ///   obj_*  objectness scores     (1, N, 1)
    ///   bbox_* box offsets           (1, N, 4) [cx, cy, w, h] in stride units
    ///   kps_*  landmark offsets      (1, N, 10), unused here
    /// Decoded score = cls * obj; boxes decode from the anchor grid centre.
    fn detect(&mut self, input: &Array4<f32>) -> Result<Vec<Detection>> {
        let img_h = input.shape()[2] as f32;
        let img_w = input.shape()[3] as f32;

        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| EngineError::Model(format!("detector input: {}", e)))?;
        let inputs = ort::inputs!["input" => input_tensor];
        let outputs = self
            .detector
            .run(inputs)
            .map_err(|e| EngineError::Model(format!("detector inference: {}", e)))?;

        let mut detections = Vec::new();
        for stride in [8usize, 16, 32] {
            let cls = outputs[format!("cls_{}", stride).as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| EngineError::Model(format!("detector output cls_{}: {}", stride, e)))?;
            let obj = outputs[format!("obj_{}", stride).as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| EngineError::Model(format!("detector output obj_{}: {}", stride, e)))?;
            let bbox = outputs[format!("bbox_{}", stride).as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| EngineError::Model(format!("detector output bbox_{}: {}", stride, e)))?;

            let stride_f = stride as f32;
            let feat_w = (img_w / stride_f) as usize;
            let n = cls.shape()[1];

            for i in 0..n {
                let score = cls[[0, i, 0]] * obj[[0, i, 0]];
                if score < MIN_DETECTION_SCORE {
                    continue;
                }

                let row = i / feat_w;
                let col = i % feat_w;
                let anchor_cx = (col as f32 + 0.5) * stride_f;
                let anchor_cy = (row as f32 + 0.5) * stride_f;

                let cx = anchor_cx + bbox[[0, i, 0]] * stride_f;
                let cy = anchor_cy + bbox[[0, i, 1]] * stride_f;
                let w = bbox[[0, i, 2]] * stride_f;
                let h = bbox[[0, i, 3]] * stride_f;

                detections.push(Detection {
                    bbox: [
                        (cx - w / 2.0).clamp(0.0, img_w),
                        (cy - h / 2.0).clamp(0.0, img_h),
                        (cx + w / 2.0).clamp(0.0, img_w),
                        (cy + h / 2.0).clamp(0.0, img_h),
                    ],
                    score,
                });
            }
        }

        Ok(apply_nms(detections, NMS_IOU))
    }

    /// Run the embedder on one 112x112 face crop. Input "data" is
    /// (1, 3, 112, 112) normalised to [-1, 1]; output "fc1" is (1, 512).
    fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>> {
        let mut tensor = Array::zeros((1usize, 3usize, EMBED_SIDE as usize, EMBED_SIDE as usize));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - 127.5) / 128.0;
            }
        }

        let data_tensor = TensorRef::from_array_view(tensor.view())
            .map_err(|e| EngineError::Model(format!("embedder input: {}", e)))?;
        let inputs = ort::inputs!["data" => data_tensor];
        let outputs = self
            .embedder
            .run(inputs)
            .map_err(|e| EngineError::Model(format!("embedder inference: {}", e)))?;

        let embedding = outputs["fc1"]
            .try_extract_array::<f32>()
            .map_err(|e| EngineError::Model(format!("embedder output: {}", e)))?;

        let mut vector: Vec<f32> = embedding.iter().copied().collect();
        if vector.len() != EMBEDDING_DIM {
            return Err(EngineError::Model(format!(
                "embedder produced {} dims, expected {}",
                vector.len(),
                EMBEDDING_DIM
            )));
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

impl FaceAnalysis for OnnxFaceAnalyzer {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<Face>> {
        let (scale, tensor) = prepare_detector_input(image);
        let detections = self.detect(&tensor)?;

        let mut faces = Vec::with_capacity(detections.len());
        for det in detections {
            // Map back to source coordinates, then crop with a small margin.
            let bbox = [
                det.bbox[0] / scale,
                det.bbox[1] / scale,
                det.bbox[2] / scale,
                det.bbox[3] / scale,
            ];
            let crop = crop_face(image, bbox);
            let embedding = self.embed(&crop)?;
            faces.push(Face {
                bbox,
                score: det.score,
                embedding,
            });
        }
        Ok(faces)
    }
}

#[derive(Debug, Clone)]
struct Detection {
    bbox: [f32; 4],
    score: f32,
}

/// Scale the image down to fit DET_MAX_SIDE, pad to a DET_ALIGN multiple,
/// and emit a BGR 0-255 tensor of shape (1, 3, H, W). Returns the applied
/// scale factor (detector coords = source coords * scale).
fn prepare_detector_input(image: &RgbImage) -> (f32, Array4<f32>) {
    let (w, h) = (image.width(), image.height());
    let long_edge = w.max(h).max(1);
    let scale = if long_edge > DET_MAX_SIDE {
        DET_MAX_SIDE as f32 / long_edge as f32
    } else {
        1.0
    };

    let scaled_w = ((w as f32 * scale).round() as u32).max(1);
    let scaled_h = ((h as f32 * scale).round() as u32).max(1);
    let scaled = if scale < 1.0 {
        image::imageops::resize(image, scaled_w, scaled_h, image::imageops::FilterType::Triangle)
    } else {
        image.clone()
    };

    let pad_w = scaled_w.div_ceil(DET_ALIGN) * DET_ALIGN;
    let pad_h = scaled_h.div_ceil(DET_ALIGN) * DET_ALIGN;

    let mut tensor = Array::zeros((1usize, 3usize, pad_h as usize, pad_w as usize));
    for (x, y, pixel) in scaled.enumerate_pixels() {
        // RGB source -> BGR tensor, matching the detector's training input.
        tensor[[0, 0, y as usize, x as usize]] = pixel.0[2] as f32;
        tensor[[0, 1, y as usize, x as usize]] = pixel.0[1] as f32;
        tensor[[0, 2, y as usize, x as usize]] = pixel.0[0] as f32;
    }

    (scale, tensor)
}

/// Crop a detection with 12% margin and resize to the embedder input size.
fn crop_face(image: &RgbImage, bbox: [f32; 4]) -> RgbImage {
    let (img_w, img_h) = (image.width() as f32, image.height() as f32);
    let bw = (bbox[2] - bbox[0]).max(1.0);
    let bh = (bbox[3] - bbox[1]).max(1.0);
    let margin_x = bw * 0.12;
    let margin_y = bh * 0.12;

    let x1 = (bbox[0] - margin_x).clamp(0.0, img_w - 1.0) as u32;
    let y1 = (bbox[1] - margin_y).clamp(0.0, img_h - 1.0) as u32;
    let x2 = (bbox[2] + margin_x).clamp(1.0, img_w) as u32;
    let y2 = (bbox[3] + margin_y).clamp(1.0, img_h) as u32;

    let cropped = image::imageops::crop_imm(image, x1, y1, (x2 - x1).max(1), (y2 - y1).max(1));
    image::imageops::resize(
        &cropped.to_image(),
        EMBED_SIDE,
        EMBED_SIDE,
        image::imageops::FilterType::Triangle,
    )
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    if inter <= 0.0 {
        return 0.0;
    }
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    inter / (area_a + area_b - inter)
}

/// Greedy non-maximum suppression, highest score first.
fn apply_nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<Detection> = Vec::new();
    for det in detections {
        if kept.iter().all(|k| iou(&k.bbox, &det.bbox) < iou_threshold) {
            kept.push(det);
        }
    }
    kept
}
