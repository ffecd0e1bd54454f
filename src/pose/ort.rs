use std::{
    path::Path,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{DeviceHint, PoseEstimator, letterbox};
use crate::types::{Frame, KeypointIndex, KeypointSet};

/// Features per person in the multi-person output: 17 (y, x, score) triples plus a box.
const MULTIPOSE_FEATURES: usize = KeypointIndex::COUNT * 3 + 5;

#[derive(Clone, Debug)]
pub struct OrtPoseEstimatorConfig {
    pub input_size: u32,
    pub intra_threads: usize,
    pub min_person_score: f32,
}

impl Default for OrtPoseEstimatorConfig {
    fn default() -> Self {
        Self {
            input_size: 192,
            intra_threads: 2,
            min_person_score: 0.2,
        }
    }
}

/// ONNX Runtime backed COCO-17 estimator (MoveNet single- and multi-pose layouts).
///
/// One session per execution stream; `infer` takes the next session round-robin.
pub struct OrtPoseEstimator {
    sessions: Vec<Mutex<Session>>,
    next: AtomicUsize,
    cfg: OrtPoseEstimatorConfig,
}

impl OrtPoseEstimator {
    pub fn new(model_path: &Path, device: DeviceHint, cfg: OrtPoseEstimatorConfig) -> Result<Self> {
        let mut sessions = Vec::with_capacity(device.streams());
        for _ in 0..device.streams() {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(cfg.intra_threads)?
                .commit_from_file(model_path)
                .with_context(|| {
                    format!("failed to load ORT session from {}", model_path.display())
                })?;
            sessions.push(Mutex::new(session));
        }

        log::info!(
            "pose ORT backend ready using {} ({} stream(s), input {}px)",
            model_path.display(),
            sessions.len(),
            cfg.input_size
        );

        Ok(Self {
            sessions,
            next: AtomicUsize::new(0),
            cfg,
        })
    }
}

impl PoseEstimator for OrtPoseEstimator {
    fn infer(&self, frame: &Frame) -> Result<Vec<KeypointSet>> {
        let (input, letterbox) = letterbox::prepare_frame_with_size(frame, self.cfg.input_size)?;
        let tensor = Tensor::from_array(input)?;

        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[slot]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![tensor])
            .context("failed to run pose session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("pose model returned no outputs"));
        }

        let raw = outputs[0].try_extract_array::<f32>()?;
        let shape = raw.shape().to_vec();
        let flat: Vec<f32> = raw.iter().copied().collect();
        drop(outputs);

        let feature_dim = shape.last().copied().unwrap_or(0);
        if feature_dim == MULTIPOSE_FEATURES {
            let mut people: Vec<(f32, KeypointSet)> = Vec::new();
            for person in flat.chunks_exact(MULTIPOSE_FEATURES) {
                let score = person[MULTIPOSE_FEATURES - 1];
                if score < self.cfg.min_person_score {
                    continue;
                }
                people.push((score, letterbox::decode_person(person, &letterbox)?));
            }
            people.sort_by(|a, b| b.0.total_cmp(&a.0));
            return Ok(people.into_iter().map(|(_, set)| set).collect());
        }

        Ok(vec![letterbox::decode_person(&flat, &letterbox)?])
    }

    fn parallel_streams(&self) -> usize {
        self.sessions.len()
    }

    fn label(&self) -> &str {
        "ort"
    }
}
