//! Fixed-topology graph construction.
//!
//! The pipeline DAG is built once, parameterized by the calibration model,
//! and never reshaped afterwards. Stages live in an arena owned by the
//! graph; children are indices into it. This is the only module that names
//! concrete stage kinds and kernels together.

use std::sync::Arc;

use crate::calib::{CalibPair, CalibrationModel};
use crate::kernels::{
    DepthKernel, DisparityKernel, DisparityMethod, DisparityNormKernel, Kernel, PointsKernel,
    RectifyKernel,
};
use crate::stream::{Mode, Stream};

use super::payload::PairSide;
use super::stage::{Stage, StageId, StageKind, TargetStream};

// Rate divisors; 0 processes every frame.
const ROOT_PERIOD: u32 = 0;
const RECTIFY_PERIOD: u32 = 0;
const DISPARITY_PERIOD: u32 = 0;
const DISPARITY_NORM_PERIOD: u32 = 0;
const POINTS_PERIOD: u32 = 0;
const DEPTH_PERIOD: u32 = 0;

/// Arena indices of the named stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphIds {
    pub root: StageId,
    pub rectify: StageId,
    pub disparity: StageId,
    pub disparity_norm: StageId,
    pub points: StageId,
    pub depth: StageId,
}

/// The stage arena plus everything derived from the (fixed) topology.
pub struct Graph {
    pub(crate) stages: Vec<Arc<Stage>>,
    pub(crate) ids: GraphIds,
    /// Reverse edges, derived from the child lists.
    pub(crate) parents: Vec<Vec<StageId>>,
    /// Leaves-first order; teardown deactivates children before parents.
    pub(crate) teardown: Vec<StageId>,
    pub(crate) model: CalibrationModel,
}

impl Graph {
    pub fn stage(&self, id: StageId) -> &Arc<Stage> {
        &self.stages[id]
    }

    pub fn stages(&self) -> &[Arc<Stage>] {
        &self.stages
    }

    pub fn ids(&self) -> GraphIds {
        self.ids
    }

    pub fn model(&self) -> CalibrationModel {
        self.model
    }

    /// Deactivate every stage, children before parents, waiting for each
    /// worker to drain.
    pub(crate) fn deactivate_all(&self) {
        for &id in &self.teardown {
            self.stage(id).deactivate(true);
        }
    }

    /// Wrap fully-constructed stages into a shared graph, deriving the
    /// reverse edges and teardown order.
    pub(crate) fn assemble(stages: Vec<Stage>, ids: GraphIds, model: CalibrationModel) -> Arc<Graph> {
        let stages: Vec<Arc<Stage>> = stages.into_iter().map(Arc::new).collect();
        let mut parents = vec![Vec::new(); stages.len()];
        for (id, stage) in stages.iter().enumerate() {
            for &child in &stage.children {
                parents[child].push(id);
            }
        }
        let mut teardown = Vec::with_capacity(stages.len());
        let mut visited = vec![false; stages.len()];
        for id in 0..stages.len() {
            post_order(id, &stages, &mut visited, &mut teardown);
        }
        Arc::new(Graph {
            stages,
            ids,
            parents,
            teardown,
            model,
        })
    }
}

fn post_order(id: StageId, stages: &[Arc<Stage>], visited: &mut [bool], out: &mut Vec<StageId>) {
    if visited[id] {
        return;
    }
    visited[id] = true;
    for &child in &stages[id].children {
        post_order(child, stages, visited, out);
    }
    out.push(id);
}

/// Build the pipeline DAG for the given calibration model.
///
/// Unknown models fall back to the pinhole shape with a logged warning; the
/// caller is responsible for tracking that defaults are in use.
pub fn build(model: CalibrationModel, pair: CalibPair) -> Arc<Graph> {
    let model = match model {
        CalibrationModel::Unknown => {
            tracing::warn!("unknown calibration model, building pinhole pipeline");
            CalibrationModel::Pinhole
        }
        m => m,
    };

    let rectify_kernel = RectifyKernel::new(pair);
    let q = rectify_kernel.q;
    let points_kernel = match model {
        CalibrationModel::KannalaBrandt => PointsKernel::KannalaBrandt { pair },
        _ => PointsKernel::Pinhole { q },
    };
    let depth_kernel = match model {
        CalibrationModel::KannalaBrandt => DepthKernel::KannalaBrandt { pair },
        _ => DepthKernel::Pinhole,
    };

    let ids = GraphIds {
        root: 0,
        rectify: 1,
        disparity: 2,
        disparity_norm: 3,
        points: 4,
        depth: 5,
    };

    let mut root = Stage::new(StageKind::Root, ROOT_PERIOD, Kernel::Root);
    let mut rectify = Stage::new(
        StageKind::Rectify,
        RECTIFY_PERIOD,
        Kernel::Rectify(rectify_kernel),
    );
    let mut disparity = Stage::new(
        StageKind::Disparity,
        DISPARITY_PERIOD,
        Kernel::Disparity(DisparityKernel::new(DisparityMethod::Sgbm)),
    );
    let disparity_norm = Stage::new(
        StageKind::DisparityNormalized,
        DISPARITY_NORM_PERIOD,
        Kernel::DisparityNorm(DisparityNormKernel),
    );
    let mut points = Stage::new(StageKind::Points, POINTS_PERIOD, Kernel::Points(points_kernel));
    let mut depth = Stage::new(StageKind::Depth, DEPTH_PERIOD, Kernel::Depth(depth_kernel));

    root.add_child(ids.rectify);
    rectify.add_child(ids.disparity);
    disparity.add_child(ids.disparity_norm);
    match model {
        CalibrationModel::KannalaBrandt => {
            disparity.add_child(ids.depth);
            depth.add_child(ids.points);
        }
        _ => {
            disparity.add_child(ids.points);
            points.add_child(ids.depth);
        }
    }

    root.add_target_stream(TargetStream::new(
        Stream::Left,
        Mode::Native,
        Mode::Native,
        Some(PairSide::Left),
    ));
    root.add_target_stream(TargetStream::new(
        Stream::Right,
        Mode::Native,
        Mode::Native,
        Some(PairSide::Right),
    ));
    rectify.add_target_stream(TargetStream::new(
        Stream::LeftRectified,
        Mode::None,
        Mode::None,
        Some(PairSide::Left),
    ));
    rectify.add_target_stream(TargetStream::new(
        Stream::RightRectified,
        Mode::None,
        Mode::None,
        Some(PairSide::Right),
    ));
    disparity.add_target_stream(TargetStream::new(Stream::Disparity, Mode::None, Mode::None, None));
    disparity_norm.add_target_stream(TargetStream::new(
        Stream::DisparityNormalized,
        Mode::None,
        Mode::None,
        None,
    ));
    points.add_target_stream(TargetStream::new(Stream::Points, Mode::None, Mode::None, None));
    depth.add_target_stream(TargetStream::new(Stream::Depth, Mode::None, Mode::None, None));

    Graph::assemble(
        vec![root, rectify, disparity, disparity_norm, points, depth],
        ids,
        model,
    )
}
