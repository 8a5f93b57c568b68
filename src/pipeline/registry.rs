//! Stream registry: per-stream lookup, callbacks, and the enable/disable
//! traversals.
//!
//! Enabling a stream must ensure all upstream producers run, so the enable
//! traversal walks from the owning stage toward the root flipping disabled
//! targets to synthetic. Disabling walks toward the leaves, flipping
//! synthetic targets off. Streams whose enabled mode is native belong to
//! the device and are never touched by either traversal.

use std::sync::Arc;

use crate::stream::{Mode, Stream};

use super::builder::Graph;
use super::stage::{Stage, StageId, StreamCallback};

impl Graph {
    /// Locate the (stage, descriptor-index) producing a stream.
    pub fn locate(&self, stream: Stream) -> Option<(StageId, usize)> {
        for (id, stage) in self.stages.iter().enumerate() {
            if let Some(idx) = stage.targets.lock().iter().position(|t| t.stream == stream) {
                return Some((id, idx));
            }
        }
        None
    }

    pub fn supports(&self, stream: Stream) -> bool {
        self.locate(stream).is_some()
    }

    pub fn supports_mode(&self, stream: Stream) -> Option<Mode> {
        let (id, idx) = self.locate(stream)?;
        Some(self.stage(id).targets.lock()[idx].support_mode)
    }

    pub fn enabled_mode(&self, stream: Stream) -> Option<Mode> {
        let (id, idx) = self.locate(stream)?;
        Some(self.stage(id).targets.lock()[idx].enabled_mode)
    }

    /// Install or clear (with `None`) the per-stream delivery callback.
    pub fn set_callback(&self, stream: Stream, callback: Option<StreamCallback>) -> bool {
        let Some((id, idx)) = self.locate(stream) else {
            tracing::error!("no stage produces stream {stream}");
            return false;
        };
        self.stage(id).targets.lock()[idx].callback = callback;
        true
    }

    pub fn has_callback(&self, stream: Stream) -> bool {
        self.locate(stream)
            .map(|(id, idx)| self.stage(id).targets.lock()[idx].callback.is_some())
            .unwrap_or(false)
    }

    /// Snapshot the callback so it can be invoked without holding any lock.
    pub fn callback(&self, stream: Stream) -> Option<StreamCallback> {
        let (id, idx) = self.locate(stream)?;
        self.stage(id).targets.lock()[idx].callback.clone()
    }

    /// The owning stage plus every ancestor, owner first.
    pub(crate) fn rootward(&self, from: StageId) -> Vec<StageId> {
        let mut order = vec![from];
        let mut i = 0;
        while i < order.len() {
            for &parent in &self.parents[order[i]] {
                if !order.contains(&parent) {
                    order.push(parent);
                }
            }
            i += 1;
        }
        order
    }

    /// The owning stage plus every descendant, owner first.
    pub(crate) fn leafward(&self, from: StageId) -> Vec<StageId> {
        let mut order = vec![from];
        let mut i = 0;
        while i < order.len() {
            for &child in &self.stage(order[i]).children {
                if !order.contains(&child) {
                    order.push(child);
                }
            }
            i += 1;
        }
        order
    }

    /// Enable a stream: flip every disabled target on the owning stage and
    /// its ancestors to synthetic, reporting each flip through `on_change`,
    /// and activate stages that changed. With `dry_run` the flips are
    /// reported but nothing is mutated or activated.
    pub fn enable(
        graph: &Arc<Graph>,
        stream: Stream,
        on_change: &mut dyn FnMut(Stream),
        dry_run: bool,
    ) -> bool {
        let Some((owner, _)) = graph.locate(stream) else {
            tracing::error!("cannot enable {stream}: no stage produces it");
            return false;
        };
        for id in graph.rootward(owner) {
            let stage = graph.stage(id);
            let mut flipped = Vec::new();
            {
                let mut targets = stage.targets.lock();
                for target in targets.iter_mut() {
                    if target.enabled_mode == Mode::None {
                        flipped.push(target.stream);
                        if !dry_run {
                            target.enabled_mode = Mode::Synthetic;
                        }
                    }
                }
            }
            // Callbacks run without the registry lock held.
            for &flipped_stream in &flipped {
                if !dry_run {
                    tracing::debug!("{flipped_stream}: now synthetic");
                }
                on_change(flipped_stream);
            }
            if !dry_run && !flipped.is_empty() && !stage.is_activated() {
                Stage::activate(graph, id);
            }
        }
        true
    }

    /// Disable a stream: flip every synthetic target on the owning stage and
    /// its descendants off; a stage left with no enabled targets is
    /// deactivated.
    pub fn disable(&self, stream: Stream, on_change: &mut dyn FnMut(Stream), dry_run: bool) -> bool {
        let Some((owner, _)) = self.locate(stream) else {
            tracing::error!("cannot disable {stream}: no stage produces it");
            return false;
        };
        for id in self.leafward(owner) {
            let stage = self.stage(id);
            let mut flipped = Vec::new();
            let any_enabled;
            {
                let mut targets = stage.targets.lock();
                for target in targets.iter_mut() {
                    if target.enabled_mode == Mode::Synthetic {
                        flipped.push(target.stream);
                        if !dry_run {
                            target.enabled_mode = Mode::None;
                        }
                    }
                }
                any_enabled = targets.iter().any(|t| t.enabled_mode != Mode::None);
            }
            for &flipped_stream in &flipped {
                if !dry_run {
                    tracing::debug!("{flipped_stream}: disabled");
                }
                on_change(flipped_stream);
            }
            if !dry_run && !flipped.is_empty() && !any_enabled {
                stage.deactivate(false);
            }
        }
        true
    }

    /// Bring worker state in line with the target modes: every stage with an
    /// enabled target runs, everything else does not. Called once after
    /// construction and stream-support initialization.
    pub(crate) fn sync_activation(graph: &Arc<Graph>) {
        for id in 0..graph.stages.len() {
            let stage = graph.stage(id);
            let any_enabled = stage
                .targets
                .lock()
                .iter()
                .any(|t| t.enabled_mode != Mode::None);
            if any_enabled && !stage.is_activated() {
                Stage::activate(graph, id);
            }
        }
    }
}
