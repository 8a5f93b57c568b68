//! Pipeline stage nodes.
//!
//! A stage owns one worker thread fed through a single-slot mailbox. The
//! slot holds at most one pending input; a `submit` while one is pending
//! replaces it (latest-wins), which is the pipeline's backpressure policy
//! for real-time streams. Inside a stage inputs are serialized; across
//! stages the workers give pipeline parallelism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::kernels::Kernel;
use crate::stream::{Mode, Stream, StreamData};

use super::builder::Graph;
use super::payload::{PairSide, Payload};

/// Index of a stage in the graph arena.
pub type StageId = usize;

/// The fixed set of stage kinds. Only the graph builder names these
/// concretely; everything else dispatches through the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Root,
    Rectify,
    Disparity,
    DisparityNormalized,
    Points,
    Depth,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Root => "root",
            StageKind::Rectify => "rectify",
            StageKind::Disparity => "disparity",
            StageKind::DisparityNormalized => "disparity_normalized",
            StageKind::Points => "points",
            StageKind::Depth => "depth",
        }
    }

    /// The stream whose enabled mode gates this stage's built-in compute.
    pub fn primary_stream(&self) -> Option<Stream> {
        match self {
            StageKind::Root => None,
            StageKind::Rectify => Some(Stream::LeftRectified),
            StageKind::Disparity => Some(Stream::Disparity),
            StageKind::DisparityNormalized => Some(Stream::DisparityNormalized),
            StageKind::Points => Some(Stream::Points),
            StageKind::Depth => Some(Stream::Depth),
        }
    }
}

/// Per-stream delivery callback.
pub type StreamCallback = Arc<dyn Fn(&StreamData) + Send + Sync>;

/// One produced stream of a stage.
#[derive(Clone)]
pub struct TargetStream {
    pub stream: Stream,
    /// Fixed after stream-support initialization.
    pub support_mode: Mode,
    /// Mutated by enable/disable.
    pub enabled_mode: Mode,
    /// Which half of a paired output this stream maps to.
    pub side: Option<PairSide>,
    pub callback: Option<StreamCallback>,
}

impl TargetStream {
    pub fn new(stream: Stream, support_mode: Mode, enabled_mode: Mode, side: Option<PairSide>) -> Self {
        Self {
            stream,
            support_mode,
            enabled_mode,
            side,
            callback: None,
        }
    }
}

/// `f(in, out, parent) -> bool`; `true` means the hook satisfied the output
/// and the built-in compute is skipped.
pub type ProcessHook =
    Arc<dyn Fn(&Payload, &mut Option<Payload>, Option<&Stage>) -> bool + Send + Sync>;

/// Invoked after each successful output publication.
pub type PostProcessHook = Arc<dyn Fn(&Payload) + Send + Sync>;

struct MailboxState {
    slot: Option<(Payload, Option<StageId>)>,
    stop: bool,
}

pub struct Stage {
    kind: StageKind,
    /// Rate limit in units of input frames; 0 processes every frame.
    period: u32,
    pub(crate) targets: Arc<Mutex<Vec<TargetStream>>>,
    /// Fixed after construction.
    pub(crate) children: Vec<StageId>,
    kernel: Mutex<Kernel>,
    process_hook: Mutex<Option<ProcessHook>>,
    post_process_hook: Mutex<Option<PostProcessHook>>,
    last_output: Mutex<Option<Payload>>,
    activated: AtomicBool,
    mailbox: Mutex<MailboxState>,
    available: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Stage {
    pub fn new(kind: StageKind, period: u32, kernel: Kernel) -> Self {
        Self {
            kind,
            period,
            targets: Arc::new(Mutex::new(Vec::new())),
            children: Vec::new(),
            kernel: Mutex::new(kernel),
            process_hook: Mutex::new(None),
            post_process_hook: Mutex::new(None),
            last_output: Mutex::new(None),
            activated: AtomicBool::new(false),
            mailbox: Mutex::new(MailboxState {
                slot: None,
                stop: false,
            }),
            available: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Append a child. Topology is fixed after construction, so this is only
    /// available to the builder, before the stage is shared.
    pub(crate) fn add_child(&mut self, child: StageId) {
        self.children.push(child);
    }

    pub(crate) fn add_target_stream(&self, target: TargetStream) {
        self.targets.lock().push(target);
    }

    pub fn set_process_hook(&self, hook: ProcessHook) {
        *self.process_hook.lock() = Some(hook);
    }

    pub fn set_post_process_hook(&self, hook: PostProcessHook) {
        *self.post_process_hook.lock() = Some(hook);
    }

    /// Shared handle to the target descriptors, for hooks that need to read
    /// modes without holding a reference to the stage itself.
    pub(crate) fn targets_handle(&self) -> Arc<Mutex<Vec<TargetStream>>> {
        Arc::clone(&self.targets)
    }

    pub fn enabled_mode_of(&self, stream: Stream) -> Option<Mode> {
        self.targets
            .lock()
            .iter()
            .find(|t| t.stream == stream)
            .map(|t| t.enabled_mode)
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Most recent successfully produced output, if any.
    pub fn last_output(&self) -> Option<Payload> {
        self.last_output.lock().clone()
    }

    pub(crate) fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        f(&mut self.kernel.lock())
    }

    /// Hand a new input to the stage. Returns immediately; if the worker is
    /// busy the newest input replaces any queued one. Inputs arriving while
    /// the stage is deactivated are discarded silently.
    pub fn submit(&self, input: Payload, parent: Option<StageId>) {
        if !self.is_activated() {
            return;
        }
        let mut mailbox = self.mailbox.lock();
        if mailbox.slot.replace((input, parent)).is_some() {
            tracing::trace!("{}: pending input superseded", self.name());
        }
        self.available.notify_one();
    }

    /// Start the stage worker. Idempotent while activated.
    pub fn activate(graph: &Arc<Graph>, id: StageId) {
        let stage = graph.stage(id);
        if stage.activated.swap(true, Ordering::SeqCst) {
            return;
        }
        // A previous no-wait deactivate may have left a finishing worker.
        if let Some(handle) = stage.worker.lock().take() {
            let _ = handle.join();
        }
        stage.mailbox.lock().stop = false;
        tracing::debug!("{}: activated", stage.name());
        let worker_graph = Arc::clone(graph);
        let handle = thread::spawn(move || run_worker(worker_graph, id));
        *stage.worker.lock() = Some(handle);
    }

    /// Stop the worker. With `wait` the mailbox is drained (the pending
    /// input is discarded), any in-flight compute finishes, and the worker
    /// is joined; without it the worker finishes its current compute and
    /// stops on its own.
    pub fn deactivate(&self, wait: bool) {
        if !self.activated.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("{}: deactivated", self.name());
        {
            let mut mailbox = self.mailbox.lock();
            mailbox.stop = true;
            mailbox.slot = None;
            self.available.notify_one();
        }
        if wait {
            if let Some(handle) = self.worker.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

fn run_worker(graph: Arc<Graph>, id: StageId) {
    let stage = graph.stage(id);
    tracing::trace!("{} worker started", stage.name());
    let mut seen: u32 = 0;
    loop {
        let (input, parent) = {
            let mut mailbox = stage.mailbox.lock();
            loop {
                if mailbox.stop {
                    tracing::trace!("{} worker exiting", stage.name());
                    return;
                }
                if let Some(item) = mailbox.slot.take() {
                    break item;
                }
                stage.available.wait(&mut mailbox);
            }
        };

        if stage.period > 0 {
            seen = seen.wrapping_add(1);
            if seen % stage.period != 0 {
                continue;
            }
        }

        let hook = stage.process_hook.lock().clone();
        let mut output: Option<Payload> = None;
        let handled = match &hook {
            Some(hook) => {
                let parent = parent.and_then(|p| graph.stages().get(p));
                hook(&input, &mut output, parent.map(|s| s.as_ref()))
            }
            None => false,
        };
        if !handled {
            match stage.with_kernel(|kernel| kernel.compute(&input)) {
                Ok(out) => output = Some(out),
                Err(err) => {
                    tracing::warn!("{}: compute failed, frame dropped: {err:#}", stage.name());
                    continue;
                }
            }
        }
        // A hook can consume an input without producing anything; that is
        // the router case when the device owns this stage's stream.
        let Some(output) = output else { continue };

        *stage.last_output.lock() = Some(output.clone());
        if let Some(post) = stage.post_process_hook.lock().clone() {
            post(&output);
        }
        for &child in &stage.children {
            graph.stage(child).submit(output.clone(), Some(id));
        }
    }
}
