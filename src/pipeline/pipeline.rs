//! The pipeline: public stream surface, native-stream dispatch, and the
//! glue between stages, plugin, and listeners.
//!
//! Construction builds the stage graph for the device's calibration model,
//! wires the per-stage hooks, asks the device which streams it produces
//! natively, and starts the workers that have enabled targets. From then on
//! the shape never changes; only modes, callbacks, and calibration do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::calib::{default_extrinsics, default_intrinsics, CalibPair, CalibrationModel};
use crate::device::{CalibrationSource, Device, Source};
use crate::frame::frame_to_mat;
use crate::kernels::{DisparityMethod, Kernel};
use crate::stream::{Mode, Stream, StreamData};

use super::builder::{self, Graph};
use super::latch::PairLatch;
use super::payload::{MatSample, PairSide, Payload};
use super::plugin::Plugin;
use super::stage::{Stage, StageId, StageKind, StreamCallback};

/// Process-wide stream listener; receives every sample of every delivered
/// stream. Intended to be installed once, before streaming starts.
pub type StreamListener = Arc<dyn Fn(Stream, &StreamData) + Send + Sync>;

type PluginSlot = RwLock<Option<Arc<dyn Plugin>>>;
type ListenerSlot = RwLock<Option<StreamListener>>;

struct CalibState {
    pair: CalibPair,
    /// Set when the model was unknown or the source incomplete; inhibits
    /// later calibration reloads.
    defaults_in_use: bool,
}

struct Inner {
    device: Arc<dyn Device>,
    calib_source: Arc<dyn CalibrationSource>,
    graph: Arc<Graph>,
    plugin: Arc<PluginSlot>,
    listener: Arc<ListenerSlot>,
    raw_latch: Mutex<PairLatch>,
    rectified_latch: Mutex<PairLatch>,
    calib: Mutex<CalibState>,
    streaming: AtomicBool,
}

/// The synthetic-stream pipeline of one camera.
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        device: Arc<dyn Device>,
        calib_source: Arc<dyn CalibrationSource>,
        model: CalibrationModel,
    ) -> Self {
        let (pair, defaults_in_use, model) = load_calibration(&*calib_source, model);
        let graph = builder::build(model, pair);
        let plugin: Arc<PluginSlot> = Arc::new(RwLock::new(None));
        let listener: Arc<ListenerSlot> = Arc::new(RwLock::new(None));
        install_hooks(&graph, &plugin, &listener);

        let inner = Arc::new(Inner {
            device,
            calib_source,
            graph,
            plugin,
            listener,
            raw_latch: Mutex::new(PairLatch::new()),
            rectified_latch: Mutex::new(PairLatch::new()),
            calib: Mutex::new(CalibState {
                pair,
                defaults_in_use,
            }),
            streaming: AtomicBool::new(false),
        });
        inner.init_stream_supports();
        Graph::sync_activation(&inner.graph);
        Self { inner }
    }

    /// The calibration model the graph was actually built for; unknown
    /// models resolve to pinhole.
    pub fn model(&self) -> CalibrationModel {
        self.inner.graph.model()
    }

    pub fn set_stream_listener(
        &self,
        listener: impl Fn(Stream, &StreamData) + Send + Sync + 'static,
    ) {
        *self.inner.listener.write() = Some(Arc::new(listener));
    }

    pub fn supports(&self, stream: Stream) -> bool {
        self.inner.graph.supports(stream)
    }

    pub fn supports_mode(&self, stream: Stream) -> Mode {
        match self.inner.graph.supports_mode(stream) {
            Some(mode) => mode,
            None => {
                tracing::error!("no stage produces stream {stream}");
                Mode::None
            }
        }
    }

    pub fn is_stream_enabled(&self, stream: Stream) -> bool {
        matches!(
            self.inner.graph.enabled_mode(stream),
            Some(Mode::Native) | Some(Mode::Synthetic)
        )
    }

    pub fn enable_stream(&self, stream: Stream) -> bool {
        self.enable_stream_with(stream, |_| {}, false)
    }

    /// Enable with a change callback; `dry_run` reports the streams that
    /// would flip without mutating anything.
    pub fn enable_stream_with(
        &self,
        stream: Stream,
        mut on_change: impl FnMut(Stream),
        dry_run: bool,
    ) -> bool {
        Graph::enable(&self.inner.graph, stream, &mut on_change, dry_run)
    }

    pub fn disable_stream(&self, stream: Stream) -> bool {
        self.disable_stream_with(stream, |_| {}, false)
    }

    pub fn disable_stream_with(
        &self,
        stream: Stream,
        mut on_change: impl FnMut(Stream),
        dry_run: bool,
    ) -> bool {
        self.inner.graph.disable(stream, &mut on_change, dry_run)
    }

    pub fn set_stream_callback(&self, stream: Stream, callback: Option<StreamCallback>) -> bool {
        self.inner.graph.set_callback(stream, callback)
    }

    pub fn has_stream_callback(&self, stream: Stream) -> bool {
        self.inner.graph.has_callback(stream)
    }

    /// Latest sample of a stream. Native streams come from the device;
    /// synthetic ones read the owning stage's most recent output, taking
    /// the descriptor's half of a paired output. Disabled or unknown
    /// streams yield an empty record.
    pub fn get_stream_data(&self, stream: Stream) -> StreamData {
        let inner = &self.inner;
        match inner.graph.enabled_mode(stream) {
            Some(Mode::Native) => decode_stream_data(&inner.device.get_stream_data(stream)),
            Some(Mode::Synthetic) => {
                let Some((owner, idx)) = inner.graph.locate(stream) else {
                    return StreamData::default();
                };
                let stage = inner.graph.stage(owner);
                match stage.last_output() {
                    Some(output) => {
                        let side = stage.targets.lock()[idx].side;
                        match output.side(side) {
                            Some(sample) => sample.clone().into_stream_data(),
                            None => StreamData::default(),
                        }
                    }
                    None => {
                        tracing::debug!("{stream} not ready yet");
                        StreamData::default()
                    }
                }
            }
            _ => {
                tracing::error!("failed to get stream data of {stream}, unsupported or disabled");
                StreamData::default()
            }
        }
    }

    /// All buffered samples. Native streams delegate to the device; a
    /// synthetic stream yields at most its latest output.
    pub fn get_stream_datas(&self, stream: Stream) -> Vec<StreamData> {
        match self.inner.graph.enabled_mode(stream) {
            Some(Mode::Native) => self
                .inner
                .device
                .get_stream_datas(stream)
                .iter()
                .map(decode_stream_data)
                .collect(),
            Some(Mode::Synthetic) => {
                let data = self.get_stream_data(stream);
                if data.is_empty() {
                    Vec::new()
                } else {
                    vec![data]
                }
            }
            _ => {
                tracing::error!("failed to get stream datas of {stream}, unsupported or disabled");
                Vec::new()
            }
        }
    }

    /// Install device callbacks for every native-support stream and start
    /// the video source. Idempotent.
    pub fn start_video_streaming(&self) {
        if self.inner.streaming.swap(true, Ordering::SeqCst) {
            tracing::debug!("video streaming already started");
            return;
        }
        for stream in self.native_support_streams() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            self.inner.device.set_stream_callback(
                stream,
                Some(Arc::new(move |data: &StreamData| {
                    let Some(inner) = weak.upgrade() else { return };
                    let data = decode_stream_data(data);
                    inner.process_native_stream(stream, &data);
                    if let Some(callback) = inner.graph.callback(stream) {
                        callback(&data);
                    }
                })),
                true,
            );
        }
        self.inner.device.start(Source::VideoStreaming);
    }

    /// Remove the device callbacks and stop the video source.
    pub fn stop_video_streaming(&self) {
        if !self.inner.streaming.swap(false, Ordering::SeqCst) {
            return;
        }
        for stream in self.native_support_streams() {
            self.inner.device.set_stream_callback(stream, None, true);
        }
        self.inner.device.stop(Source::VideoStreaming);
    }

    /// Block until the device reports fresh data; holds no pipeline locks.
    pub fn wait_for_streams(&self) {
        self.inner.device.wait_for_streams();
    }

    pub fn set_plugin(&self, plugin: Option<Arc<dyn Plugin>>) {
        *self.inner.plugin.write() = plugin;
    }

    pub fn has_plugin(&self) -> bool {
        self.inner.plugin.read().is_some()
    }

    /// The calibration the kernels currently run with.
    pub fn calibration(&self) -> CalibPair {
        self.inner.calib.lock().pair
    }

    /// Forwarded to the disparity stage.
    pub fn set_disparity_method(&self, method: DisparityMethod) {
        let ids = self.inner.graph.ids();
        self.inner.graph.stage(ids.disparity).with_kernel(|kernel| {
            if let Kernel::Disparity(k) = kernel {
                k.set_method(method);
            }
        });
    }

    /// Re-read intrinsics/extrinsics from the calibration source and reload
    /// the rectify stage (and the derived parameters downstream). A no-op
    /// while calibration defaults are in use.
    pub fn notify_calibration_changed(&self) {
        let pair = {
            let mut calib = self.inner.calib.lock();
            if calib.defaults_in_use {
                tracing::debug!("calibration defaults in use, reload skipped");
                return;
            }
            let Some(pair) = fetch_calibration(&*self.inner.calib_source) else {
                tracing::error!("calibration source incomplete, keeping current parameters");
                return;
            };
            calib.pair = pair;
            pair
        };
        self.inner.reload_calibration(pair);
    }

    fn native_support_streams(&self) -> Vec<Stream> {
        let mut streams = Vec::new();
        for stage in self.inner.graph.stages() {
            for target in stage.targets.lock().iter() {
                if target.support_mode == Mode::Native {
                    streams.push(target.stream);
                }
            }
        }
        streams
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_video_streaming();
        self.inner.graph.deactivate_all();
    }
}

impl Inner {
    /// Ask the device which streams it produces itself and upgrade those
    /// targets to native; everything else in the chain becomes a synthetic
    /// candidate. Only meaningful when the device has both raw eyes.
    fn init_stream_supports(&self) {
        if !(self.device.supports(Stream::Left) && self.device.supports(Stream::Right)) {
            return;
        }
        let chain = [
            Stream::LeftRectified,
            Stream::RightRectified,
            Stream::Disparity,
            Stream::DisparityNormalized,
            Stream::Points,
            Stream::Depth,
        ];
        for stream in chain {
            let Some((owner, idx)) = self.graph.locate(stream) else {
                continue;
            };
            let stage = self.graph.stage(owner);
            let mut targets = stage.targets.lock();
            let target = &mut targets[idx];
            if self.device.supports(stream) {
                target.support_mode = Mode::Native;
                target.enabled_mode = Mode::Native;
                tracing::debug!("{stream} produced natively by the device");
            } else {
                target.support_mode = Mode::Synthetic;
            }
        }
    }

    /// Entry point for every native sample the device delivers.
    fn process_native_stream(&self, stream: Stream, data: &StreamData) {
        self.notify_stream_data(stream, data);
        match stream {
            Stream::Left | Stream::Right => {
                let side = if stream == Stream::Left {
                    PairSide::Left
                } else {
                    PairSide::Right
                };
                let pair = self.raw_latch.lock().put(side, data.clone());
                if let Some(pair) = pair {
                    // The root is a passthrough that only carries the
                    // topology; raw pairs go straight to rectify.
                    self.graph
                        .stage(self.graph.ids().rectify)
                        .submit(pair, None);
                }
            }
            Stream::LeftRectified | Stream::RightRectified => {
                let side = if stream == Stream::LeftRectified {
                    PairSide::Left
                } else {
                    PairSide::Right
                };
                let pair = self.rectified_latch.lock().put(side, data.clone());
                if let Some(pair) = pair {
                    self.submit_to_children(self.graph.ids().rectify, pair);
                }
            }
            Stream::Disparity | Stream::DisparityNormalized | Stream::Points | Stream::Depth => {
                let Some((owner, _)) = self.graph.locate(stream) else {
                    return;
                };
                if let Some(sample) = MatSample::from_stream_data(data) {
                    self.submit_to_children(owner, Payload::Single(sample));
                }
            }
        }
    }

    /// Deliver a device-produced payload to a stage's children, bypassing
    /// the stage itself so the native output is not reprocessed by its
    /// synthetic producer.
    fn submit_to_children(&self, id: StageId, payload: Payload) {
        for &child in &self.graph.stage(id).children {
            self.graph.stage(child).submit(payload.clone(), Some(id));
        }
    }

    fn notify_stream_data(&self, stream: Stream, data: &StreamData) {
        if let Some(listener) = self.listener.read().clone() {
            listener(stream, data);
        }
    }

    /// Swap calibration-derived parameters while no compute is in flight on
    /// the rectify stage.
    fn reload_calibration(&self, pair: CalibPair) {
        let ids = self.graph.ids();
        let rectify = self.graph.stage(ids.rectify);
        let was_activated = rectify.is_activated();
        rectify.deactivate(true);
        let q = rectify.with_kernel(|kernel| match kernel {
            Kernel::Rectify(k) => {
                k.reload(pair);
                Some(k.q)
            }
            _ => None,
        });
        if let Some(q) = q {
            self.graph.stage(ids.points).with_kernel(|kernel| {
                if let Kernel::Points(k) = kernel {
                    k.reload(q, pair);
                }
            });
            self.graph.stage(ids.depth).with_kernel(|kernel| {
                if let Kernel::Depth(k) = kernel {
                    k.reload(pair);
                }
            });
            tracing::info!("calibration reloaded");
        }
        if was_activated {
            Stage::activate(&self.graph, ids.rectify);
        }
    }
}

/// Device samples may arrive as raw frames; decode them into a matrix view
/// once, at the pipeline boundary.
fn decode_stream_data(data: &StreamData) -> StreamData {
    match (&data.mat, &data.frame) {
        (None, Some(frame)) => StreamData {
            img: data.img,
            mat: Some(frame_to_mat(frame)),
            frame: data.frame.clone(),
            frame_id: data.frame_id,
        },
        _ => data.clone(),
    }
}

fn fetch_calibration(source: &dyn CalibrationSource) -> Option<CalibPair> {
    let left = source.intrinsics(Stream::Left)?;
    let right = source.intrinsics(Stream::Right)?;
    let extrinsics = source.extrinsics(Stream::Left, Stream::Right)?;
    Some(CalibPair {
        left,
        right,
        extrinsics,
    })
}

fn load_calibration(
    source: &dyn CalibrationSource,
    model: CalibrationModel,
) -> (CalibPair, bool, CalibrationModel) {
    let default_pair = CalibPair {
        left: default_intrinsics(),
        right: default_intrinsics(),
        extrinsics: default_extrinsics(),
    };
    match model {
        CalibrationModel::Pinhole | CalibrationModel::KannalaBrandt => {
            match fetch_calibration(source) {
                Some(pair) => {
                    tracing::info!("camera calib model: {model:?}");
                    (pair, false, model)
                }
                None => {
                    tracing::error!("calibration source incomplete, using default pinhole data");
                    (default_pair, true, CalibrationModel::Pinhole)
                }
            }
        }
        CalibrationModel::Unknown => {
            tracing::info!("camera calib model unknown, using default pinhole data");
            (default_pair, true, CalibrationModel::Pinhole)
        }
    }
}

/// Wire the per-stage process and post-process hooks.
///
/// The process hook consults the plugin first, then skips the built-in
/// compute whenever the stage's own stream is not synthetic-enabled (the
/// device produces it, so the stage only routes). The post-process hook
/// delivers each target stream's half of the output to the listener and the
/// per-stream callback.
fn install_hooks(graph: &Arc<Graph>, plugin: &Arc<PluginSlot>, listener: &Arc<ListenerSlot>) {
    let ids = graph.ids();
    let staged = [
        (StageKind::Rectify, ids.rectify),
        (StageKind::Disparity, ids.disparity),
        (StageKind::DisparityNormalized, ids.disparity_norm),
        (StageKind::Points, ids.points),
        (StageKind::Depth, ids.depth),
    ];
    for (kind, id) in staged {
        let Some(primary) = kind.primary_stream() else {
            continue;
        };
        let stage = graph.stage(id);

        let targets = stage.targets_handle();
        let plugin = Arc::clone(plugin);
        stage.set_process_hook(Arc::new(move |input, output, _parent| {
            if let Some(plugin) = plugin.read().clone() {
                let handled = match kind {
                    StageKind::Rectify => plugin.on_rectify(input, output),
                    StageKind::Disparity => plugin.on_disparity(input, output),
                    StageKind::DisparityNormalized => {
                        plugin.on_disparity_normalized(input, output)
                    }
                    StageKind::Points => plugin.on_points(input, output),
                    StageKind::Depth => plugin.on_depth(input, output),
                    StageKind::Root => false,
                };
                if handled {
                    return true;
                }
            }
            let mode = targets
                .lock()
                .iter()
                .find(|t| t.stream == primary)
                .map(|t| t.enabled_mode);
            mode != Some(Mode::Synthetic)
        }));

        let targets = stage.targets_handle();
        let listener = Arc::clone(listener);
        stage.set_post_process_hook(Arc::new(move |output| {
            let snapshot: Vec<(Stream, Option<PairSide>, Option<StreamCallback>)> = targets
                .lock()
                .iter()
                .map(|t| (t.stream, t.side, t.callback.clone()))
                .collect();
            for (stream, side, callback) in snapshot {
                let Some(sample) = output.side(side) else {
                    continue;
                };
                let data = sample.clone().into_stream_data();
                if let Some(listener) = listener.read().clone() {
                    listener(stream, &data);
                }
                if let Some(callback) = callback {
                    callback(&data);
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::Intrinsics;
    use crate::device::DeviceStreamCallback;
    use crate::mat::Mat;
    use crate::stream::ImgMeta;
    use crossbeam_channel::{bounded, Receiver};
    use ndarray::Array3;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const W: usize = 32;
    const H: usize = 24;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    struct FakeDevice {
        native: Vec<Stream>,
        callbacks: Mutex<HashMap<Stream, DeviceStreamCallback>>,
        latest: Mutex<HashMap<Stream, StreamData>>,
        start_calls: AtomicUsize,
        started: AtomicBool,
    }

    impl FakeDevice {
        fn new(native: &[Stream]) -> Self {
            Self {
                native: native.to_vec(),
                callbacks: Mutex::new(HashMap::new()),
                latest: Mutex::new(HashMap::new()),
                start_calls: AtomicUsize::new(0),
                started: AtomicBool::new(false),
            }
        }

        fn push(&self, stream: Stream, data: StreamData) {
            self.latest.lock().insert(stream, data.clone());
            let callback = self.callbacks.lock().get(&stream).cloned();
            if let Some(callback) = callback {
                callback(&data);
            }
        }
    }

    impl Device for FakeDevice {
        fn supports(&self, stream: Stream) -> bool {
            self.native.contains(&stream)
        }

        fn set_stream_callback(
            &self,
            stream: Stream,
            callback: Option<DeviceStreamCallback>,
            _replace: bool,
        ) {
            let mut callbacks = self.callbacks.lock();
            match callback {
                Some(cb) => {
                    callbacks.insert(stream, cb);
                }
                None => {
                    callbacks.remove(&stream);
                }
            }
        }

        fn get_stream_data(&self, stream: Stream) -> StreamData {
            self.latest.lock().get(&stream).cloned().unwrap_or_default()
        }

        fn get_stream_datas(&self, stream: Stream) -> Vec<StreamData> {
            let data = self.get_stream_data(stream);
            if data.is_empty() {
                Vec::new()
            } else {
                vec![data]
            }
        }

        fn start(&self, _source: Source) {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            self.started.store(true, Ordering::SeqCst);
        }

        fn stop(&self, _source: Source) {
            self.started.store(false, Ordering::SeqCst);
        }

        fn wait_for_streams(&self) {}
    }

    struct FakeCalib;

    impl CalibrationSource for FakeCalib {
        fn intrinsics(&self, _stream: Stream) -> Option<Intrinsics> {
            Some(Intrinsics {
                model: CalibrationModel::Pinhole,
                width: W as u16,
                height: H as u16,
                fx: 30.0,
                fy: 30.0,
                cx: 16.0,
                cy: 12.0,
                coeffs: [0.0; 5],
            })
        }

        fn extrinsics(&self, _from: Stream, _to: Stream) -> Option<crate::calib::Extrinsics> {
            Some(crate::calib::Extrinsics {
                rotation: nalgebra::Matrix3::identity(),
                translation: nalgebra::Vector3::new(-0.1, 0.0, 0.0),
            })
        }
    }

    fn pattern(x: usize, y: usize) -> u8 {
        (((x * 13 + y * 7) * 31) % 251) as u8
    }

    fn gray_data(frame_id: u16, shift: usize) -> StreamData {
        let mut img = Array3::<u8>::zeros((H, W, 1));
        for y in 0..H {
            for x in 0..W {
                img[[y, x, 0]] = pattern(x + shift, y);
            }
        }
        StreamData {
            img: Some(ImgMeta {
                frame_id,
                timestamp: frame_id as u32 * 1000,
                exposure_time: 100,
            }),
            mat: Some(Mat::U8(img)),
            frame: None,
            frame_id,
        }
    }

    fn listener_channel(pipeline: &Pipeline) -> Receiver<(Stream, u16)> {
        let (tx, rx) = bounded::<(Stream, u16)>(256);
        pipeline.set_stream_listener(move |stream, data| {
            let _ = tx.send((stream, data.frame_id));
        });
        rx
    }

    /// Drain listener events until `stream` shows up (or time runs out).
    fn collect_until(rx: &Receiver<(Stream, u16)>, stream: Stream) -> Vec<(Stream, u16)> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) {
            let done = event.0 == stream;
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    fn push_raw_pair(device: &FakeDevice, frame_id: u16) {
        device.push(Stream::Left, gray_data(frame_id, 0));
        device.push(Stream::Right, gray_data(frame_id, 4));
    }

    #[test]
    fn test_end_to_end_depth_from_raw_pair() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device.clone(), Arc::new(FakeCalib), CalibrationModel::Pinhole);
        let rx = listener_channel(&pipeline);
        pipeline.set_disparity_method(DisparityMethod::Bm);

        assert!(pipeline.enable_stream(Stream::Depth));
        assert!(pipeline.is_stream_enabled(Stream::Depth));
        assert!(!pipeline.is_stream_enabled(Stream::DisparityNormalized));

        pipeline.start_video_streaming();
        assert!(device.started.load(Ordering::SeqCst));
        push_raw_pair(&device, 1);

        let seen = collect_until(&rx, Stream::Depth);
        for stream in [
            Stream::Left,
            Stream::Right,
            Stream::LeftRectified,
            Stream::RightRectified,
            Stream::Disparity,
            Stream::Points,
            Stream::Depth,
        ] {
            assert!(seen.contains(&(stream, 1)), "missing {stream} in {seen:?}");
        }
        assert!(!seen.iter().any(|(s, _)| *s == Stream::DisparityNormalized));

        // Rectification with zero distortion is the identity, and the
        // registry hands back the left half of the paired output.
        let rect = pipeline.get_stream_data(Stream::LeftRectified);
        assert_eq!(rect.frame_id, 1);
        assert_eq!(rect.mat.unwrap().as_u8().unwrap()[[10, 20, 0]], pattern(20, 10));

        // The shifted pattern gives disparity 4, so z = fx * b / d = 0.75 m.
        let depth = pipeline.get_stream_data(Stream::Depth);
        let depth_mm = depth.mat.unwrap().as_u16().unwrap()[[10, 20, 0]];
        assert_eq!(depth_mm, 750, "depth at a textured pixel");

        let datas = pipeline.get_stream_datas(Stream::Depth);
        assert_eq!(datas.len(), 1);
    }

    #[test]
    fn test_native_disparity_routes_to_children_only() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[
            Stream::Left,
            Stream::Right,
            Stream::Disparity,
        ]));
        let pipeline = Pipeline::new(device.clone(), Arc::new(FakeCalib), CalibrationModel::Pinhole);
        let rx = listener_channel(&pipeline);

        assert_eq!(pipeline.supports_mode(Stream::Disparity), Mode::Native);
        assert!(pipeline.is_stream_enabled(Stream::Disparity));
        assert!(pipeline.enable_stream(Stream::DisparityNormalized));

        pipeline.start_video_streaming();
        let mut disp = Array3::<f32>::zeros((H, W, 1));
        disp.fill(8.0);
        device.push(
            Stream::Disparity,
            StreamData {
                img: None,
                mat: Some(Mat::F32(disp)),
                frame: None,
                frame_id: 7,
            },
        );

        let seen = collect_until(&rx, Stream::DisparityNormalized);
        assert!(seen.contains(&(Stream::Disparity, 7)));
        assert!(seen.contains(&(Stream::DisparityNormalized, 7)));

        // The synthetic disparity stage stays inert for its own output.
        let ids = pipeline.inner.graph.ids();
        assert!(pipeline.inner.graph.stage(ids.disparity).last_output().is_none());

        // Raw pairs still flow through rectify, but the inert disparity
        // stage must not republish anything for them.
        push_raw_pair(&device, 8);
        let mut seen = collect_until(&rx, Stream::RightRectified);
        // Drain anything the downstream workers might still emit.
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(300)) {
            seen.push(event);
        }
        assert!(seen.contains(&(Stream::RightRectified, 8)));
        assert!(!seen.iter().any(|(s, id)| *s == Stream::Disparity && *id == 8));

        // Native reads delegate to the device.
        assert!(!pipeline.get_stream_data(Stream::Disparity).is_empty());
    }

    struct RectifyOverride;

    impl Plugin for RectifyOverride {
        fn on_rectify(&self, input: &Payload, output: &mut Option<Payload>) -> bool {
            let Some((left, _)) = input.as_pair() else {
                return false;
            };
            let make = |value: u8| MatSample {
                mat: Mat::U8(Array3::from_elem((H, W, 1), value)),
                frame_id: left.frame_id,
                meta: left.meta,
            };
            *output = Some(Payload::Pair {
                left: make(99),
                right: make(77),
            });
            true
        }
    }

    #[test]
    fn test_plugin_short_circuits_rectify() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device.clone(), Arc::new(FakeCalib), CalibrationModel::Pinhole);
        let rx = listener_channel(&pipeline);

        assert!(!pipeline.has_plugin());
        pipeline.set_plugin(Some(Arc::new(RectifyOverride)));
        assert!(pipeline.has_plugin());

        pipeline.enable_stream(Stream::LeftRectified);
        pipeline.start_video_streaming();
        push_raw_pair(&device, 3);

        let seen = collect_until(&rx, Stream::RightRectified);
        assert!(seen.contains(&(Stream::LeftRectified, 3)));

        // The published output is the plugin's, not the built-in remap, and
        // each stream maps to its own half.
        let left = pipeline.get_stream_data(Stream::LeftRectified);
        assert_eq!(left.mat.unwrap().as_u8().unwrap()[[5, 5, 0]], 99);
        let right = pipeline.get_stream_data(Stream::RightRectified);
        assert_eq!(right.mat.unwrap().as_u8().unwrap()[[5, 5, 0]], 77);
    }

    #[test]
    fn test_stream_callback_fires_and_clears() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device.clone(), Arc::new(FakeCalib), CalibrationModel::Pinhole);
        pipeline.enable_stream(Stream::LeftRectified);

        let (tx, rx) = bounded::<u16>(16);
        assert!(pipeline.set_stream_callback(
            Stream::LeftRectified,
            Some(Arc::new(move |data: &StreamData| {
                let _ = tx.send(data.frame_id);
            })),
        ));
        assert!(pipeline.has_stream_callback(Stream::LeftRectified));

        pipeline.start_video_streaming();
        push_raw_pair(&device, 11);
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 11);

        assert!(pipeline.set_stream_callback(Stream::LeftRectified, None));
        assert!(!pipeline.has_stream_callback(Stream::LeftRectified));
    }

    #[test]
    fn test_disabled_and_not_ready_reads_are_empty() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device, Arc::new(FakeCalib), CalibrationModel::Pinhole);

        // Disabled stream.
        assert!(pipeline.get_stream_data(Stream::Depth).is_empty());
        assert!(pipeline.get_stream_datas(Stream::Depth).is_empty());

        // Enabled but nothing produced yet.
        pipeline.enable_stream(Stream::Depth);
        assert!(pipeline.get_stream_data(Stream::Depth).is_empty());
        assert!(pipeline.get_stream_datas(Stream::Depth).is_empty());
    }

    #[test]
    fn test_unknown_model_falls_back_to_pinhole_pipeline() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device, Arc::new(FakeCalib), CalibrationModel::Unknown);
        assert_eq!(pipeline.model(), CalibrationModel::Pinhole);
        assert!(pipeline.inner.calib.lock().defaults_in_use);

        // The points stage exists and sits upstream of depth, as in the
        // pinhole shape; reads work and are merely empty until data flows.
        assert!(pipeline.enable_stream(Stream::Points));
        assert!(pipeline.is_stream_enabled(Stream::Points));
        assert!(pipeline.get_stream_data(Stream::Points).is_empty());

        // With defaults in use, a calibration change is a no-op.
        pipeline.notify_calibration_changed();
        assert!(pipeline.inner.calib.lock().defaults_in_use);
    }

    #[test]
    fn test_calibration_reload_during_streaming() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device.clone(), Arc::new(FakeCalib), CalibrationModel::Pinhole);
        let rx = listener_channel(&pipeline);
        pipeline.set_disparity_method(DisparityMethod::Bm);

        pipeline.enable_stream(Stream::Depth);
        pipeline.start_video_streaming();
        push_raw_pair(&device, 1);
        collect_until(&rx, Stream::Depth);

        pipeline.notify_calibration_changed();
        let ids = pipeline.inner.graph.ids();
        assert!(pipeline.inner.graph.stage(ids.rectify).is_activated());
        assert_eq!(pipeline.calibration().left.fx, 30.0);

        // Frames keep flowing after the swap.
        push_raw_pair(&device, 2);
        let seen = collect_until(&rx, Stream::Depth);
        assert!(seen.contains(&(Stream::Depth, 2)));
    }

    #[test]
    fn test_raw_frames_are_decoded_at_the_boundary() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device.clone(), Arc::new(FakeCalib), CalibrationModel::Pinhole);
        let rx = listener_channel(&pipeline);
        pipeline.enable_stream(Stream::LeftRectified);
        pipeline.start_video_streaming();

        let frame_data = |frame_id: u16, shift: usize| {
            let mut buf = vec![0u8; W * H];
            for y in 0..H {
                for x in 0..W {
                    buf[y * W + x] = pattern(x + shift, y);
                }
            }
            let frame = crate::frame::Frame::new(
                W as u16,
                H as u16,
                crate::frame::PixelFormat::Gray8,
                buf,
                frame_id,
                frame_id as u32 * 1000,
                100,
            );
            StreamData {
                img: Some(ImgMeta {
                    frame_id,
                    timestamp: frame_id as u32 * 1000,
                    exposure_time: 100,
                }),
                mat: None,
                frame: Some(Arc::new(frame)),
                frame_id,
            }
        };
        device.push(Stream::Left, frame_data(6, 0));
        device.push(Stream::Right, frame_data(6, 4));

        let seen = collect_until(&rx, Stream::RightRectified);
        assert!(seen.contains(&(Stream::LeftRectified, 6)));

        // Native pull also decodes the stored raw frame.
        let left = pipeline.get_stream_data(Stream::Left);
        assert_eq!(left.mat.unwrap().as_u8().unwrap()[[3, 7, 0]], pattern(7, 3));
        assert!(left.frame.is_some());
    }

    #[test]
    fn test_start_video_streaming_is_idempotent() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(device.clone(), Arc::new(FakeCalib), CalibrationModel::Pinhole);
        pipeline.start_video_streaming();
        pipeline.start_video_streaming();
        assert_eq!(device.start_calls.load(Ordering::SeqCst), 1);

        pipeline.stop_video_streaming();
        assert!(!device.started.load(Ordering::SeqCst));
        assert!(device.callbacks.lock().is_empty());
    }

    #[test]
    fn test_kannala_brandt_depth_before_points() {
        init_logging();
        let device = Arc::new(FakeDevice::new(&[Stream::Left, Stream::Right]));
        let pipeline = Pipeline::new(
            device.clone(),
            Arc::new(FakeCalib),
            CalibrationModel::KannalaBrandt,
        );
        let rx = listener_channel(&pipeline);
        pipeline.set_disparity_method(DisparityMethod::Bm);

        pipeline.enable_stream(Stream::Points);
        pipeline.start_video_streaming();
        push_raw_pair(&device, 5);

        let seen = collect_until(&rx, Stream::Points);
        // Depth is computed before points under this model.
        let depth_pos = seen.iter().position(|&(s, _)| s == Stream::Depth);
        let points_pos = seen.iter().position(|&(s, _)| s == Stream::Points);
        assert!(depth_pos.is_some() && points_pos.is_some());
        assert!(depth_pos < points_pos);
    }
}
