// Pipeline controller - owns the device and orchestrates capture and publishing
//
// The controller manages:
// - Device lifecycle (connect, disconnect, pass-through commands)
// - The capture loop on a blocking task and the publish ticker on an async task
// - Configuration changes at frame boundaries (mode, time scale, stack, darks)
// - State and statistics
// - Task cancellation via CancellationToken for graceful shutdown

mod capture;

use crate::accumulator::Accumulator;
use crate::buffer::{BufferLayout, VersionedLayout};
use crate::config::PipelineConfig;
use crate::device::{create_device, Device, DeviceConfig, ScanControl};
use crate::error::{XcError, XcResult};
use crate::mode::{OperatingMode, SeriesKind, SessionMode};
use crate::publisher::{Publisher, SeriesStore};
use crate::reduction::Reducer;
use crate::series::{ChannelSeries, SeriesKey};
use crate::sink::Sink;
use crate::transform::{RustFftTransform, Transform};
use crate::types::{AxisRange, BaudRate, DeviceGeometry, LineFlags, PipelineState, TimeScale};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock as TokioRwLock;
use tokio::sync::RwLockWriteGuard;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type SharedDevice = Arc<Mutex<Box<dyn Device>>>;

/// Pipeline statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub scans_completed: u64,
    pub scans_interrupted: u64,
    pub updates_delivered: u64,
    pub updates_dropped: u64,
}

#[derive(Default)]
struct StatsCounters {
    frames_captured: AtomicU64,
    frames_skipped: AtomicU64,
    scans_completed: AtomicU64,
    scans_interrupted: AtomicU64,
    updates_delivered: AtomicU64,
    updates_dropped: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            scans_completed: self.scans_completed.load(Ordering::Relaxed),
            scans_interrupted: self.scans_interrupted.load(Ordering::Relaxed),
            updates_delivered: self.updates_delivered.load(Ordering::Relaxed),
            updates_dropped: self.updates_dropped.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.frames_captured,
            &self.frames_skipped,
            &self.scans_completed,
            &self.scans_interrupted,
            &self.updates_delivered,
            &self.updates_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Capture enable flag the capture loop can sleep on
#[derive(Default)]
struct CaptureGate {
    enabled: Mutex<bool>,
    changed: Condvar,
}

impl CaptureGate {
    fn set(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
        self.changed.notify_all();
    }

    fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Wait up to `timeout` for capture to be enabled
    fn wait_enabled(&self, timeout: std::time::Duration) -> bool {
        let mut enabled = self.enabled.lock();
        if !*enabled {
            self.changed.wait_for(&mut enabled, timeout);
        }
        *enabled
    }

    fn wake(&self) {
        self.changed.notify_all();
    }
}

/// State shared by the controller, the capture loop and the publish ticker
/// for the lifetime of one connection
struct Session {
    id: String,
    config: PipelineConfig,
    device: SharedDevice,
    geometry: DeviceGeometry,
    layout: VersionedLayout,
    mode: Arc<RwLock<SessionMode>>,
    stack: Arc<AtomicUsize>,
    accumulator: Mutex<Accumulator>,
    store: Arc<SeriesStore>,
    reducer: Arc<Reducer>,
    sink: Arc<dyn Sink>,
    state: RwLock<PipelineState>,
    gate: CaptureGate,
    // Held for reading by the capture loop for one frame or scan, and by the
    // ticker for one publish; configuration changes hold it for writing
    frame_lock: TokioRwLock<()>,
    scan: ScanControl,
    connected: AtomicBool,
    stats: Arc<StatsCounters>,
    cancel: CancellationToken,
}

impl Session {
    /// Wait for the capture loop to reach a frame boundary and keep it there.
    ///
    /// A running scan is interrupted (and discarded) so the wait is bounded
    /// by one frame rather than one full scan.
    async fn quiesce(&self) -> RwLockWriteGuard<'_, ()> {
        let retry = Duration::from_millis(self.config.idle_poll_ms.max(1));
        loop {
            self.scan.interrupt();
            if let Ok(guard) = tokio::time::timeout(retry, self.frame_lock.write()).await {
                return guard;
            }
        }
    }

    fn state(&self) -> PipelineState {
        *self.state.read()
    }

    fn mode(&self) -> SessionMode {
        *self.mode.read()
    }

    fn spacing_ns(&self) -> f64 {
        self.geometry
            .sample_spacing_ns(self.layout.current().time_scale)
    }

    fn percent(&self) -> f64 {
        if self.state() == PipelineState::Capturing && self.mode().is_batch_scan() {
            self.scan.percent()
        } else {
            0.0
        }
    }

    /// Report the connection as gone; only the first call reaches the sink
    fn notify_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.sink.on_connection_changed(false);
        }
    }

    /// Called by the capture loop when the device fails mid-capture
    fn connection_lost(&self, error: &XcError) {
        log::error!("Device lost during capture: {}", error);
        *self.state.write() = PipelineState::Disconnected;
        self.gate.set(false);
        self.cancel.cancel();
        self.notify_disconnected();
    }
}

async fn device_call<T, F>(device: &SharedDevice, f: F) -> XcResult<T>
where
    F: FnOnce(&mut Box<dyn Device>) -> XcResult<T> + Send + 'static,
    T: Send + 'static,
{
    let device = Arc::clone(device);
    tokio::task::spawn_blocking(move || {
        let mut device = device.lock();
        f(&mut device)
    })
    .await
    .map_err(|e| XcError::DeviceUnavailable(format!("device task failed: {}", e)))?
}

/// Axis extents and labels for `mode`
pub fn axis_range(
    mode: SessionMode,
    geometry: &DeviceGeometry,
    time_scale: TimeScale,
    counter_window_secs: f64,
) -> AxisRange {
    let span = geometry.delay_size as f64 * geometry.sample_spacing_ns(time_scale);
    match mode.base() {
        OperatingMode::Counter => AxisRange {
            x_min: 0.0,
            x_max: counter_window_secs,
            x_label: "Time (s)".to_string(),
            y_label: "Counts".to_string(),
        },
        OperatingMode::Autocorrelator => AxisRange {
            x_min: 0.0,
            x_max: span,
            x_label: "Delay (ns)".to_string(),
            y_label: "Coherence ratio 0/n".to_string(),
        },
        OperatingMode::Crosscorrelator => AxisRange {
            x_min: -span,
            x_max: span,
            x_label: "Lag (ns)".to_string(),
            y_label: "Coherence ratio n1/n2".to_string(),
        },
    }
}

/// Acquisition and reduction engine for one correlator
pub struct Pipeline {
    config: PipelineConfig,
    device: SharedDevice,
    reducer: Arc<Reducer>,
    sink: Arc<dyn Sink>,
    mode: Arc<RwLock<SessionMode>>,
    stack: Arc<AtomicUsize>,
    stats: Arc<StatsCounters>,
    session: Option<Arc<Session>>,
    capture_task: Option<JoinHandle<()>>,
    publish_task: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        device: Box<dyn Device>,
        transform: Arc<dyn Transform>,
        sink: Arc<dyn Sink>,
    ) -> XcResult<Self> {
        config.validate()?;
        let reducer = Arc::new(Reducer::new(config.worker_threads, transform)?);
        Ok(Self {
            stack: Arc::new(AtomicUsize::new(config.stack)),
            config,
            device: Arc::new(Mutex::new(device)),
            reducer,
            sink,
            mode: Arc::new(RwLock::new(SessionMode::default())),
            stats: Arc::new(StatsCounters::default()),
            session: None,
            capture_task: None,
            publish_task: None,
        })
    }

    /// Build a pipeline over a configured device with the rustfft transform
    pub fn from_device_config(
        config: PipelineConfig,
        device_config: DeviceConfig,
        sink: Arc<dyn Sink>,
    ) -> XcResult<Self> {
        let device = create_device(device_config)?;
        Self::new(config, device, Arc::new(RustFftTransform), sink)
    }

    fn session(&self) -> XcResult<&Arc<Session>> {
        match &self.session {
            Some(session) if session.state().is_connected() => Ok(session),
            _ => Err(XcError::NotConnected),
        }
    }

    /// Open the device and start the capture loop and publisher (capture disabled)
    pub async fn connect(&mut self, endpoint: &str) -> XcResult<DeviceGeometry> {
        if self.session.is_some() {
            self.disconnect().await?;
        }

        log::info!("Connecting to correlator on {}", endpoint);
        let target = endpoint.to_string();
        let geometry = device_call(&self.device, move |d| d.connect(&target)).await?;

        let time_scale = self.config.time_scale;
        let layout = match geometry
            .validate()
            .and_then(|_| VersionedLayout::new(geometry, time_scale))
        {
            Ok(layout) => layout,
            Err(e) => {
                log::error!("Device reported unusable geometry: {}", e);
                let _ = device_call(&self.device, |d| d.disconnect()).await;
                return Err(e);
            }
        };
        if let Err(e) = device_call(&self.device, move |d| d.set_frequency_divider(time_scale)).await {
            let _ = device_call(&self.device, |d| d.disconnect()).await;
            return Err(e);
        }

        log::info!(
            "Correlator geometry: {} lines, {} baselines, {} delay channels @ {} Hz",
            geometry.num_lines,
            geometry.num_baselines,
            geometry.delay_size,
            geometry.clock_frequency
        );

        self.stats.reset();
        let mode = *self.mode.read();
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            accumulator: Mutex::new(Accumulator::new(
                mode,
                geometry,
                self.stack.load(Ordering::Acquire),
            )),
            config: self.config.clone(),
            device: Arc::clone(&self.device),
            geometry,
            layout,
            mode: Arc::clone(&self.mode),
            stack: Arc::clone(&self.stack),
            store: Arc::new(SeriesStore::new()),
            reducer: Arc::clone(&self.reducer),
            sink: Arc::clone(&self.sink),
            state: RwLock::new(PipelineState::Idle),
            gate: CaptureGate::default(),
            frame_lock: TokioRwLock::new(()),
            scan: ScanControl::new(),
            connected: AtomicBool::new(true),
            stats: Arc::clone(&self.stats),
            cancel: CancellationToken::new(),
        });

        let capture_session = Arc::clone(&session);
        self.capture_task = Some(tokio::task::spawn_blocking(move || {
            capture::run(capture_session)
        }));
        self.publish_task = Some(Self::spawn_publisher(Arc::clone(&session)));

        log::info!("Correlator connected, session {}", session.id);
        self.session = Some(session);
        self.sink.on_connection_changed(true);
        Ok(geometry)
    }

    fn spawn_publisher(session: Arc<Session>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let publisher = Publisher::new(Arc::clone(&session.store), Arc::clone(&session.sink));
            let mut tick = interval(Duration::from_millis(session.config.publish_interval_ms));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    _ = session.cancel.cancelled() => {
                        log::info!("Publisher task cancelled");
                        break;
                    }

                    _ = tick.tick() => {
                        if session.state() != PipelineState::Capturing {
                            continue;
                        }
                        let _frame = session.frame_lock.read().await;
                        let report = publisher.tick(session.mode());
                        session
                            .stats
                            .updates_delivered
                            .fetch_add(report.delivered as u64, Ordering::Relaxed);
                        session
                            .stats
                            .updates_dropped
                            .fetch_add(report.dropped as u64, Ordering::Relaxed);
                        publisher.progress(session.percent());
                    }
                }
            }

            log::info!("Publisher task stopped");
        })
    }

    /// Stop both tasks and release the device
    pub async fn disconnect(&mut self) -> XcResult<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        log::info!("Disconnecting correlator, session {}", session.id);
        session.cancel.cancel();
        session.scan.interrupt();
        session.gate.wake();

        if let Some(task) = self.capture_task.take() {
            if let Err(e) = task.await {
                log::error!("Capture task join error: {}", e);
            }
        }
        if let Some(task) = self.publish_task.take() {
            if let Err(e) = task.await {
                log::error!("Publisher task join error: {}", e);
            }
        }

        let result = device_call(&self.device, |d| d.disconnect()).await;
        if let Err(e) = &result {
            log::warn!("Device disconnect failed: {}", e);
        }
        *session.state.write() = PipelineState::Disconnected;
        session.notify_disconnected();
        log::info!("Correlator disconnected");
        result
    }

    /// Select mode and flags; every series of the previous mode is dropped
    pub async fn set_mode(&self, mode: SessionMode) -> XcResult<()> {
        let Ok(session) = self.session() else {
            *self.mode.write() = mode;
            return Ok(());
        };

        let _frame = session.quiesce().await;
        *self.mode.write() = mode;
        session.accumulator.lock().reset(mode);
        session.store.clear();
        log::info!("Mode set to {}", mode);
        Ok(())
    }

    /// Change the frequency divider and resize the scan buffers.
    ///
    /// Capture pauses for the change and resumes afterwards if it was running.
    /// On error the previous time scale stays active.
    pub async fn set_time_scale(&self, time_scale: TimeScale) -> XcResult<()> {
        let session = self.session()?;
        // Reject before touching the device
        BufferLayout::new(session.geometry, time_scale, 0)?;

        let _frame = session.quiesce().await;
        let previous = session.state();
        if previous == PipelineState::Capturing {
            *session.state.write() = PipelineState::Paused;
        }

        let result = async {
            device_call(&session.device, move |d| d.set_frequency_divider(time_scale)).await?;
            session.layout.replace(time_scale)?;
            session.accumulator.lock().rescale();
            session.store.clear();
            Ok(())
        }
        .await;

        if session.state() == PipelineState::Paused {
            *session.state.write() = previous;
        }
        match &result {
            Ok(()) => log::info!("Time scale set to {}", time_scale),
            Err(e) => log::warn!("Time scale change to {} failed: {}", time_scale, e),
        }
        result
    }

    /// Alias of `set_time_scale` named after the device register
    pub async fn set_frequency_divider(&self, time_scale: TimeScale) -> XcResult<()> {
        self.set_time_scale(time_scale).await
    }

    /// Start capturing; no-op while already capturing
    pub async fn enable_capture(&self) -> XcResult<()> {
        let session = self.session()?;
        if session.state() != PipelineState::Idle {
            return Ok(());
        }

        let _frame = session.quiesce().await;
        if session.state() != PipelineState::Idle {
            return Ok(());
        }
        device_call(&session.device, |d| d.enable_capture(true)).await?;
        *session.state.write() = PipelineState::Capturing;
        session.gate.set(true);
        log::info!("Capture enabled ({})", session.mode());
        Ok(())
    }

    /// Stop capturing after the current frame; no-op while idle
    pub async fn disable_capture(&self) -> XcResult<()> {
        let session = self.session()?;
        if session.state() == PipelineState::Idle {
            return Ok(());
        }

        let _frame = session.quiesce().await;
        session.gate.set(false);
        *session.state.write() = PipelineState::Idle;
        device_call(&session.device, |d| d.enable_capture(false)).await?;
        log::info!("Capture disabled");
        Ok(())
    }

    /// Set power and inversion switches of one line
    pub async fn set_line(&self, line: usize, flags: LineFlags) -> XcResult<()> {
        let session = self.session()?;
        if line >= session.geometry.num_lines {
            return Err(XcError::Configuration(format!(
                "line {} out of range ({} lines)",
                line, session.geometry.num_lines
            )));
        }
        let _frame = session.quiesce().await;
        device_call(&session.device, move |d| d.set_power(line, flags)).await?;
        log::info!("Line {} flags set to {:#06b}", line, flags.bits());
        Ok(())
    }

    pub async fn set_baud_rate(&self, rate: BaudRate) -> XcResult<()> {
        let session = self.session()?;
        let _frame = session.quiesce().await;
        device_call(&session.device, move |d| d.set_baud_rate(rate)).await?;
        log::info!("Baud rate set to {}", rate.bits_per_second());
        Ok(())
    }

    /// Frames per live block and passes per scan; blocks in progress restart
    pub async fn set_stack(&self, depth: usize) -> XcResult<()> {
        if depth == 0 {
            return Err(XcError::Configuration("stack must be at least 1".to_string()));
        }
        match self.session() {
            Ok(session) => {
                let _frame = session.quiesce().await;
                self.stack.store(depth, Ordering::Release);
                session.accumulator.lock().set_stack(depth);
            }
            Err(_) => self.stack.store(depth, Ordering::Release),
        }
        log::info!("Stack depth set to {}", depth);
        Ok(())
    }

    /// Capture the channel's current readings as its dark baseline.
    ///
    /// Published series keep their values; readings from the next frame or
    /// scan on are stored with the baseline subtracted.
    pub async fn capture_dark(&self, channel: usize) -> XcResult<()> {
        let session = self.session()?;
        let _frame = session.quiesce().await;
        session
            .accumulator
            .lock()
            .capture_dark(channel, session.config.counter_window_secs)?;
        log::info!("Dark baseline captured for channel {}", channel);
        Ok(())
    }

    pub async fn clear_dark(&self, channel: usize) -> XcResult<()> {
        let session = self.session()?;
        let _frame = session.quiesce().await;
        session.accumulator.lock().clear_dark(channel)?;
        log::info!("Dark baseline cleared for channel {}", channel);
        Ok(())
    }

    /// Scan completion in percent while a batch scan mode is capturing, 0 otherwise
    pub fn percent(&self) -> f64 {
        self.session.as_ref().map_or(0.0, |s| s.percent())
    }

    pub fn state(&self) -> PipelineState {
        self.session
            .as_ref()
            .map_or(PipelineState::Disconnected, |s| s.state())
    }

    /// Identifier of the current connection
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn geometry(&self) -> Option<DeviceGeometry> {
        self.session.as_ref().map(|s| s.geometry)
    }

    pub fn mode(&self) -> SessionMode {
        *self.mode.read()
    }

    pub fn stack(&self) -> usize {
        self.stack.load(Ordering::Acquire)
    }

    pub fn time_scale(&self) -> Option<TimeScale> {
        self.session.as_ref().map(|s| s.layout.current().time_scale)
    }

    /// Current buffer layout of the connected session
    pub fn layout(&self) -> Option<Arc<BufferLayout>> {
        self.session.as_ref().map(|s| s.layout.current())
    }

    /// Latest finished series; empty when nothing has been produced yet
    pub fn series(&self, channel: usize, kind: SeriesKind) -> Arc<ChannelSeries> {
        self.session
            .as_ref()
            .and_then(|s| s.store.snapshot(SeriesKey::new(channel, kind)))
            .unwrap_or_default()
    }

    /// Number of capture-loop writes to a series in this mode
    pub fn revision(&self, channel: usize, kind: SeriesKind) -> u64 {
        self.session
            .as_ref()
            .map_or(0, |s| s.store.revision(SeriesKey::new(channel, kind)))
    }

    pub fn axis_range(&self) -> Option<AxisRange> {
        self.session.as_ref().map(|s| {
            axis_range(
                s.mode(),
                &s.geometry,
                s.layout.current().time_scale,
                s.config.counter_window_secs,
            )
        })
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Tasks exit on their own once cancelled
        if let Some(session) = &self.session {
            session.cancel.cancel();
            session.scan.interrupt();
            session.gate.wake();
        }
    }
}
