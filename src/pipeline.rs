//! The periodic capture → compose → publish loop.
//!
//! `Pipeline` owns the source, compositor and publisher and runs one tick at a
//! time. `PipelineController` drives it from a dedicated thread paced by a
//! `Ticker`, and owns the Idle → Running → Stopped lifecycle.
//!
//! Only the `OutputSelector` is shared with other threads. Frames are created
//! and dropped inside a tick.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::compose::Compositor;
use crate::config::{FeedConfig, OpenRetryPolicy};
use crate::frame::CanvasSpec;
use crate::ingest::FrameSource;
use crate::output::{Channel, OutputSelection, OutputSelector, PublishPolicy};
use crate::publish::FramePublisher;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Settings and outcomes
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub large: CanvasSpec,
    pub small: CanvasSpec,
    /// Scale and center frames instead of stretching them.
    pub letterbox: bool,
    /// Rotate composed frames 180°.
    pub orient_flip: bool,
    pub publish_policy: PublishPolicy,
    pub tick_period: Duration,
    pub open_retry: OpenRetryPolicy,
    pub health_log_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &FeedConfig) -> Self {
        Self {
            large: cfg.large,
            small: cfg.small,
            letterbox: cfg.capture.mode.letterbox(),
            orient_flip: cfg.capture.upside_down,
            publish_policy: cfg.publish_policy,
            tick_period: cfg.capture.tick_period(),
            open_retry: cfg.open_retry,
            health_log_interval: HEALTH_LOG_INTERVAL,
        }
    }
}

/// Why a tick published nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The source has not been opened.
    NotOpen,
    /// The source failed to deliver a frame.
    Acquisition,
    /// The source delivered a frame with no pixels.
    EmptyFrame,
    /// The frame could not be fitted onto the canvas.
    Composition,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Channels that were handed to the publisher successfully.
    Published(Vec<Channel>),
    /// A frame was acquired but no output is enabled.
    NothingEnabled,
    Skipped(SkipReason),
}

/// Pipeline counters. Updated by the tick thread, readable from anywhere.
#[derive(Debug, Default)]
pub struct PipelineStats {
    ticks: AtomicU64,
    frames_acquired: AtomicU64,
    published_large: AtomicU64,
    published_small: AtomicU64,
    skipped: AtomicU64,
    publish_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub frames_acquired: u64,
    pub published_large: u64,
    pub published_small: u64,
    pub skipped: u64,
    pub publish_errors: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            frames_acquired: self.frames_acquired.load(Ordering::Relaxed),
            published_large: self.published_large.load(Ordering::Relaxed),
            published_small: self.published_small.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Stop signal and tickers
// ----------------------------------------------------------------------------

/// One-shot stop flag that sleepers can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn trigger(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns true if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Paces the tick loop.
pub trait Ticker: Send {
    /// Block until the next tick is due. Returns false once `stop` fires.
    fn wait(&mut self, stop: &StopSignal) -> bool;
}

/// Fixed-period ticker.
///
/// The first tick fires immediately. If a tick overruns, the deadlines it
/// missed are dropped rather than fired back to back.
pub struct IntervalTicker {
    period: Duration,
    next: Option<Instant>,
    dropped: u64,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            next: None,
            dropped: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Ticker for IntervalTicker {
    fn wait(&mut self, stop: &StopSignal) -> bool {
        let now = Instant::now();
        let deadline = *self.next.get_or_insert(now);

        if deadline > now {
            if stop.wait_timeout(deadline - now) {
                return false;
            }
        } else {
            let late = now - deadline;
            let missed = (late.as_nanos() / self.period.as_nanos()) as u32;
            if missed > 0 {
                self.dropped += u64::from(missed);
                log::debug!("tick overran; dropping {} missed tick(s)", missed);
            }
        }

        let fired = self.next.unwrap_or(now);
        let mut next = fired + self.period;
        let now = Instant::now();
        while next <= now {
            next += self.period;
        }
        self.next = Some(next);
        !stop.is_triggered()
    }
}

/// Ticker driven by explicit `TickHandle::tick` calls.
pub struct ManualTicker {
    triggers: Receiver<()>,
    acks: Sender<()>,
    pending_ack: bool,
}

/// Fires ticks on a `ManualTicker`.
pub struct TickHandle {
    triggers: Sender<()>,
    acks: Receiver<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, TickHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        (
            Self {
                triggers: trigger_rx,
                acks: ack_tx,
                pending_ack: false,
            },
            TickHandle {
                triggers: trigger_tx,
                acks: ack_rx,
            },
        )
    }
}

impl Ticker for ManualTicker {
    fn wait(&mut self, stop: &StopSignal) -> bool {
        // Being called again means the previous tick has finished.
        if std::mem::take(&mut self.pending_ack) {
            let _ = self.acks.send(());
        }
        loop {
            if stop.is_triggered() {
                return false;
            }
            match self.triggers.recv_timeout(Duration::from_millis(20)) {
                Ok(()) => {
                    self.pending_ack = true;
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }
}

impl TickHandle {
    /// Fire one tick and wait for it to complete.
    pub fn tick(&self, timeout: Duration) -> Result<()> {
        self.triggers
            .send(())
            .map_err(|_| anyhow!("tick loop is not running"))?;
        self.acks
            .recv_timeout(timeout)
            .map_err(|_| anyhow!("tick did not complete within {:?}", timeout))
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

/// Source, compositor and publisher for one camera.
pub struct Pipeline {
    source: Box<dyn FrameSource>,
    publisher: Box<dyn FramePublisher>,
    selector: Arc<OutputSelector>,
    settings: PipelineSettings,
    /// Built once the source opens.
    compositor: Option<Compositor>,
    stats: Arc<PipelineStats>,
    failing_since: Option<Instant>,
    publish_failing: bool,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        source: Box<dyn FrameSource>,
        publisher: Box<dyn FramePublisher>,
        selector: Arc<OutputSelector>,
    ) -> Self {
        Self {
            source,
            publisher,
            selector,
            settings,
            compositor: None,
            stats: Arc::new(PipelineStats::default()),
            failing_since: None,
            publish_failing: false,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn selector(&self) -> &Arc<OutputSelector> {
        &self.selector
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn compositor(&self) -> Option<&Compositor> {
        self.compositor.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.compositor.is_some() && self.source.is_open()
    }

    /// Open the source, retrying per the configured policy.
    ///
    /// Backoff sleeps end early when `stop` fires.
    pub fn open(&mut self, stop: &StopSignal) -> Result<()> {
        let policy = self.settings.open_retry;
        let mut attempt = 0u32;
        loop {
            match self.source.open() {
                Ok(()) => break,
                Err(err) if attempt < policy.retries => {
                    attempt += 1;
                    let delay = policy.backoff(attempt);
                    log::warn!(
                        "capture open failed ({:#}); retry {}/{} in {:?}",
                        err,
                        attempt,
                        policy.retries,
                        delay
                    );
                    if stop.wait_timeout(delay) {
                        return Err(err.context("capture open cancelled"));
                    }
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "open capture {} ({} attempt(s))",
                        self.source.stats().source,
                        attempt + 1
                    )))
                }
            }
        }

        self.compositor = Some(Compositor::new(self.settings.large, self.settings.small));
        log::info!(
            "capture open: {} -> {} / {} (letterbox={}, flip={})",
            self.source.stats().source,
            self.settings.large,
            self.settings.small,
            self.settings.letterbox,
            self.settings.orient_flip
        );
        Ok(())
    }

    /// Run one acquire → compose → publish cycle.
    pub fn tick(&mut self) -> TickOutcome {
        PipelineStats::bump(&self.stats.ticks);
        let outcome = self.run_tick();
        if let TickOutcome::Skipped(_) = outcome {
            PipelineStats::bump(&self.stats.skipped);
        }
        outcome
    }

    fn run_tick(&mut self) -> TickOutcome {
        if self.compositor.is_none() {
            return TickOutcome::Skipped(SkipReason::NotOpen);
        }

        let raw = match self.source.acquire() {
            Ok(raw) if raw.is_empty() => {
                self.note_acquire_failure("empty frame");
                return TickOutcome::Skipped(SkipReason::EmptyFrame);
            }
            Ok(raw) => raw,
            Err(err) => {
                self.note_acquire_failure(&format!("{:#}", err));
                return TickOutcome::Skipped(SkipReason::Acquisition);
            }
        };
        if let Some(since) = self.failing_since.take() {
            log::info!("capture recovered after {:?}", since.elapsed());
        }
        PipelineStats::bump(&self.stats.frames_acquired);

        let Some(compositor) = self.compositor.as_ref() else {
            return TickOutcome::Skipped(SkipReason::NotOpen);
        };
        let large = match compositor.compose(&raw, self.settings.letterbox, self.settings.orient_flip) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("dropping {}x{} frame: {:#}", raw.width, raw.height, err);
                return TickOutcome::Skipped(SkipReason::Composition);
            }
        };
        drop(raw);

        // Read once per tick; a control update lands on the next tick.
        let targets = self.selector.snapshot().targets(self.settings.publish_policy);
        if targets.is_empty() {
            return TickOutcome::NothingEnabled;
        }

        let mut published = Vec::with_capacity(targets.len());
        for &channel in targets {
            let result = match channel {
                Channel::Large => self.publisher.publish(channel, &large),
                Channel::Small => {
                    let small = compositor.downscale(&large);
                    self.publisher.publish(channel, &small)
                }
            };
            match result {
                Ok(()) => {
                    if std::mem::take(&mut self.publish_failing) {
                        log::info!("publishing recovered");
                    }
                    published.push(channel);
                    PipelineStats::bump(match channel {
                        Channel::Large => &self.stats.published_large,
                        Channel::Small => &self.stats.published_small,
                    });
                }
                Err(err) => {
                    PipelineStats::bump(&self.stats.publish_errors);
                    if std::mem::replace(&mut self.publish_failing, true) {
                        log::debug!("publish to {} channel failed: {:#}", channel, err);
                    } else {
                        log::warn!("publish to {} channel failed: {:#}", channel, err);
                    }
                }
            }
        }
        TickOutcome::Published(published)
    }

    fn note_acquire_failure(&mut self, detail: &str) {
        if self.failing_since.is_none() {
            self.failing_since = Some(Instant::now());
            log::warn!("frame acquisition failed: {}; skipping ticks until it recovers", detail);
        } else {
            log::debug!("frame acquisition failed: {}", detail);
        }
    }

    /// Release the source. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.source.close();
        self.compositor = None;
    }

    fn log_health(&self, selection: OutputSelection) {
        let stats = self.stats.snapshot();
        let source = self.source.stats();
        log::info!(
            "capture health={} source={} captured={} ticks={} published large={} small={} skipped={} output={}",
            self.source.is_healthy(),
            source.source,
            source.frames_captured,
            stats.ticks,
            stats.published_large,
            stats.published_small,
            stats.skipped,
            selection
        );
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// Source not open; no ticks fire.
    Idle,
    /// Tick thread running.
    Running,
    /// Source released. Terminal.
    Stopped,
}

type TickLoop = Box<dyn FnOnce() -> Option<Pipeline> + Send>;

/// Runs a `Pipeline` on its own thread.
pub struct PipelineController {
    state: PipelineState,
    pipeline: Option<Pipeline>,
    ticker: Option<Box<dyn Ticker>>,
    worker: Option<JoinHandle<Option<Pipeline>>>,
    stop: Arc<StopSignal>,
    selector: Arc<OutputSelector>,
    stats: Arc<PipelineStats>,
}

impl PipelineController {
    pub fn new(pipeline: Pipeline, ticker: Box<dyn Ticker>) -> Self {
        Self {
            state: PipelineState::Idle,
            selector: Arc::clone(pipeline.selector()),
            stats: Arc::clone(pipeline.stats()),
            pipeline: Some(pipeline),
            ticker: Some(ticker),
            worker: None,
            stop: Arc::new(StopSignal::default()),
        }
    }

    /// Controller paced by an `IntervalTicker` at the configured tick period.
    pub fn with_interval(pipeline: Pipeline) -> Self {
        let ticker = IntervalTicker::new(pipeline.settings().tick_period);
        Self::new(pipeline, Box::new(ticker))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn selector(&self) -> Arc<OutputSelector> {
        Arc::clone(&self.selector)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal that `stop()` fires. Triggering it from another thread (a
    /// Ctrl-C handler, say) cuts short an open retry inside `start()` and ends
    /// the tick loop; `stop()` still has to be called to release the source.
    pub fn stop_signal(&self) -> Arc<StopSignal> {
        Arc::clone(&self.stop)
    }

    /// Open the source and start ticking.
    ///
    /// If the source cannot be opened, or the stop signal fires while open is
    /// being retried, the controller logs it and stays `Idle`; no ticks ever
    /// fire. That is not an error for the caller.
    pub fn start(&mut self) -> Result<PipelineState> {
        self.start_with(|body| {
            std::thread::Builder::new()
                .name("camfeed-tick".to_string())
                .spawn(body)
        })
    }

    fn start_with<F>(&mut self, spawn: F) -> Result<PipelineState>
    where
        F: FnOnce(TickLoop) -> std::io::Result<JoinHandle<Option<Pipeline>>>,
    {
        match self.state {
            PipelineState::Running => return Ok(self.state),
            PipelineState::Stopped => return Err(anyhow!("pipeline already stopped")),
            PipelineState::Idle => {}
        }
        if self.stop.is_triggered() {
            log::info!("stop requested before start; pipeline stays idle");
            return Ok(self.state);
        }
        let mut pipeline = self
            .pipeline
            .take()
            .ok_or_else(|| anyhow!("pipeline missing while idle"))?;

        if let Err(err) = pipeline.open(&self.stop) {
            if self.stop.is_triggered() {
                log::info!("{:#}", err);
            } else {
                log::error!("{:#}; pipeline stays idle", err);
            }
            self.pipeline = Some(pipeline);
            return Ok(self.state);
        }

        let ticker = match self.ticker.take() {
            Some(ticker) => ticker,
            None => {
                pipeline.close();
                self.pipeline = Some(pipeline);
                return Err(anyhow!("ticker missing while idle"));
            }
        };

        // The pipeline is handed over only once the thread exists, so a failed
        // spawn leaves it here to be closed.
        let (handoff_tx, handoff_rx) = mpsc::channel::<(Pipeline, Box<dyn Ticker>)>();
        let stop = Arc::clone(&self.stop);
        let body: TickLoop = Box::new(move || {
            let (mut pipeline, mut ticker) = handoff_rx.recv().ok()?;
            let interval = pipeline.settings().health_log_interval;
            let mut last_health = Instant::now();
            while ticker.wait(&stop) {
                pipeline.tick();
                if last_health.elapsed() >= interval {
                    pipeline.log_health(pipeline.selector().snapshot());
                    last_health = Instant::now();
                }
            }
            Some(pipeline)
        });

        match spawn(body) {
            Ok(handle) => {
                if let Err(mpsc::SendError((mut pipeline, ticker))) =
                    handoff_tx.send((pipeline, ticker))
                {
                    let _ = handle.join();
                    pipeline.close();
                    self.pipeline = Some(pipeline);
                    self.ticker = Some(ticker);
                    return Err(anyhow!("tick thread exited before start"));
                }
                self.worker = Some(handle);
                self.state = PipelineState::Running;
                log::info!("pipeline running");
                Ok(self.state)
            }
            Err(err) => {
                pipeline.close();
                self.pipeline = Some(pipeline);
                self.ticker = Some(ticker);
                Err(anyhow::Error::new(err).context("spawn tick thread"))
            }
        }
    }

    /// Stop ticking and release the source. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == PipelineState::Stopped {
            return Ok(());
        }
        self.stop.trigger();
        self.state = PipelineState::Stopped;

        let mut result = Ok(());
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(Some(pipeline)) => self.pipeline = Some(pipeline),
                Ok(None) => {}
                Err(_) => result = Err(anyhow!("pipeline tick thread panicked")),
            }
        }
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.close();
        }
        log::info!("pipeline stopped");
        result
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("pipeline shutdown: {:#}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ComposedFrame, RawFrame};
    use crate::ingest::SourceStats;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;

    enum Step {
        Frame(u32, u32),
        Empty,
        Fail,
    }

    /// Source that replays a script, then repeats its last step.
    struct ScriptedSource {
        steps: VecDeque<Step>,
        open: bool,
        open_failures: u32,
        closes: Arc<AtomicU64>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                open: false,
                open_failures: 0,
                closes: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn open(&mut self) -> Result<()> {
            if self.open_failures > 0 {
                self.open_failures -= 1;
                return Err(anyhow!("device busy"));
            }
            self.open = true;
            Ok(())
        }

        fn acquire(&mut self) -> Result<RawFrame> {
            let step = if self.steps.len() > 1 {
                self.steps.pop_front()
            } else {
                self.steps.front().map(|s| match s {
                    Step::Frame(w, h) => Step::Frame(*w, *h),
                    Step::Empty => Step::Empty,
                    Step::Fail => Step::Fail,
                })
            };
            match step {
                Some(Step::Frame(w, h)) => Ok(RawFrame::new(RgbImage::from_pixel(w, h, Rgb([50, 100, 150])))),
                Some(Step::Empty) => Ok(RawFrame::empty()),
                Some(Step::Fail) | None => Err(anyhow!("read failed")),
            }
        }

        fn close(&mut self) {
            self.open = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: 0,
                source: "scripted".to_string(),
            }
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        published: Arc<Mutex<Vec<(Channel, u32, u32)>>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(Channel, u32, u32)> {
            std::mem::take(&mut *self.published.lock().unwrap())
        }
    }

    impl FramePublisher for Recorder {
        fn publish(&self, channel: Channel, frame: &ComposedFrame) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((channel, frame.width(), frame.height()));
            Ok(())
        }
    }

    fn settings(letterbox: bool) -> PipelineSettings {
        PipelineSettings {
            large: CanvasSpec::new(640, 360),
            small: CanvasSpec::new(256, 144),
            letterbox,
            orient_flip: false,
            publish_policy: PublishPolicy::Exclusive,
            tick_period: Duration::from_millis(10),
            open_retry: OpenRetryPolicy {
                retries: 0,
                initial_backoff: Duration::from_millis(1),
            },
            health_log_interval: HEALTH_LOG_INTERVAL,
        }
    }

    fn pipeline(source: ScriptedSource, letterbox: bool) -> (Pipeline, Recorder) {
        let recorder = Recorder::default();
        let pipeline = Pipeline::new(
            settings(letterbox),
            Box::new(source),
            Box::new(recorder.clone()),
            Arc::new(OutputSelector::default()),
        );
        (pipeline, recorder)
    }

    #[test]
    fn tick_before_open_is_skipped() {
        let (mut pipeline, recorder) = pipeline(ScriptedSource::new(vec![Step::Frame(640, 360)]), false);
        assert_eq!(pipeline.tick(), TickOutcome::Skipped(SkipReason::NotOpen));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn default_selection_publishes_small() -> Result<()> {
        let (mut pipeline, recorder) = pipeline(ScriptedSource::new(vec![Step::Frame(640, 360)]), false);
        pipeline.open(&StopSignal::default())?;
        assert_eq!(pipeline.tick(), TickOutcome::Published(vec![Channel::Small]));
        assert_eq!(recorder.take(), vec![(Channel::Small, 256, 144)]);
        Ok(())
    }

    #[test]
    fn both_enabled_publishes_only_large() -> Result<()> {
        let (mut pipeline, recorder) = pipeline(ScriptedSource::new(vec![Step::Frame(704, 480)]), true);
        pipeline.open(&StopSignal::default())?;
        pipeline.selector().set(true, true);
        for _ in 0..3 {
            assert_eq!(pipeline.tick(), TickOutcome::Published(vec![Channel::Large]));
        }
        assert_eq!(recorder.take(), vec![(Channel::Large, 640, 360); 3]);
        Ok(())
    }

    #[test]
    fn dual_policy_publishes_both_sizes() -> Result<()> {
        let (mut pipeline, recorder) = pipeline(ScriptedSource::new(vec![Step::Frame(640, 360)]), false);
        pipeline.settings.publish_policy = PublishPolicy::Dual;
        pipeline.open(&StopSignal::default())?;
        pipeline.selector().set(true, true);
        pipeline.tick();
        assert_eq!(
            recorder.take(),
            vec![(Channel::Large, 640, 360), (Channel::Small, 256, 144)]
        );
        Ok(())
    }

    #[test]
    fn nothing_enabled_publishes_nothing() -> Result<()> {
        let (mut pipeline, recorder) = pipeline(ScriptedSource::new(vec![Step::Frame(640, 360)]), false);
        pipeline.open(&StopSignal::default())?;
        pipeline.selector().set(false, false);
        assert_eq!(pipeline.tick(), TickOutcome::NothingEnabled);
        assert!(recorder.take().is_empty());
        assert_eq!(pipeline.stats().snapshot().frames_acquired, 1);
        Ok(())
    }

    #[test]
    fn failed_acquisition_skips_without_side_effects() -> Result<()> {
        let source = ScriptedSource::new(vec![Step::Fail, Step::Empty, Step::Frame(640, 360)]);
        let (mut pipeline, recorder) = pipeline(source, true);
        pipeline.open(&StopSignal::default())?;
        pipeline.selector().set(true, false);

        assert_eq!(pipeline.tick(), TickOutcome::Skipped(SkipReason::Acquisition));
        assert_eq!(pipeline.tick(), TickOutcome::Skipped(SkipReason::EmptyFrame));
        assert!(recorder.take().is_empty());
        assert_eq!(pipeline.selector().snapshot(), OutputSelection::Large);
        let compositor = pipeline.compositor().expect("compositor");
        assert!(compositor.blank_canvas().iter().all(|&b| b == 0));

        assert_eq!(pipeline.tick(), TickOutcome::Published(vec![Channel::Large]));
        let stats = pipeline.stats().snapshot();
        assert_eq!((stats.ticks, stats.skipped, stats.published_large), (3, 2, 1));
        Ok(())
    }

    #[test]
    fn degenerate_frame_is_composition_skip() -> Result<()> {
        // 1x2000 collapses to zero width when letterboxed onto 360 rows.
        let (mut pipeline, recorder) = pipeline(ScriptedSource::new(vec![Step::Frame(1, 2000)]), true);
        pipeline.open(&StopSignal::default())?;
        assert_eq!(pipeline.tick(), TickOutcome::Skipped(SkipReason::Composition));
        assert!(recorder.take().is_empty());
        Ok(())
    }

    #[test]
    fn open_retries_then_succeeds() -> Result<()> {
        let mut source = ScriptedSource::new(vec![Step::Frame(640, 360)]);
        source.open_failures = 2;
        let (mut pipeline, _) = pipeline(source, false);
        pipeline.settings.open_retry.retries = 2;
        pipeline.open(&StopSignal::default())?;
        assert!(pipeline.is_open());
        Ok(())
    }

    #[test]
    fn open_without_retries_fails_once() {
        let mut source = ScriptedSource::new(vec![Step::Frame(640, 360)]);
        source.open_failures = 1;
        let (mut pipeline, _) = pipeline(source, false);
        assert!(pipeline.open(&StopSignal::default()).is_err());
        assert!(pipeline.compositor().is_none());
    }

    #[test]
    fn controller_stays_idle_when_open_fails() -> Result<()> {
        let mut source = ScriptedSource::new(vec![Step::Frame(640, 360)]);
        source.open_failures = u32::MAX;
        let (pipeline, recorder) = pipeline(source, false);
        let (ticker, handle) = ManualTicker::new();
        let mut controller = PipelineController::new(pipeline, Box::new(ticker));

        assert_eq!(controller.start()?, PipelineState::Idle);
        assert!(handle.tick(Duration::from_millis(100)).is_err());
        assert!(recorder.take().is_empty());
        assert_eq!(controller.stats().ticks, 0);
        controller.stop()?;
        assert_eq!(controller.state(), PipelineState::Stopped);
        Ok(())
    }

    #[test]
    fn controller_runs_ticks_and_stops_once() -> Result<()> {
        let source = ScriptedSource::new(vec![Step::Frame(704, 480)]);
        let closes = Arc::clone(&source.closes);
        let (pipeline, recorder) = pipeline(source, true);
        let (ticker, handle) = ManualTicker::new();
        let mut controller = PipelineController::new(pipeline, Box::new(ticker));

        assert_eq!(controller.start()?, PipelineState::Running);
        handle.tick(Duration::from_secs(5))?;
        controller.selector().set(true, false);
        handle.tick(Duration::from_secs(5))?;

        assert_eq!(
            recorder.take(),
            vec![(Channel::Small, 256, 144), (Channel::Large, 640, 360)]
        );

        controller.stop()?;
        controller.stop()?;
        assert_eq!(controller.state(), PipelineState::Stopped);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(controller.start().is_err());
        Ok(())
    }

    #[test]
    fn stop_signal_cuts_open_retries_short() -> Result<()> {
        let mut source = ScriptedSource::new(vec![Step::Frame(640, 360)]);
        source.open_failures = u32::MAX;
        let (mut pipeline, _) = pipeline(source, false);
        pipeline.settings.open_retry = OpenRetryPolicy {
            retries: 10,
            initial_backoff: Duration::from_secs(30),
        };
        let (ticker, _handle) = ManualTicker::new();
        let mut controller = PipelineController::new(pipeline, Box::new(ticker));

        let signal = controller.stop_signal();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            signal.trigger();
        });
        let started = Instant::now();
        assert_eq!(controller.start()?, PipelineState::Idle);
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();

        controller.stop()?;
        assert_eq!(controller.state(), PipelineState::Stopped);
        assert_eq!(controller.stats().ticks, 0);
        Ok(())
    }

    #[test]
    fn failed_spawn_closes_source_and_allows_restart() -> Result<()> {
        let source = ScriptedSource::new(vec![Step::Frame(640, 360)]);
        let closes = Arc::clone(&source.closes);
        let (pipeline, recorder) = pipeline(source, false);
        let (ticker, handle) = ManualTicker::new();
        let mut controller = PipelineController::new(pipeline, Box::new(ticker));

        let err = controller
            .start_with(|_| Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads")))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("no threads"));
        assert_eq!(controller.state(), PipelineState::Idle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        assert_eq!(controller.start()?, PipelineState::Running);
        handle.tick(Duration::from_secs(5))?;
        assert_eq!(recorder.take(), vec![(Channel::Small, 256, 144)]);
        controller.stop()?;
        Ok(())
    }

    #[test]
    fn interval_ticker_drops_missed_deadlines() {
        let stop = StopSignal::default();
        let mut ticker = IntervalTicker::new(Duration::from_millis(5));
        assert!(ticker.wait(&stop));
        std::thread::sleep(Duration::from_millis(30));
        assert!(ticker.wait(&stop));
        assert!(ticker.dropped() >= 4);
    }

    #[test]
    fn interval_ticker_stops_promptly() {
        let stop = Arc::new(StopSignal::default());
        let mut ticker = IntervalTicker::new(Duration::from_secs(60));
        assert!(ticker.wait(&stop));

        let trigger = Arc::clone(&stop);
        let started = Instant::now();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });
        assert!(!ticker.wait(&stop));
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }
}
