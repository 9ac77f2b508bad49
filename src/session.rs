//! Façade over the external audio/video synchronization engine.
//!
//! The engine itself is an opaque service reached through the [`SyncEngine`]
//! trait; the [`SyncSession`] wraps it with the ordering rules a session
//! instance demands: a strict subset of properties may only be set before the
//! session is bound, the rest are staged while unbound and flushed once right
//! after bind, and every query before a successful bind reports
//! [`Error::EngineNotReady`] instead of failing hard.
//!
//! All engine-facing timestamps are microseconds.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use once_cell::sync::OnceCell;

use log::{debug, info, warn};

use std::sync::{Arc, Mutex};

use crate::{Error, Result};

/// Substitute for a literal zero anchor pts; some engines treat zero as
/// "unset".
const ANCHOR_PTS_EPSILON_US: i64 = 1;

/// Clock-master selection for a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SyncMode {
    /// Video is the master clock.
    Vmaster = 0,
    /// Audio is the master clock.
    Amaster = 1,
    /// The transport stream PCR is the master clock.
    Pcrmaster = 2,
}

/// Verdict of the engine's per-frame policy query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SyncPolicy {
    /// Present the frame at the accompanying target time.
    NormalOutput = 0,
    /// Keep the frame queued and ask again after the accompanying duration.
    Hold = 1,
    /// Discard the frame without presenting it.
    Drop = 2,
}

/// Policy verdict plus its timing parameters.
///
/// `param1` carries the target display wall-clock time for
/// [`SyncPolicy::NormalOutput`] and the hold duration for
/// [`SyncPolicy::Hold`], both in microseconds. `param2` is reserved by the
/// engine and carried through untouched.
#[derive(Debug, Clone, Copy)]
pub struct PolicyDecision {
    pub policy: SyncPolicy,
    pub param1: i64,
    pub param2: i64,
}

/// Post-bind session parameters forwarded through
/// [`SyncEngine::set_parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineParam {
    HasAudio,
    SourceType,
    WorkMode,
    StartThreshold,
    DisplayLatency,
    PlayerInstanceId,
}

/// The call contract of the external synchronization engine.
///
/// Implementations wrap whatever the platform provides (an ioctl surface, a
/// vendor library, a test double). Every method takes `&self`; the engine is
/// expected to be internally synchronized.
pub trait SyncEngine: Send + Sync {
    /// Binds a session instance for the given demux/pcr pair, returning the
    /// instance id used by every other call.
    fn bind_instance(&self, demux_id: i32, pcr_id: i32) -> Result<i32>;

    /// Selects the clock master.
    fn set_mode(&self, instance: i32, mode: SyncMode) -> Result<()>;

    /// Applies one scalar session parameter.
    fn set_parameter(&self, instance: i32, param: EngineParam, value: i64) -> Result<()>;

    /// Forwards a demux-observed video frame for internal bookkeeping.
    fn queue_frame(&self, instance: i32, pts_us: i64, size: usize) -> Result<()>;

    /// Declares that `pts_us` corresponds to the current wall-clock instant,
    /// establishing the media-time to wall-clock mapping.
    fn anchor(&self, instance: i32, pts_us: i64) -> Result<()>;

    /// Estimated wall-clock display time for a pts, or
    /// [`Error::EngineNotReady`] when no estimate is available yet.
    fn estimated_realtime(&self, instance: i32, pts_us: i64) -> Result<i64>;

    /// Wall-clock time of the next vertical sync.
    fn next_vsync_wallclock(&self, instance: i32) -> Result<i64>;

    /// Asks the engine what to do with the frame at `pts_us`, given the last
    /// displayed frame's `last_pts_us` (negative when nothing was shown yet).
    fn process_policy(&self, instance: i32, pts_us: i64, last_pts_us: i64)
        -> Result<PolicyDecision>;

    /// Resets engine-side pacing state; called on flush.
    fn reset(&self, instance: i32) -> Result<()>;

    /// Pts of the first audio frame the engine has seen, or
    /// [`Error::EngineNotReady`] when the audio anchor is not established.
    fn first_audio_pts(&self, instance: i32) -> Result<i64>;

    /// Pts of the audio frame currently playing.
    fn current_audio_pts(&self, instance: i32) -> Result<i64>;
}

#[derive(Debug, Clone, Copy)]
struct Staged {
    value: i64,
    changed: bool,
}

impl Staged {
    const fn new(value: i64) -> Self {
        Self {
            value,
            changed: false,
        }
    }

    fn set(&mut self, value: i64) {
        self.value = value;
        self.changed = true;
    }
}

/// Scalar session properties, staged until the session binds.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    sync_mode: SyncMode,
    tunnel_mode: bool,
    demux_id: i32,
    pcr_id: i32,
    has_audio: Staged,
    source_type: Staged,
    work_mode: Staged,
    start_threshold: Staged,
    display_latency: Staged,
    player_instance_id: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Vmaster,
            tunnel_mode: false,
            demux_id: -1,
            pcr_id: -1,
            has_audio: Staged::new(0),
            source_type: Staged::new(0),
            work_mode: Staged::new(0),
            start_threshold: Staged::new(0),
            display_latency: Staged::new(0),
            player_instance_id: 0,
        }
    }
}

/// Wraps a [`SyncEngine`] with session lifecycle and property ordering rules.
///
/// Safe to share between the owning thread (property setters) and the
/// scheduler worker (queries); each method holds the internal lock only for
/// its own duration.
pub struct SyncSession {
    engine: Arc<dyn SyncEngine>,
    instance: OnceCell<i32>,
    config: Mutex<SessionConfig>,
}

impl SyncSession {
    /// Creates an unbound session over the given engine.
    pub fn new(engine: Arc<dyn SyncEngine>) -> Self {
        Self {
            engine,
            instance: OnceCell::new(),
            config: Mutex::new(SessionConfig::default()),
        }
    }

    /// Whether the session has been bound to an engine instance.
    pub fn is_bound(&self) -> bool {
        self.instance.get().is_some()
    }

    fn instance(&self) -> Result<i32> {
        self.instance.get().copied().ok_or(Error::EngineNotReady)
    }

    /// Selects the tunnel-mode pacing algorithm. Only effective before bind;
    /// afterwards the call is ignored with a warning.
    pub fn set_tunnel_mode(&self, on: bool) {
        if self.is_bound() {
            warn!("set_tunnel_mode({on}) after bind has no effect");
            return;
        }
        self.config.lock().unwrap().tunnel_mode = on;
    }

    /// Whether the tunnel-mode algorithm is selected.
    pub fn tunnel_mode(&self) -> bool {
        self.config.lock().unwrap().tunnel_mode
    }

    /// Associates the session with a player instance. Only effective before
    /// bind.
    pub fn set_player_instance_id(&self, id: i64) {
        if self.is_bound() {
            warn!("set_player_instance_id({id}) after bind has no effect");
            return;
        }
        self.config.lock().unwrap().player_instance_id = id;
    }

    /// Player instance id the session was (or will be) bound with.
    pub fn player_instance_id(&self) -> i64 {
        self.config.lock().unwrap().player_instance_id
    }

    /// Records the demux/pcr identifiers used at bind time.
    pub fn set_stream_ids(&self, demux_id: i32, pcr_id: i32) {
        let mut config = self.config.lock().unwrap();
        config.demux_id = demux_id;
        config.pcr_id = pcr_id;
    }

    /// Demux/pcr identifiers used at bind time.
    pub fn stream_ids(&self) -> (i32, i32) {
        let config = self.config.lock().unwrap();
        (config.demux_id, config.pcr_id)
    }

    /// Selects the clock master. Applied immediately when bound, staged
    /// otherwise.
    pub fn set_sync_mode(&self, mode: SyncMode) -> Result<()> {
        self.config.lock().unwrap().sync_mode = mode;
        if let Ok(instance) = self.instance() {
            self.engine.set_mode(instance, mode)?;
        }
        Ok(())
    }

    /// The currently effective clock master.
    pub fn sync_mode(&self) -> SyncMode {
        self.config.lock().unwrap().sync_mode
    }

    /// Binds the session exactly once, then flushes the staged properties.
    ///
    /// A second call does not rebind; it logs and returns the existing
    /// instance id.
    pub fn alloc_and_bind_instance(&self, demux_id: i32, pcr_id: i32) -> Result<i32> {
        if let Some(existing) = self.instance.get() {
            warn!("session already bound to instance {existing}");
            return Ok(*existing);
        }

        let instance = *self
            .instance
            .get_or_try_init(|| self.engine.bind_instance(demux_id, pcr_id))?;
        info!("bound sync session instance {instance} (demux {demux_id}, pcr {pcr_id})");

        // Snapshot under the lock, apply outside it: set_parameter may call
        // back into a slow engine.
        let (mode, player_id, pending) = {
            let mut guard = self.config.lock().unwrap();
            let config = &mut *guard;
            config.demux_id = demux_id;
            config.pcr_id = pcr_id;
            let mut pending = Vec::new();
            for (param, staged) in [
                (EngineParam::HasAudio, &mut config.has_audio),
                (EngineParam::SourceType, &mut config.source_type),
                (EngineParam::WorkMode, &mut config.work_mode),
                (EngineParam::StartThreshold, &mut config.start_threshold),
                (EngineParam::DisplayLatency, &mut config.display_latency),
            ] {
                if staged.changed {
                    pending.push((param, staged.value));
                    staged.changed = false;
                }
            }
            (config.sync_mode, config.player_instance_id, pending)
        };

        self.engine
            .set_parameter(instance, EngineParam::PlayerInstanceId, player_id)?;
        self.engine.set_mode(instance, mode)?;
        for (param, value) in pending {
            debug!("flushing staged {param:?} = {value}");
            self.engine.set_parameter(instance, param, value)?;
        }

        Ok(instance)
    }

    fn set_staged(
        &self,
        param: EngineParam,
        value: i64,
        pick: impl Fn(&mut SessionConfig) -> &mut Staged,
    ) -> Result<()> {
        pick(&mut self.config.lock().unwrap()).set(value);
        if let Ok(instance) = self.instance() {
            self.engine.set_parameter(instance, param, value)?;
            pick(&mut self.config.lock().unwrap()).changed = false;
        }
        Ok(())
    }

    fn staged_value(&self, pick: impl FnOnce(&SessionConfig) -> &Staged) -> i64 {
        pick(&self.config.lock().unwrap()).value
    }

    /// Tells the engine whether an audio track accompanies the video.
    pub fn set_has_audio(&self, value: i64) -> Result<()> {
        self.set_staged(EngineParam::HasAudio, value, |c| &mut c.has_audio)
    }

    pub fn has_audio(&self) -> i64 {
        self.staged_value(|c| &c.has_audio)
    }

    /// Declares the media source type (live broadcast, local file, ...).
    pub fn set_source_type(&self, value: i64) -> Result<()> {
        self.set_staged(EngineParam::SourceType, value, |c| &mut c.source_type)
    }

    pub fn source_type(&self) -> i64 {
        self.staged_value(|c| &c.source_type)
    }

    /// Selects the engine work mode.
    pub fn set_work_mode(&self, value: i64) -> Result<()> {
        self.set_staged(EngineParam::WorkMode, value, |c| &mut c.work_mode)
    }

    pub fn work_mode(&self) -> i64 {
        self.staged_value(|c| &c.work_mode)
    }

    /// Sets the buffering threshold before playback starts.
    pub fn set_start_threshold(&self, value: i64) -> Result<()> {
        self.set_staged(EngineParam::StartThreshold, value, |c| {
            &mut c.start_threshold
        })
    }

    pub fn start_threshold(&self) -> i64 {
        self.staged_value(|c| &c.start_threshold)
    }

    /// Reports the downstream display latency to the engine.
    pub fn set_display_latency(&self, value: i64) -> Result<()> {
        self.set_staged(EngineParam::DisplayLatency, value, |c| {
            &mut c.display_latency
        })
    }

    pub fn display_latency(&self) -> i64 {
        self.staged_value(|c| &c.display_latency)
    }

    /// Forwards a demux-observed pts for engine bookkeeping. Tunnel mode
    /// only; a no-op error before bind.
    pub fn queue_video_frame(&self, pts_us: i64, size: usize) -> Result<()> {
        if !self.tunnel_mode() {
            return Ok(());
        }
        self.engine.queue_frame(self.instance()?, pts_us, size)
    }

    /// Anchors the session at `pts_us`, substituting a small positive epsilon
    /// for a literal zero. Some engines special-case a zero anchor pts as
    /// "unset".
    pub fn anchor_at(&self, pts_us: i64) -> Result<()> {
        let pts_us = if pts_us <= 0 {
            ANCHOR_PTS_EPSILON_US
        } else {
            pts_us
        };
        self.engine.anchor(self.instance()?, pts_us)
    }

    /// Estimated wall-clock display time for `pts_us`.
    pub fn estimated_realtime(&self, pts_us: i64) -> Result<i64> {
        self.engine.estimated_realtime(self.instance()?, pts_us)
    }

    /// Wall-clock time of the next vertical sync.
    pub fn next_vsync_wallclock(&self) -> Result<i64> {
        self.engine.next_vsync_wallclock(self.instance()?)
    }

    /// Policy query for the head frame.
    pub fn process_policy(&self, pts_us: i64, last_pts_us: i64) -> Result<PolicyDecision> {
        self.engine
            .process_policy(self.instance()?, pts_us, last_pts_us)
    }

    /// Resets engine-side pacing state.
    pub fn reset(&self) -> Result<()> {
        self.engine.reset(self.instance()?)
    }

    /// Pts of the first audio frame, when the audio anchor exists.
    pub fn first_audio_pts(&self) -> Result<i64> {
        self.engine.first_audio_pts(self.instance()?)
    }

    /// Pts of the currently playing audio frame.
    pub fn current_audio_pts(&self) -> Result<i64> {
        self.engine.current_audio_pts(self.instance()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct RecordingEngine {
        bound: AtomicI32,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingEngine {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SyncEngine for RecordingEngine {
        fn bind_instance(&self, demux_id: i32, pcr_id: i32) -> Result<i32> {
            self.bound.fetch_add(1, Ordering::SeqCst);
            self.record(format!("bind({demux_id},{pcr_id})"));
            Ok(17)
        }

        fn set_mode(&self, instance: i32, mode: SyncMode) -> Result<()> {
            self.record(format!("mode({instance},{mode:?})"));
            Ok(())
        }

        fn set_parameter(&self, instance: i32, param: EngineParam, value: i64) -> Result<()> {
            self.record(format!("param({instance},{param:?},{value})"));
            Ok(())
        }

        fn queue_frame(&self, _instance: i32, pts_us: i64, _size: usize) -> Result<()> {
            self.record(format!("queue({pts_us})"));
            Ok(())
        }

        fn anchor(&self, _instance: i32, pts_us: i64) -> Result<()> {
            self.record(format!("anchor({pts_us})"));
            Ok(())
        }

        fn estimated_realtime(&self, _instance: i32, pts_us: i64) -> Result<i64> {
            Ok(pts_us)
        }

        fn next_vsync_wallclock(&self, _instance: i32) -> Result<i64> {
            Ok(0)
        }

        fn process_policy(
            &self,
            _instance: i32,
            pts_us: i64,
            _last_pts_us: i64,
        ) -> Result<PolicyDecision> {
            Ok(PolicyDecision {
                policy: SyncPolicy::NormalOutput,
                param1: pts_us,
                param2: 0,
            })
        }

        fn reset(&self, instance: i32) -> Result<()> {
            self.record(format!("reset({instance})"));
            Ok(())
        }

        fn first_audio_pts(&self, _instance: i32) -> Result<i64> {
            Err(Error::EngineNotReady)
        }

        fn current_audio_pts(&self, _instance: i32) -> Result<i64> {
            Err(Error::EngineNotReady)
        }
    }

    #[test]
    fn queries_before_bind_report_not_ready() {
        let session = SyncSession::new(Arc::new(RecordingEngine::default()));
        assert!(matches!(
            session.estimated_realtime(1000),
            Err(Error::EngineNotReady)
        ));
        assert!(matches!(
            session.process_policy(1000, -1),
            Err(Error::EngineNotReady)
        ));
        assert!(matches!(session.reset(), Err(Error::EngineNotReady)));
    }

    #[test]
    fn bind_happens_once() {
        let engine = Arc::new(RecordingEngine::default());
        let session = SyncSession::new(engine.clone());

        assert_eq!(session.alloc_and_bind_instance(2, 0).unwrap(), 17);
        assert_eq!(session.alloc_and_bind_instance(9, 9).unwrap(), 17);
        assert_eq!(engine.bound.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn staged_properties_flush_at_bind() {
        let engine = Arc::new(RecordingEngine::default());
        let session = SyncSession::new(engine.clone());

        session.set_has_audio(1).unwrap();
        session.set_display_latency(16_000).unwrap();
        assert!(engine.calls().is_empty());

        session.alloc_and_bind_instance(0, 0).unwrap();
        let calls = engine.calls();
        assert!(calls.contains(&"param(17,HasAudio,1)".to_string()));
        assert!(calls.contains(&"param(17,DisplayLatency,16000)".to_string()));
    }

    #[test]
    fn post_bind_setter_applies_immediately() {
        let engine = Arc::new(RecordingEngine::default());
        let session = SyncSession::new(engine.clone());
        session.alloc_and_bind_instance(0, 0).unwrap();

        session.set_work_mode(2).unwrap();
        assert!(engine
            .calls()
            .contains(&"param(17,WorkMode,2)".to_string()));
    }

    #[test]
    fn tunnel_mode_is_pre_bind_only() {
        let session = SyncSession::new(Arc::new(RecordingEngine::default()));
        session.set_tunnel_mode(true);
        assert!(session.tunnel_mode());

        session.alloc_and_bind_instance(0, 0).unwrap();
        session.set_tunnel_mode(false);
        assert!(session.tunnel_mode());
    }

    #[test]
    fn anchor_substitutes_epsilon_for_zero() {
        let engine = Arc::new(RecordingEngine::default());
        let session = SyncSession::new(engine.clone());
        session.alloc_and_bind_instance(0, 0).unwrap();

        session.anchor_at(0).unwrap();
        assert!(engine.calls().iter().any(|c| c == "anchor(1)"));
    }

    #[test]
    fn queue_video_frame_is_tunnel_only() {
        let engine = Arc::new(RecordingEngine::default());
        let session = SyncSession::new(engine.clone());
        session.alloc_and_bind_instance(0, 0).unwrap();

        session.queue_video_frame(1000, 64).unwrap();
        assert!(!engine.calls().iter().any(|c| c.starts_with("queue")));
    }
}
