//! Producer/consumer rendezvous between the emulation worker and the host's
//! render and audio threads.
//!
//! The channel is two independent mutex/condvar pairs. The video side is a
//! bounded rendezvous with backpressure: the worker posts each completed
//! frame and, when video sync is on, blocks until a consumer claims it. The
//! audio side only arbitrates refill of the sample ring buffer owned by the
//! core: the producer blocks when the buffer is full until the consumer
//! signals that it drained it.
//!
//! Callers must never hold a sync guard while calling into the supervisor's
//! lifecycle operations; the state machine briefly takes these mutexes when
//! it needs to shake loose a blocked producer or consumer.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Consumers give up on a frame after this long so a stalled producer (e.g.
/// a paused worker) cannot freeze the UI loop.
pub const FRAME_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

pub(crate) struct VideoSync {
    /// Rendering enabled. Cleared on pause and shutdown.
    frame_on: bool,
    /// Producer blocks for each frame to be claimed (video sync / VSync).
    frame_wait: bool,
    /// Remaining frames to drop before the next one is worth signaling.
    /// Chosen by the consumer, decremented by the producer.
    frame_skip: i32,
    /// Frames produced but not yet claimed.
    frame_pending: u32,
}

pub(crate) struct AudioSync {
    /// Producer blocks when the sample buffer is full (audio sync).
    wait: bool,
    /// The consumer drained the buffer since the producer last filled it.
    /// This is the wait predicate for `produce`; the shutdown/interrupt
    /// nudge also sets it to release a blocked producer.
    room: bool,
}

pub struct SyncChannel {
    video: Mutex<VideoSync>,
    video_frame_available: Condvar,
    video_frame_required: Condvar,
    audio: Mutex<AudioSync>,
    audio_required: Condvar,
}

/// Consumer's claim on the video channel, returned by
/// [`SyncChannel::wait_frame_start`]. The video mutex is held for the guard's
/// whole lifetime, on the unavailable paths too; dropping the guard ends the
/// consumer's critical section (the `wait_frame_end` of the protocol).
pub struct FrameGuard<'a> {
    video: MutexGuard<'a, VideoSync>,
    available: bool,
}

impl FrameGuard<'_> {
    /// A frame was claimed and may be read until the guard is dropped.
    #[inline]
    pub fn available(&self) -> bool {
        self.available
    }

    /// The claimed frame is not one the consumer asked to skip.
    #[inline]
    pub fn drawing(&self) -> bool {
        self.video.frame_skip <= 0
    }
}

/// Consumer's or producer's hold on the audio buffer mutex, bracketing ring
/// buffer access. Drop to release without signaling.
pub struct AudioGuard<'a> {
    audio: MutexGuard<'a, AudioSync>,
    chan: &'a SyncChannel,
}

impl<'a> AudioGuard<'a> {
    /// Producer side: the core just refilled its sample buffer. When audio
    /// sync is on and `wait` is requested, block until the consumer signals
    /// that it drained the buffer, then release the mutex.
    pub fn produce(self, wait: bool) {
        let AudioGuard { mut audio, chan } = self;
        while audio.wait && wait && !audio.room {
            audio = chan.audio_required.wait(audio).unwrap();
        }
        audio.room = false;
    }

    /// Consumer side: the buffer was drained; release a blocked producer and
    /// the mutex.
    pub fn consume(self) {
        let AudioGuard { mut audio, chan } = self;
        audio.room = true;
        chan.audio_required.notify_all();
    }
}

impl Default for SyncChannel {
    fn default() -> SyncChannel {
        SyncChannel::new()
    }
}

impl SyncChannel {
    pub fn new() -> SyncChannel {
        SyncChannel {
            video: Mutex::new(VideoSync {
                frame_on: true,
                frame_wait: false,
                frame_skip: 0,
                frame_pending: 0,
            }),
            video_frame_available: Condvar::new(),
            video_frame_required: Condvar::new(),
            audio: Mutex::new(AudioSync {
                wait: false,
                room: false,
            }),
            audio_required: Condvar::new(),
        }
    }

    /// Producer side: a frame is complete. Non-skipped frames are announced
    /// to consumers; with video sync on the producer then blocks until the
    /// frame is claimed (`frame_pending` back to zero) or video sync is
    /// turned off under it.
    pub fn post_frame(&self) {
        let mut video = self.video.lock().unwrap();
        video.frame_pending += 1;
        video.frame_skip -= 1;
        if video.frame_skip < 0 {
            loop {
                self.video_frame_available.notify_all();
                if video.frame_wait {
                    video = self.video_frame_required.wait(video).unwrap();
                }
                if !(video.frame_wait && video.frame_pending > 0) {
                    break;
                }
            }
        }
    }

    /// Consumer side: claim the next frame, releasing a producer blocked in
    /// [`post_frame`](SyncChannel::post_frame) first. Returns an unavailable
    /// guard when the channel is dry and disabled, or when no frame shows up
    /// within [`FRAME_WAIT_TIMEOUT`]. On success the pending count is
    /// cleared and the producer is told to drop the next `frameskip` frames.
    pub fn wait_frame_start(&self, frameskip: i32) -> FrameGuard<'_> {
        let mut video = self.video.lock().unwrap();
        self.video_frame_required.notify_all();
        if !video.frame_on && video.frame_pending == 0 {
            return FrameGuard {
                video,
                available: false,
            };
        }
        if video.frame_on {
            let (guard, timeout) = self
                .video_frame_available
                .wait_timeout(video, FRAME_WAIT_TIMEOUT)
                .unwrap();
            video = guard;
            if timeout.timed_out() {
                return FrameGuard {
                    video,
                    available: false,
                };
            }
        }
        video.frame_pending = 0;
        video.frame_skip = frameskip;
        FrameGuard {
            video,
            available: true,
        }
    }

    /// Consumer side: stop claiming frames without tearing the channel down.
    pub fn suspend_drawing(&self) {
        self.change_video_sync(false);
    }

    pub fn resume_drawing(&self) {
        self.change_video_sync(true);
    }

    /// Producer or consumer side: bracket access to the sample ring buffer.
    pub fn lock_audio(&self) -> AudioGuard<'_> {
        AudioGuard {
            audio: self.audio.lock().unwrap(),
            chan: self,
        }
    }

    // Make sure consumers can process events while the worker is paused.
    pub(crate) fn change_video_sync(&self, frame_on: bool) {
        let mut video = self.video.lock().unwrap();
        if video.frame_on != frame_on {
            video.frame_on = frame_on;
            self.video_frame_available.notify_all();
        }
    }

    /// Apply the configured sync modes and reset the frame counters for a
    /// fresh run.
    pub(crate) fn prepare_start(&self, video_wait: bool, audio_wait: bool) {
        {
            let mut video = self.video.lock().unwrap();
            video.frame_on = true;
            video.frame_wait = video_wait;
            video.frame_skip = 0;
            video.frame_pending = 0;
        }
        let mut audio = self.audio.lock().unwrap();
        audio.wait = audio_wait;
        audio.room = false;
    }

    /// Part of the `wait_until_not_state` dance: video sync is parked while
    /// the state machine spins so a blocked producer can drain out of
    /// `post_frame`. Returns the previous setting for restoration.
    pub(crate) fn suspend_video_wait(&self) -> bool {
        let mut video = self.video.lock().unwrap();
        let was_waiting = video.frame_wait;
        video.frame_wait = false;
        was_waiting
    }

    pub(crate) fn restore_video_wait(&self, frame_wait: bool) {
        self.video.lock().unwrap().frame_wait = frame_wait;
    }

    /// Wake anything blocked on either side so it re-checks its predicate.
    /// Counts as a drain signal for the audio producer.
    pub(crate) fn nudge(&self) {
        {
            let _video = self.video.lock().unwrap();
            self.video_frame_required.notify_all();
        }
        let mut audio = self.audio.lock().unwrap();
        audio.room = true;
        self.audio_required.notify_all();
    }

    /// The `End` wake storm: clear every wait flag and wake every condition
    /// so blocked producers and consumers all exit promptly.
    pub(crate) fn end_wakeup(&self) {
        {
            let mut audio = self.audio.lock().unwrap();
            audio.wait = false;
            self.audio_required.notify_all();
        }
        let mut video = self.video.lock().unwrap();
        video.frame_wait = false;
        video.frame_on = false;
        self.video_frame_required.notify_all();
        self.video_frame_available.notify_all();
    }

    /// Final wake after the worker tore the core down, so any consumer still
    /// parked in `wait_frame_start` or on the audio mutex returns.
    pub(crate) fn teardown_wakeup(&self) {
        {
            let mut video = self.video.lock().unwrap();
            video.frame_on = false;
            self.video_frame_available.notify_all();
        }
        let _audio = self.audio.lock().unwrap();
        self.audio_required.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn video_snapshot(&self) -> (bool, bool, i32, u32) {
        let video = self.video.lock().unwrap();
        (
            video.frame_on,
            video.frame_wait,
            video.frame_skip,
            video.frame_pending,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_frame_start_times_out_without_producer() {
        let chan = SyncChannel::new();
        chan.prepare_start(false, false);

        let start = Instant::now();
        let frame = chan.wait_frame_start(0);
        assert!(!frame.available());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }

    #[test]
    fn test_wait_frame_start_dry_and_disabled_returns_immediately() {
        let chan = SyncChannel::new();
        chan.prepare_start(false, false);
        chan.suspend_drawing();

        let start = Instant::now();
        let frame = chan.wait_frame_start(0);
        assert!(!frame.available());
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[test]
    fn test_post_frame_without_video_sync_never_blocks() {
        let chan = SyncChannel::new();
        chan.prepare_start(false, false);
        for _ in 0..3 {
            chan.post_frame();
        }
        let (_, _, skip, pending) = chan.video_snapshot();
        assert_eq!(pending, 3);
        assert_eq!(skip, -3);
    }

    #[test]
    fn test_frameskip_claim_marks_frames_skipped() {
        let chan = SyncChannel::new();
        chan.prepare_start(false, false);
        chan.suspend_drawing();
        chan.post_frame();

        // A pending frame can still be claimed while drawing is suspended.
        let frame = chan.wait_frame_start(2);
        assert!(frame.available());
        assert!(!frame.drawing());
        drop(frame);

        chan.post_frame();
        chan.post_frame();
        let (_, _, skip, _) = chan.video_snapshot();
        assert_eq!(skip, 0);

        chan.post_frame();
        let frame = chan.wait_frame_start(0);
        assert!(frame.available());
        assert!(frame.drawing());
    }

    #[test]
    fn test_video_sync_rendezvous() {
        let chan = Arc::new(SyncChannel::new());
        chan.prepare_start(true, false);

        let producer = {
            let chan = chan.clone();
            thread::spawn(move || {
                for _ in 0..4 {
                    chan.post_frame();
                }
            })
        };

        let mut claimed = 0;
        while claimed < 4 {
            let frame = chan.wait_frame_start(0);
            if frame.available() {
                claimed += 1;
            }
        }
        // The producer of the last frame is parked until the next wait cycle
        // signals that the frame was claimed.
        let _ = chan.wait_frame_start(0);
        producer.join().unwrap();
        assert_eq!(claimed, 4);
    }

    #[test]
    fn test_end_wakeup_releases_blocked_producer() {
        let chan = Arc::new(SyncChannel::new());
        chan.prepare_start(true, false);

        let producer = {
            let chan = chan.clone();
            thread::spawn(move || {
                chan.post_frame();
            })
        };

        thread::sleep(Duration::from_millis(20));
        chan.end_wakeup();
        producer.join().unwrap();
    }

    #[test]
    fn test_audio_produce_waits_for_consume() {
        let chan = Arc::new(SyncChannel::new());
        chan.prepare_start(false, true);

        let producer = {
            let chan = chan.clone();
            thread::spawn(move || {
                let start = Instant::now();
                chan.lock_audio().produce(true);
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(30));
        chan.lock_audio().consume();
        let waited = producer.join().unwrap();
        assert!(waited >= Duration::from_millis(20), "{:?}", waited);
    }

    #[test]
    fn test_audio_produce_skips_wait_when_sync_off() {
        let chan = SyncChannel::new();
        chan.prepare_start(false, false);
        chan.lock_audio().produce(true);
        chan.lock_audio().produce(false);
    }
}
