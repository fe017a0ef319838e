//! Joins the lanes of one transcode run.
//!
//! Each lane sets its bit when it finishes. The lane whose bit completes the
//! set runs the finalizer; a failure poisons the set so finalization can no
//! longer happen. Both transitions go through a single `fetch_or`, so the
//! finalizer runs at most once no matter how the lanes race.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::lane::LaneKind;

const VIDEO: u8 = 1 << 0;
const AUDIO: u8 = 1 << 1;
const FAILED: u8 = 1 << 2;

type Finalizer = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Active,
    Finished,
}

pub struct CompletionSynchronizer {
    state: AtomicU8,
    required: u8,
    audio_present: bool,
    finalizer: Mutex<Option<Finalizer>>,
    finalized: AtomicBool,
}

impl CompletionSynchronizer {
    /// Without an audio lane the audio bit starts set, so only the video lane
    /// has to finish.
    pub fn new(audio_present: bool, finalizer: impl FnOnce() + Send + 'static) -> Self {
        let initial = if audio_present { 0 } else { AUDIO };
        Self {
            state: AtomicU8::new(initial),
            required: VIDEO | AUDIO,
            audio_present,
            finalizer: Mutex::new(Some(Box::new(finalizer))),
            finalized: AtomicBool::new(false),
        }
    }

    fn bit(lane: LaneKind) -> u8 {
        match lane {
            LaneKind::Video => VIDEO,
            LaneKind::Audio => AUDIO,
        }
    }

    /// Records that `lane` finished. Returns true if this call ran the finalizer.
    pub fn mark_finished(&self, lane: LaneKind) -> bool {
        let bit = Self::bit(lane);
        if lane == LaneKind::Audio && !self.audio_present {
            log::warn!("{} lane finished but was never expected", lane);
            return false;
        }

        let prev = self.state.fetch_or(bit, Ordering::AcqRel);
        if prev & FAILED != 0 {
            log::debug!("{} lane finished after failure, ignored", lane);
            return false;
        }
        if prev & bit != 0 {
            log::warn!("{} lane reported finished twice", lane);
            return false;
        }
        if (prev | bit) & self.required != self.required {
            return false;
        }

        let finalizer = self.finalizer.lock().take();
        if let Some(finalize) = finalizer {
            log::debug!("all lanes finished, finalizing");
            self.finalized.store(true, Ordering::Release);
            finalize();
        }
        true
    }

    /// Poisons the run. Returns true if this call won, i.e. neither an earlier
    /// failure nor finalization got there first.
    pub fn fail(&self) -> bool {
        let prev = self.state.fetch_or(FAILED, Ordering::AcqRel);
        if prev & FAILED != 0 || prev & self.required == self.required {
            return false;
        }
        self.finalizer.lock().take();
        true
    }

    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) & FAILED != 0
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn state(&self, lane: LaneKind) -> LaneState {
        if self.state.load(Ordering::Acquire) & Self::bit(lane) != 0 {
            LaneState::Finished
        } else {
            LaneState::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    use super::*;

    fn counted(audio_present: bool) -> (Arc<CompletionSynchronizer>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sync = CompletionSynchronizer::new(audio_present, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (Arc::new(sync), count)
    }

    #[test]
    fn test_video_then_audio() {
        let (sync, count) = counted(true);

        assert!(!sync.mark_finished(LaneKind::Video));
        assert_eq!(sync.state(LaneKind::Video), LaneState::Finished);
        assert_eq!(sync.state(LaneKind::Audio), LaneState::Active);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(sync.mark_finished(LaneKind::Audio));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sync.is_finalized());
    }

    #[test]
    fn test_audio_then_video() {
        let (sync, count) = counted(true);

        assert!(!sync.mark_finished(LaneKind::Audio));
        assert!(sync.mark_finished(LaneKind::Video));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_video_only_finalizes_on_video() {
        let (sync, count) = counted(false);
        assert_eq!(sync.state(LaneKind::Audio), LaneState::Finished);
        assert_eq!(sync.state(LaneKind::Video), LaneState::Active);

        assert!(sync.mark_finished(LaneKind::Video));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sync.mark_finished(LaneKind::Audio));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_finish_is_ignored() {
        let (sync, count) = counted(true);

        assert!(!sync.mark_finished(LaneKind::Video));
        assert!(!sync.mark_finished(LaneKind::Video));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(sync.mark_finished(LaneKind::Audio));
        assert!(!sync.mark_finished(LaneKind::Audio));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_simultaneous_finish_runs_finalizer_once() {
        for _ in 0..200 {
            let (sync, count) = counted(true);
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = [LaneKind::Video, LaneKind::Audio]
                .into_iter()
                .map(|lane| {
                    let sync = sync.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        sync.mark_finished(lane)
                    })
                })
                .collect();
            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(winners, 1);
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_failure_blocks_finalization() {
        let (sync, count) = counted(true);

        assert!(!sync.mark_finished(LaneKind::Video));
        assert!(sync.fail());
        assert!(!sync.fail());
        assert!(!sync.mark_finished(LaneKind::Audio));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(sync.is_failed());
        assert!(!sync.is_finalized());
    }

    #[test]
    fn test_failure_after_finalization_loses() {
        let (sync, count) = counted(false);

        assert!(sync.mark_finished(LaneKind::Video));
        assert!(!sync.fail());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sync.is_finalized());
    }
}
