//! Transfer progress tracking and notification.

use parking_lot::Mutex;
use std::sync::Arc;

/// A point-in-time snapshot of transfer progress, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Bytes uploaded so far.
    pub uploaded: u64,
    /// Total bytes that will have been uploaded when the upload process
    /// catches up with the local history.
    pub uploadable: u64,
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Server's estimate of the total download size. The first estimate
    /// may shrink as the server compacts.
    pub downloadable: u64,
    /// The local version this snapshot was computed against.
    pub snapshot_version: u64,
}

/// Which transfer direction a progress callback observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDirection {
    /// Local changes moving to the server.
    Upload,
    /// Server changes moving to the local store.
    Download,
}

/// Invoked with `(transferred, transferable)` byte counts.
pub type ProgressCallback = Box<dyn FnMut(u64, u64) + Send>;

struct Notifier {
    token: u64,
    direction: ProgressDirection,
    streaming: bool,
    /// For one-shot notifiers: the completion target. Download targets
    /// latch the smallest transferable value ever observed, because the
    /// server's first estimate is uncompacted and may shrink. Upload
    /// targets are captured only once the local write cursor has caught
    /// up with the registration snapshot.
    captured_transferable: Option<u64>,
    registered_at_version: u64,
    callback: Arc<Mutex<ProgressCallback>>,
}

struct TrackerInner {
    current: Progress,
    has_progress: bool,
    local_version: u64,
    next_token: u64,
    notifiers: Vec<Notifier>,
}

/// Thread-safe registry of progress callbacks.
///
/// Streaming callbacks fire on every update indefinitely. One-shot
/// callbacks fire exactly once, when the transferred count reaches the
/// latched transferable target, and are then removed.
pub struct ProgressTracker {
    inner: Mutex<TrackerInner>,
}

impl ProgressTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                current: Progress::default(),
                has_progress: false,
                local_version: 0,
                next_token: 1,
                notifiers: Vec::new(),
            }),
        }
    }

    /// Registers a callback and returns its removal token. If progress is
    /// already known the callback fires immediately (and a satisfied
    /// one-shot callback is consumed without being stored).
    pub fn register(
        &self,
        direction: ProgressDirection,
        streaming: bool,
        callback: ProgressCallback,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        let notifier = Notifier {
            token,
            direction,
            streaming,
            captured_transferable: None,
            registered_at_version: inner.local_version,
            callback: Arc::new(Mutex::new(callback)),
        };
        inner.notifiers.push(notifier);
        if inner.has_progress {
            let current = inner.current;
            Self::dispatch(&mut inner, current);
        }
        token
    }

    /// Removes a callback. Returns false if the token is unknown (for
    /// example because a one-shot callback already fired).
    pub fn unregister(&self, token: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.notifiers.len();
        inner.notifiers.retain(|n| n.token != token);
        inner.notifiers.len() != before
    }

    /// Records the local store's write cursor, used to qualify one-shot
    /// upload notifiers registered before uploadable totals were accurate.
    pub fn set_local_version(&self, version: u64) {
        self.inner.lock().local_version = version;
    }

    /// Applies a new progress snapshot and notifies subscribers.
    pub fn update(&self, progress: Progress) {
        let mut inner = self.inner.lock();
        inner.current = progress;
        inner.has_progress = true;
        Self::dispatch(&mut inner, progress);
    }

    fn dispatch(inner: &mut TrackerInner, progress: Progress) {
        let mut to_invoke: Vec<(Arc<Mutex<ProgressCallback>>, u64, u64)> = Vec::new();
        inner.notifiers.retain_mut(|notifier| {
            let (transferred, transferable) = match notifier.direction {
                ProgressDirection::Upload => (progress.uploaded, progress.uploadable),
                ProgressDirection::Download => (progress.downloaded, progress.downloadable),
            };
            if notifier.streaming {
                to_invoke.push((Arc::clone(&notifier.callback), transferred, transferable));
                return true;
            }
            match notifier.direction {
                ProgressDirection::Download => {
                    let captured = notifier
                        .captured_transferable
                        .map_or(transferable, |c| c.min(transferable));
                    notifier.captured_transferable = Some(captured);
                }
                ProgressDirection::Upload => {
                    // Uploadable totals are not accurate until the local
                    // write cursor reaches the registration snapshot.
                    if notifier.captured_transferable.is_none()
                        && progress.snapshot_version >= notifier.registered_at_version
                    {
                        notifier.captured_transferable = Some(transferable);
                    }
                }
            }
            match notifier.captured_transferable {
                Some(target) if transferred >= target => {
                    to_invoke.push((Arc::clone(&notifier.callback), transferred, target));
                    false
                }
                _ => true,
            }
        });
        // Invoke outside the notifier list borrow; the tracker lock is
        // held by the caller, so subscribers must not call back into the
        // tracker from the callback itself.
        for (callback, transferred, transferable) in to_invoke {
            (callback.lock())(transferred, transferable);
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn progress(
        uploaded: u64,
        uploadable: u64,
        downloaded: u64,
        downloadable: u64,
        snapshot_version: u64,
    ) -> Progress {
        Progress {
            uploaded,
            uploadable,
            downloaded,
            downloadable,
            snapshot_version,
        }
    }

    #[test]
    fn streaming_fires_on_every_update() {
        let tracker = ProgressTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_2 = Arc::clone(&fired);
        tracker.register(
            ProgressDirection::Download,
            true,
            Box::new(move |_, _| {
                fired_2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tracker.update(progress(0, 0, 10, 100, 1));
        tracker.update(progress(0, 0, 50, 100, 1));
        tracker.update(progress(0, 0, 100, 100, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn one_shot_download_latches_smallest_transferable() {
        let tracker = ProgressTracker::new();
        tracker.update(progress(0, 0, 0, 100, 1));

        let fired = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicU64::new(0));
        let fired_2 = Arc::clone(&fired);
        let last_2 = Arc::clone(&last);
        tracker.register(
            ProgressDirection::Download,
            false,
            Box::new(move |transferred, transferable| {
                fired_2.fetch_add(1, Ordering::SeqCst);
                last_2.store(transferred * 1000 + transferable, Ordering::SeqCst);
            }),
        );

        // The estimate shrinks; the target follows it down.
        tracker.update(progress(0, 0, 30, 60, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tracker.update(progress(0, 0, 60, 60, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 60 * 1000 + 60);

        // Removed after firing; further updates do nothing.
        tracker.update(progress(0, 0, 80, 80, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_shot_upload_waits_for_registration_snapshot() {
        let tracker = ProgressTracker::new();
        tracker.set_local_version(5);
        tracker.update(progress(0, 10, 0, 0, 3));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_2 = Arc::clone(&fired);
        tracker.register(
            ProgressDirection::Upload,
            false,
            Box::new(move |_, _| {
                fired_2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Uploaded reaches uploadable, but the snapshot has not caught up
        // with local version 5 yet; the target is not even captured.
        tracker.update(progress(10, 10, 0, 0, 4));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tracker.update(progress(12, 12, 0, 0, 5));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_streaming_callback() {
        let tracker = ProgressTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_2 = Arc::clone(&fired);
        let token = tracker.register(
            ProgressDirection::Upload,
            true,
            Box::new(move |_, _| {
                fired_2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tracker.update(progress(1, 2, 0, 0, 1));
        assert!(tracker.unregister(token));
        tracker.update(progress(2, 2, 0, 0, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
