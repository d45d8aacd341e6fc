//! Dead-man switch for confirmable wearer actions.
//!
//! Tool actions like calling the caregiver or starting media are armed
//! here first: the watch shows a countdown the wearer can cancel. Expiry
//! commits the action; an explicit cancel, a superseding arm, or a stop
//! runs the cancel callback with the reason. At most one action is pending
//! at a time.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::protocol::ServerMessage;
use crate::session::WatchLink;
use crate::utils::short_id;

/// Countdown before an uncancelled action commits.
pub const DEADMAN_COUNTDOWN: Duration = Duration::from_secs(10);

/// Why a pending action was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit cancel from the wearer.
    Cancelled,
    /// A newer action replaced this one.
    Superseded,
    /// The session (or the action's subsystem) stopped it.
    Stopped,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded",
            Self::Stopped => "stopped",
        }
    }
}

/// Actions that go through the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadmanAction {
    StartCall,
    PlayMusic,
    DisplayImages,
}

impl DeadmanAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartCall => "start_call",
            Self::PlayMusic => "play_music",
            Self::DisplayImages => "display_images",
        }
    }

    /// Whether this is a media-start action (mutually exclusive with a
    /// pending caregiver call).
    pub fn is_media(self) -> bool {
        matches!(self, Self::PlayMusic | Self::DisplayImages)
    }
}

/// Runs when the countdown expires uncancelled. Spawns its own async work.
pub type CommitFn = Box<dyn FnOnce() + Send>;
/// Runs when the action is cancelled, with the reason.
pub type CancelFn = Box<dyn FnOnce(CancelReason) + Send>;

struct Pending {
    id: String,
    action: DeadmanAction,
    timer: AbortHandle,
    on_commit: Option<CommitFn>,
    on_cancel: Option<CancelFn>,
}

/// The per-session switch.
pub struct DeadmanSwitch {
    watch: Arc<dyn WatchLink>,
    pending: Mutex<Option<Pending>>,
}

impl DeadmanSwitch {
    pub fn new(watch: Arc<dyn WatchLink>) -> Self {
        Self {
            watch,
            pending: Mutex::new(None),
        }
    }

    /// Arms an action: notifies the watch, starts the countdown, and
    /// supersedes any previously pending action.
    ///
    /// Returns the pending id the wearer can cancel with.
    pub fn arm(
        self: &Arc<Self>,
        action: DeadmanAction,
        on_commit: CommitFn,
        on_cancel: CancelFn,
    ) -> String {
        let id = short_id();

        let switch = Arc::clone(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(DEADMAN_COUNTDOWN).await;
            switch.commit(&timer_id);
        })
        .abort_handle();

        let previous = {
            let mut pending = self.pending.lock();
            pending.replace(Pending {
                id: id.clone(),
                action,
                timer,
                on_commit: Some(on_commit),
                on_cancel: Some(on_cancel),
            })
        };
        if let Some(previous) = previous {
            self.finish_cancel(previous, CancelReason::Superseded);
        }

        self.watch.send(&ServerMessage::DeadmanPending {
            pending_id: id.clone(),
            action: action.as_str().to_string(),
            countdown_secs: DEADMAN_COUNTDOWN.as_secs(),
        });
        log::info!("[Deadman] Armed {} as {}", action.as_str(), id);
        id
    }

    /// The currently pending action, if any.
    pub fn pending_action(&self) -> Option<DeadmanAction> {
        self.pending.lock().as_ref().map(|p| p.action)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Explicit cancel from the wearer. Returns false for an unknown id.
    pub fn cancel(&self, pending_id: &str) -> bool {
        let taken = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(p) if p.id == pending_id => pending.take(),
                _ => None,
            }
        };
        match taken {
            Some(p) => {
                self.finish_cancel(p, CancelReason::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Cancels the pending action if it matches, with the given reason.
    pub fn cancel_if_action(&self, action: DeadmanAction, reason: CancelReason) {
        let taken = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(p) if p.action == action => pending.take(),
                _ => None,
            }
        };
        if let Some(p) = taken {
            self.finish_cancel(p, reason);
        }
    }

    /// Cancels whatever is pending, with the given reason.
    pub fn cancel_any(&self, reason: CancelReason) {
        let taken = self.pending.lock().take();
        if let Some(p) = taken {
            self.finish_cancel(p, reason);
        }
    }

    fn commit(&self, pending_id: &str) {
        let taken = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(p) if p.id == pending_id => pending.take(),
                _ => None,
            }
        };
        if let Some(mut p) = taken {
            log::info!("[Deadman] Committing {} ({})", p.action.as_str(), p.id);
            if let Some(commit) = p.on_commit.take() {
                commit();
            }
        }
    }

    fn finish_cancel(&self, mut p: Pending, reason: CancelReason) {
        p.timer.abort();
        log::info!(
            "[Deadman] Cancelled {} ({}): {}",
            p.action.as_str(),
            p.id,
            reason.as_str()
        );
        self.watch.send(&ServerMessage::DeadmanCancelled {
            pending_id: p.id.clone(),
        });
        if let Some(cancel) = p.on_cancel.take() {
            cancel(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests_support::RecordingWatch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn switch() -> (Arc<DeadmanSwitch>, Arc<RecordingWatch>) {
        let watch = Arc::new(RecordingWatch::default());
        let switch = Arc::new(DeadmanSwitch::new(
            Arc::clone(&watch) as Arc<dyn WatchLink>
        ));
        (switch, watch)
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_commits_the_action() {
        let (switch, watch) = switch();
        let committed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&committed);

        switch.arm(
            DeadmanAction::PlayMusic,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|_| panic!("must not cancel")),
        );
        tokio::task::yield_now().await;
        assert!(switch.is_pending());

        tokio::time::advance(DEADMAN_COUNTDOWN + Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert!(!switch.is_pending());
        assert!(watch.saw_type("deadman-pending"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel_runs_cancel_callback() {
        let (switch, watch) = switch();
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&reasons);

        let id = switch.arm(
            DeadmanAction::StartCall,
            Box::new(|| panic!("must not commit")),
            Box::new(move |reason| r.lock().push(reason)),
        );

        assert!(switch.cancel(&id));
        assert_eq!(*reasons.lock(), vec![CancelReason::Cancelled]);
        assert!(!switch.is_pending());
        assert!(watch.saw_type("deadman-cancelled"));

        // Expiry after cancel is a no-op.
        tokio::time::advance(DEADMAN_COUNTDOWN + Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn superseding_arm_cancels_previous() {
        let (switch, _watch) = switch();
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&reasons);

        switch.arm(
            DeadmanAction::PlayMusic,
            Box::new(|| panic!("must not commit")),
            Box::new(move |reason| r.lock().push(reason)),
        );
        switch.arm(
            DeadmanAction::DisplayImages,
            Box::new(|| {}),
            Box::new(|_| {}),
        );

        assert_eq!(*reasons.lock(), vec![CancelReason::Superseded]);
        assert_eq!(
            switch.pending_action(),
            Some(DeadmanAction::DisplayImages)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_if_action_matches_only() {
        let (switch, _watch) = switch();
        switch.arm(DeadmanAction::PlayMusic, Box::new(|| {}), Box::new(|_| {}));

        switch.cancel_if_action(DeadmanAction::StartCall, CancelReason::Stopped);
        assert!(switch.is_pending());

        switch.cancel_if_action(DeadmanAction::PlayMusic, CancelReason::Stopped);
        assert!(!switch.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unknown_id_is_false() {
        let (switch, _watch) = switch();
        assert!(!switch.cancel("nope"));
    }
}
