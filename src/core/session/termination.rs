use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Completed,
    VoicemailDetected,
    MaxSilenceReached,
    Error,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::VoicemailDetected => "voicemail-detected",
            Self::MaxSilenceReached => "max-silence-reached",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single "call should end" flag. Only the first [`fire`](Self::fire)
/// wins; every later attempt is ignored.
#[derive(Debug)]
pub struct TerminationSignal {
    fired: AtomicBool,
    tx: watch::Sender<Option<Disposition>>,
}

impl Default for TerminationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Returns true for the call that actually ended the session.
    pub fn fire(&self, disposition: Disposition) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.tx.send_replace(Some(disposition));
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn disposition(&self) -> Option<Disposition> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Disposition>> {
        self.tx.subscribe()
    }

    /// Resolve once the signal has fired.
    pub async fn wait(&self) -> Disposition {
        let mut rx = self.subscribe();
        loop {
            if let Some(disposition) = *rx.borrow_and_update() {
                return disposition;
            }
            if rx.changed().await.is_err() {
                return Disposition::Error;
            }
        }
    }
}
