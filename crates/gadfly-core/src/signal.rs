//! Run-wide shutdown signalling.
//!
//! A single shared [`ShutdownSignal`] carries the session's exit code. It is
//! set once (the first non-`None` code wins) and consulted by every worker at
//! each loop turn; a [`CancellationToken`] rides along so sleeping tasks can
//! `select!` on shutdown instead of polling.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Why the fuzzing session ended. Doubles as the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExitCode {
    /// Still running, or a clean no-op exit.
    #[default]
    None = 0,
    /// The operator confirmed an interrupt.
    User = 1,
    /// Both request sources ran dry.
    EmptyQueue = 2,
    /// The session wall-clock timeout fired.
    Timeout = 3,
    /// A session probe came back without the catch phrase.
    LoggedOut = 4,
}

impl ExitCode {
    /// The process exit code value.
    pub fn code(self) -> i32 {
        self as i32
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::User,
            2 => Self::EmptyQueue,
            3 => Self::Timeout,
            4 => Self::LoggedOut,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::User => "USER",
            Self::EmptyQueue => "EMPTY_QUEUE",
            Self::Timeout => "TIMEOUT",
            Self::LoggedOut => "LOGGED_OUT",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
struct Inner {
    code: AtomicU8,
    token: CancellationToken,
    pause: tokio::sync::RwLock<()>,
}

/// Shared, set-once shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                code: AtomicU8::new(ExitCode::None as u8),
                token: CancellationToken::new(),
                pause: tokio::sync::RwLock::new(()),
            }),
        }
    }

    /// Set the exit code. The first non-`None` code sticks; later triggers
    /// are ignored. Cancels the token either way.
    pub fn trigger(&self, code: ExitCode) {
        if code == ExitCode::None {
            return;
        }
        let was_first = self
            .inner
            .code
            .compare_exchange(
                ExitCode::None as u8,
                code as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if was_first {
            tracing::info!(code = %code, "Shutdown signal set");
        }
        self.inner.token.cancel();
    }

    /// The current exit code; `None` while the session is healthy.
    pub fn get(&self) -> ExitCode {
        ExitCode::from_u8(self.inner.code.load(Ordering::SeqCst))
    }

    /// Whether any code has been set.
    pub fn is_triggered(&self) -> bool {
        self.get() != ExitCode::None
    }

    /// Resolve when the signal triggers; for use inside `select!`.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Block while the session is paused; workers call this each cycle.
    pub async fn checkpoint(&self) {
        drop(self.inner.pause.read().await);
    }

    /// Suspend all workers at their next checkpoint until the returned guard
    /// drops. Used by the interrupt prompt.
    pub async fn pause(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.inner.pause.write().await
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
