//! OS signals that trigger a graceful shutdown.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A process signal the service can be interrupted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutdownSignal {
    #[serde(rename = "SIGINT", alias = "interrupt")]
    Interrupt,
    #[serde(rename = "SIGTERM", alias = "terminate")]
    Terminate,
    #[serde(rename = "SIGQUIT", alias = "quit")]
    Quit,
    #[serde(rename = "SIGHUP", alias = "hangup")]
    Hangup,
    #[serde(rename = "SIGUSR1", alias = "user1")]
    User1,
    #[serde(rename = "SIGUSR2", alias = "user2")]
    User2,
}

/// Signals watched when none are configured.
pub const DEFAULT_SIGNALS: [ShutdownSignal; 3] = [
    ShutdownSignal::Interrupt,
    ShutdownSignal::Terminate,
    ShutdownSignal::Quit,
];

impl ShutdownSignal {
    /// Conventional signal name, e.g. `SIGTERM`.
    pub fn name(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::User1 => "SIGUSR1",
            ShutdownSignal::User2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    fn kind(self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;

        match self {
            ShutdownSignal::Interrupt => SignalKind::interrupt(),
            ShutdownSignal::Terminate => SignalKind::terminate(),
            ShutdownSignal::Quit => SignalKind::quit(),
            ShutdownSignal::Hangup => SignalKind::hangup(),
            ShutdownSignal::User1 => SignalKind::user_defined1(),
            ShutdownSignal::User2 => SignalKind::user_defined2(),
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Listens for the configured shutdown signals.
///
/// Handlers are installed when the watcher is created, so a signal raised
/// after [`SignalWatcher::register`] returns is never lost.
pub struct SignalWatcher {
    #[cfg(unix)]
    streams: Vec<(ShutdownSignal, tokio::signal::unix::Signal)>,
    #[cfg(not(unix))]
    ctrl_c: bool,
}

impl SignalWatcher {
    /// Install handlers for `signals`. Duplicates are ignored.
    #[cfg(unix)]
    pub fn register(signals: &[ShutdownSignal]) -> Result<Self, Error> {
        let mut streams: Vec<(ShutdownSignal, tokio::signal::unix::Signal)> = Vec::new();
        for &signal in signals {
            if streams.iter().any(|(registered, _)| *registered == signal) {
                continue;
            }
            let stream = tokio::signal::unix::signal(signal.kind())
                .map_err(|source| Error::Signal { signal, source })?;
            streams.push((signal, stream));
        }
        Ok(Self { streams })
    }

    /// Install handlers for `signals`. Only `SIGINT` (ctrl-c) is supported.
    #[cfg(not(unix))]
    pub fn register(signals: &[ShutdownSignal]) -> Result<Self, Error> {
        Ok(Self {
            ctrl_c: signals.contains(&ShutdownSignal::Interrupt),
        })
    }

    /// Signals this watcher listens for.
    #[cfg(unix)]
    pub fn signals(&self) -> Vec<ShutdownSignal> {
        self.streams.iter().map(|(signal, _)| *signal).collect()
    }

    /// Wait for the next watched signal.
    ///
    /// Never completes when no signal is watched.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> ShutdownSignal {
        if self.streams.is_empty() {
            return std::future::pending().await;
        }

        let pending = self.streams.iter_mut().map(|(signal, stream)| {
            let signal = *signal;
            Box::pin(async move {
                match stream.recv().await {
                    Some(()) => signal,
                    None => std::future::pending().await,
                }
            })
        });
        let (signal, _, _) = futures::future::select_all(pending).await;
        signal
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> ShutdownSignal {
        if !self.ctrl_c {
            return std::future::pending().await;
        }
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(_) => std::future::pending().await,
        }
    }
}

impl fmt::Debug for SignalWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SignalWatcher");
        #[cfg(unix)]
        s.field("signals", &self.signals());
        #[cfg(not(unix))]
        s.field("ctrl_c", &self.ctrl_c);
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_names_round_trip_through_yaml() {
        let signals: Vec<ShutdownSignal> =
            serde_yaml::from_str("[SIGINT, SIGTERM, user1, SIGHUP]").unwrap();
        assert_eq!(
            signals,
            vec![
                ShutdownSignal::Interrupt,
                ShutdownSignal::Terminate,
                ShutdownSignal::User1,
                ShutdownSignal::Hangup,
            ]
        );
        assert_eq!(ShutdownSignal::Quit.to_string(), "SIGQUIT");
    }

    #[test]
    fn test_unknown_signal_is_rejected() {
        assert!(serde_yaml::from_str::<ShutdownSignal>("SIGKILL").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_register_ignores_duplicates() {
        let watcher = SignalWatcher::register(&[
            ShutdownSignal::Hangup,
            ShutdownSignal::Hangup,
            ShutdownSignal::User2,
        ])
        .unwrap();
        assert_eq!(
            watcher.signals(),
            vec![ShutdownSignal::Hangup, ShutdownSignal::User2]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recv_reports_raised_signal() {
        let mut watcher = SignalWatcher::register(&[ShutdownSignal::User2]).unwrap();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR2).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("signal not delivered");
        assert_eq!(received, ShutdownSignal::User2);
    }

    #[tokio::test]
    async fn test_empty_watcher_never_fires() {
        let mut watcher = SignalWatcher::register(&[]).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(50), watcher.recv()).await;
        assert!(result.is_err());
    }
}
