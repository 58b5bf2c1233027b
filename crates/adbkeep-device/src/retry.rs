use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::{error, warn};

use crate::error::{DeviceError, FailureKind, Result};

/// What to run before the next attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    Reconnect,
    RedetectPackage,
    Wait,
}

impl Recovery {
    fn for_kind(kind: FailureKind) -> Option<Self> {
        match kind {
            FailureKind::ConnectionReset | FailureKind::RecoverableProtocolError => {
                Some(Recovery::Reconnect)
            }
            FailureKind::PackageMissing => Some(Recovery::RedetectPackage),
            FailureKind::Unknown => Some(Recovery::Wait),
            FailureKind::FatalProtocolError => None,
        }
    }
}

/// Recovery actions the executor may invoke on the wrapped controller.
#[async_trait]
pub trait Recover: Send {
    /// Disconnect then connect the current serial.
    async fn reconnect(&mut self) -> Result<()>;

    async fn redetect_package(&mut self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub tries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 5,
            delay: Duration::from_secs(3),
        }
    }
}

/// State of one wrapped call; dropped when the call returns.
#[derive(Debug, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub last_failure: Option<FailureKind>,
    pub pending: Option<Recovery>,
    /// An unclassified failure gets one best-effort reconnect per call.
    unknown_reconnected: bool,
}

impl RetryContext {
    /// Records a failed attempt. Returns the error to abort with when the
    /// failure is fatal, otherwise schedules the matching recovery.
    fn record(&mut self, name: &str, kind: FailureKind, err: DeviceError) -> Option<DeviceError> {
        self.last_failure = Some(kind);
        match Recovery::for_kind(kind) {
            None => {
                if err.is_fatal() {
                    return Some(err);
                }
                error!(takeover = true, "{name}: unrecoverable adb error: {err}");
                Some(DeviceError::takeover(format!("{name}: {err}")))
            }
            Some(recovery) => {
                let recovery = match kind {
                    FailureKind::Unknown => {
                        error!(attempt = self.attempt, "{name}: unexpected error: {err:?}");
                        if self.unknown_reconnected {
                            recovery
                        } else {
                            self.unknown_reconnected = true;
                            Recovery::Reconnect
                        }
                    }
                    _ => {
                        error!(attempt = self.attempt, "{name}: {err}");
                        recovery
                    }
                };
                self.pending = Some(recovery);
                None
            }
        }
    }
}

/// Result of a single attempt with its failure already classified.
pub enum Outcome<T> {
    Success(T),
    Failure { kind: FailureKind, error: DeviceError },
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(error) => Outcome::Failure {
                kind: FailureKind::classify(&error),
                error,
            },
        }
    }
}

/// Runs `op` up to `policy.tries` times, recovering between attempts.
///
/// Fatal failures return immediately; running out of attempts is itself a
/// human-takeover fault.
pub async fn execute<C, T, F>(target: &mut C, policy: &RetryPolicy, name: &str, mut op: F) -> Result<T>
where
    C: Recover + ?Sized,
    F: for<'a> FnMut(&'a mut C) -> BoxFuture<'a, Result<T>>,
{
    let mut ctx = RetryContext::default();
    while ctx.attempt < policy.tries {
        ctx.attempt += 1;

        if let Some(recovery) = ctx.pending.take() {
            tokio::time::sleep(policy.delay).await;
            let recovered: Outcome<()> = match recovery {
                Recovery::Reconnect => target.reconnect().await.into(),
                Recovery::RedetectPackage => target.redetect_package().await.into(),
                Recovery::Wait => Outcome::Success(()),
            };
            if let Outcome::Failure { kind, error } = recovered {
                warn!("{name}: recovery {recovery:?} failed");
                if let Some(fatal) = ctx.record(name, kind, error) {
                    return Err(fatal);
                }
                continue;
            }
        }

        match Outcome::from(op(target).await) {
            Outcome::Success(value) => return Ok(value),
            Outcome::Failure { kind, error } => {
                if let Some(fatal) = ctx.record(name, kind, error) {
                    return Err(fatal);
                }
            }
        }
    }

    error!(takeover = true, "Retry {name}() failed after {} attempts", ctx.attempt);
    Err(DeviceError::takeover(format!(
        "retry {name}() failed, last failure {:?}",
        ctx.last_failure
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Probe {
        reconnects: u32,
        redetects: u32,
        fail_reconnect: bool,
    }

    #[async_trait]
    impl Recover for Probe {
        async fn reconnect(&mut self) -> Result<()> {
            self.reconnects += 1;
            if self.fail_reconnect {
                return Err(DeviceError::takeover("bad port"));
            }
            Ok(())
        }

        async fn redetect_package(&mut self) -> Result<()> {
            self.redetects += 1;
            Ok(())
        }
    }

    fn policy(tries: u32) -> RetryPolicy {
        RetryPolicy {
            tries,
            delay: Duration::ZERO,
        }
    }

    fn reset() -> DeviceError {
        DeviceError::ConnectionReset("adb server killed".into())
    }

    #[tokio::test]
    async fn resets_then_success_reconnects_twice() {
        let mut probe = Probe::default();
        let mut calls = 0;
        let value = execute(&mut probe, &policy(5), "screenshot", |_| {
            calls += 1;
            let n = calls;
            Box::pin(async move {
                if n < 3 {
                    Err(reset())
                } else {
                    Ok(n)
                }
            })
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(probe.reconnects, 2);
        assert_eq!(probe.redetects, 0);
    }

    #[tokio::test]
    async fn fatal_error_aborts_on_first_attempt() {
        let mut probe = Probe::default();
        let mut calls = 0;
        let err = execute(&mut probe, &policy(5), "shell", |_| {
            calls += 1;
            Box::pin(async { Err::<(), _>(DeviceError::Adb("unknown host service".into())) })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceError::HumanTakeover(_)));
        assert_eq!(calls, 1);
        assert_eq!(probe.reconnects, 0);
    }

    #[tokio::test]
    async fn takeover_passes_through_unmodified() {
        let mut probe = Probe::default();
        let err = execute(&mut probe, &policy(3), "detect", |_| {
            Box::pin(async { Err::<(), _>(DeviceError::takeover("multiple devices")) })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceError::HumanTakeover(ref msg) if msg == "multiple devices"));
    }

    #[tokio::test]
    async fn exhausting_tries_requests_takeover() {
        let mut probe = Probe::default();
        let mut calls = 0;
        let err = execute(&mut probe, &policy(3), "shell", |_| {
            calls += 1;
            Box::pin(async { Err::<(), _>(DeviceError::Adb("device offline".into())) })
        })
        .await
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(calls, 3);
        assert_eq!(probe.reconnects, 2);
    }

    #[tokio::test]
    async fn missing_package_redetects() {
        let mut probe = Probe::default();
        let mut calls = 0;
        let value = execute(&mut probe, &policy(5), "launch", |_| {
            calls += 1;
            let n = calls;
            Box::pin(async move {
                match n {
                    1 => Err(DeviceError::PackageNotInstalled("com.x.a".into())),
                    2 => Err(DeviceError::Exit {
                        status: 1,
                        detail: "truncated image".into(),
                    }),
                    _ => Ok("launched"),
                }
            })
        })
        .await
        .unwrap();
        assert_eq!(value, "launched");
        assert_eq!(probe.redetects, 1);
        assert_eq!(probe.reconnects, 1);
    }

    #[tokio::test]
    async fn unknown_errors_reconnect_once_then_wait() {
        let mut probe = Probe::default();
        let mut calls = 0;
        let err = execute(&mut probe, &policy(4), "pull", |_| {
            calls += 1;
            Box::pin(async {
                Err::<(), _>(DeviceError::Exit {
                    status: 1,
                    detail: "remote object does not exist".into(),
                })
            })
        })
        .await
        .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(calls, 4);
        assert_eq!(probe.reconnects, 1);
    }

    #[tokio::test]
    async fn fatal_recovery_stops_the_loop() {
        let mut probe = Probe {
            fail_reconnect: true,
            ..Probe::default()
        };
        let mut calls = 0;
        let err = execute(&mut probe, &policy(5), "shell", |_| {
            calls += 1;
            Box::pin(async { Err::<(), _>(reset()) })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceError::HumanTakeover(ref msg) if msg == "bad port"));
        assert_eq!(calls, 1);
        assert_eq!(probe.reconnects, 1);
    }
}
