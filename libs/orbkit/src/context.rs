//! Call context: metadata, deadline and cancellation.
//!
//! Every public call takes a [`Context`]. It carries two independent
//! metadata maps (incoming and outgoing), an optional deadline and a
//! cancellation token. Suspension points race their work against
//! [`Context::done`] through [`Context::run`], which yields
//! [`OrbError::CANCELED`] (499) or [`OrbError::TIMEOUT`] (504).

use std::future::Future;
use std::time::Duration;

use orbkit_errors::OrbError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;

#[derive(Clone, Debug, Default)]
pub struct Context {
    incoming: Metadata,
    outgoing: Metadata,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A root context: no deadline, never cancelled unless [`Context::cancel`]
    /// is called.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A child whose deadline is at most `timeout` from now.
    ///
    /// A zero `timeout` adds no deadline.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self.child();
        }
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child whose deadline is the earlier of `at` and the parent's.
    #[must_use]
    pub fn with_deadline(&self, at: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(self.deadline.map_or(at, |d| d.min(at)));
        child
    }

    /// A child with its own cancellation token. Cancelling the parent cancels
    /// the child, not the other way around.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            incoming: self.incoming.clone(),
            outgoing: self.outgoing.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// Same deadline and cancellation, fresh empty metadata maps.
    ///
    /// Used when a call crosses a process or transport boundary.
    #[must_use]
    pub fn with_new_metadata(&self) -> Self {
        Self {
            incoming: Metadata::new(),
            outgoing: Metadata::new(),
            deadline: self.deadline,
            cancel: self.cancel.clone(),
        }
    }

    #[must_use]
    pub fn with_incoming(mut self, md: Metadata) -> Self {
        self.incoming = md;
        self
    }

    #[must_use]
    pub fn with_outgoing(mut self, md: Metadata) -> Self {
        self.outgoing = md;
        self
    }

    /// Metadata received by the callee.
    #[must_use]
    pub fn incoming(&self) -> &Metadata {
        &self.incoming
    }

    /// Metadata the holder wants to send.
    #[must_use]
    pub fn outgoing(&self) -> &Metadata {
        &self.outgoing
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, zero when already past.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Some` once the context is cancelled or past its deadline.
    #[must_use]
    pub fn err(&self) -> Option<OrbError> {
        if self.cancel.is_cancelled() {
            return Some(OrbError::CANCELED);
        }
        match self.deadline {
            Some(d) if d <= Instant::now() => Some(OrbError::TIMEOUT),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline fires.
    pub async fn done(&self) -> OrbError {
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => OrbError::CANCELED,
            () = deadline => OrbError::TIMEOUT,
        }
    }

    /// Drives `fut` until it completes or the context ends.
    ///
    /// # Errors
    /// Returns the error of `fut`, 499 on cancellation or 504 on deadline.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, OrbError>
    where
        F: Future<Output = Result<T, OrbError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let res: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(res.unwrap_err().code(), 504);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(10));
        parent.cancel();
        let res: Result<(), _> = child.run(std::future::pending()).await;
        assert!(res.unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_reach_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(parent.err().is_none());
    }

    #[test]
    fn test_deadline_takes_the_earlier() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn test_new_metadata_is_independent() {
        let ctx = Context::background();
        ctx.outgoing().set("a", "1");
        let crossed = ctx.with_new_metadata();
        assert!(crossed.outgoing().is_empty());
        assert!(crossed.incoming().is_empty());
    }
}
