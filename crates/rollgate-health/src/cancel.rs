//! Cooperative cancellation for a rollout task.
//!
//! Every wait in the rollout (action execution, sample sleeps, approval
//! polls, rollback backoff) goes through a [`CancelToken`], which races
//! the wait against three interrupts: an external abort, loss of the
//! target lease, and the token's deadline.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a wait ended before its future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Aborted,
    LeaseLost,
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    stop: watch::Receiver<Option<Interrupt>>,
    deadline: Option<Instant>,
    ignore_abort: bool,
}

impl CancelToken {
    pub fn new(stop: watch::Receiver<Option<Interrupt>>) -> Self {
        Self {
            stop,
            deadline: None,
            ignore_abort: false,
        }
    }

    /// A copy of this token that also expires at `deadline`. The earlier
    /// of the two deadlines wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// A token for the rollback path: aborts are ignored and no deadline
    /// is inherited. Lease loss still interrupts.
    pub fn rollback_scope(&self) -> Self {
        Self {
            stop: self.stop.clone(),
            deadline: None,
            ignore_abort: true,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The pending interrupt, if any, without waiting.
    pub fn check(&self) -> Option<Interrupt> {
        let signalled = *self.stop.borrow();
        match signalled {
            Some(Interrupt::Aborted) if self.ignore_abort => {}
            Some(interrupt) => return Some(interrupt),
            None => {}
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` to completion unless an interrupt arrives first.
    pub async fn run<F: Future>(&mut self, fut: F) -> Result<F::Output, Interrupt> {
        if let Some(interrupt) = self.check() {
            return Err(interrupt);
        }
        let deadline = self.deadline;
        let ignore_abort = self.ignore_abort;
        let stop = &mut self.stop;
        tokio::select! {
            biased;
            interrupt = wait_signalled(stop, ignore_abort) => Err(interrupt),
            _ = wait_deadline(deadline) => Err(Interrupt::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        self.run(tokio::time::sleep(duration)).await
    }

    pub async fn sleep_until(&mut self, at: Instant) -> Result<(), Interrupt> {
        self.run(tokio::time::sleep_until(at)).await
    }
}

async fn wait_signalled(
    stop: &mut watch::Receiver<Option<Interrupt>>,
    ignore_abort: bool,
) -> Interrupt {
    loop {
        let signalled = *stop.borrow_and_update();
        match signalled {
            Some(Interrupt::Aborted) if ignore_abort => {}
            Some(interrupt) => return interrupt,
            None => {}
        }
        if stop.changed().await.is_err() {
            // Sender gone: nobody can interrupt us any more.
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
