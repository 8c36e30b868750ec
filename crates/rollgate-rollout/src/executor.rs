//! Command executor abstraction.
//!
//! The executor performs side-effecting actions (deploy steps and the
//! plan's rollback step) against a target. Rollback actions may be
//! retried, so implementations must make them safe to repeat.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rollgate_core::Action;
use rollgate_health::{CancelToken, Interrupt};
use rollgate_state::ActionOutcome;

/// `Ok(payload)` on success, `Err(reason)` on failure.
pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

pub trait CommandExecutor: Send + Sync {
    fn execute<'a>(&'a self, target: &'a str, action: &'a Action) -> ExecFuture<'a>;
}

/// Run `action` bounded by `timeout`. Interrupts from `cancel` (abort,
/// lease loss, the global deadline) take precedence over the outcome.
pub async fn run_action(
    executor: &dyn CommandExecutor,
    target: &str,
    action: &Action,
    timeout: Duration,
    cancel: &mut CancelToken,
) -> Result<ActionOutcome, Interrupt> {
    let bounded = tokio::time::timeout(timeout, executor.execute(target, action));
    Ok(match cancel.run(bounded).await? {
        Ok(Ok(payload)) => ActionOutcome::Success { payload },
        Ok(Err(reason)) => ActionOutcome::Failure { reason },
        Err(_) => ActionOutcome::TimedOut,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::ActionKind;
    use std::collections::BTreeMap;
    use tokio::sync::watch;

    struct Sleepy(Duration);

    impl CommandExecutor for Sleepy {
        fn execute<'a>(&'a self, _target: &'a str, action: &'a Action) -> ExecFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                if action.name == "fail" {
                    Err("exit status 1".into())
                } else {
                    Ok(format!("{} done", action.name))
                }
            })
        }
    }

    fn action(name: &str) -> Action {
        Action {
            name: name.into(),
            kind: ActionKind::Deploy,
            command: None,
            params: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes() {
        let (_tx, rx) = watch::channel(None);
        let mut cancel = CancelToken::new(rx);
        let quick = Sleepy(Duration::from_secs(1));
        let timeout = Duration::from_secs(10);

        assert_eq!(
            run_action(&quick, "t", &action("deploy"), timeout, &mut cancel).await,
            Ok(ActionOutcome::Success { payload: "deploy done".into() })
        );
        assert_eq!(
            run_action(&quick, "t", &action("fail"), timeout, &mut cancel).await,
            Ok(ActionOutcome::Failure { reason: "exit status 1".into() })
        );

        let slow = Sleepy(Duration::from_secs(60));
        assert_eq!(
            run_action(&slow, "t", &action("deploy"), timeout, &mut cancel).await,
            Ok(ActionOutcome::TimedOut)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn global_deadline_wins_over_phase_timeout() {
        let (_tx, rx) = watch::channel(None);
        let mut cancel = CancelToken::new(rx)
            .with_deadline(tokio::time::Instant::now() + Duration::from_secs(5));
        let slow = Sleepy(Duration::from_secs(60));
        assert_eq!(
            run_action(&slow, "t", &action("deploy"), Duration::from_secs(30), &mut cancel).await,
            Err(Interrupt::DeadlineExceeded)
        );
    }
}
