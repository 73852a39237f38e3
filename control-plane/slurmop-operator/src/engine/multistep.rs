//! Named, ordered step execution with a failure policy.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use futures_util::future::BoxFuture;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Stop at the first failing step.
    FailAtFirstError,
    /// Run every step and report all failures together.
    CollectErrors,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::FailAtFirstError => "FailAtFirstError",
            Strategy::CollectErrors => "CollectErrors",
        })
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FailAtFirstError" => Ok(Strategy::FailAtFirstError),
            "CollectErrors" => Ok(Strategy::CollectErrors),
            other => Err(Error::InvalidStrategy(other.to_string())),
        }
    }
}

type StepFn<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

pub struct Step<'a> {
    name: String,
    run: StepFn<'a>,
}

impl<'a> Step<'a> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<()>> + Send + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(move || Box::pin(f())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs `steps` in order under `strategy`.
///
/// Each step runs inside its own span carrying a fresh step id, nested in
/// the execution span, so log lines of one execution can be correlated.
pub async fn execute(
    name: &str,
    strategy: Strategy,
    steps: Vec<Step<'_>>,
) -> Result<()> {
    let execution_id = Uuid::new_v4();
    let span = info_span!(
        "execution",
        execution = %name,
        execution_id = %execution_id,
        %strategy
    );

    async move {
        let mut failures: Vec<String> = Vec::new();
        for step in steps {
            let step_id = Uuid::new_v4();
            let step_span =
                info_span!("step", step = %step.name, step_id = %step_id);
            debug!(parent: &step_span, "step started");
            let res = (step.run)().instrument(step_span.clone()).await;
            match res {
                Ok(()) => debug!(parent: &step_span, "step finished"),
                Err(e) => {
                    warn!(parent: &step_span, error = %e, "step failed");
                    match strategy {
                        Strategy::FailAtFirstError => {
                            return Err(Error::Steps(format!(
                                "{name}: step {} failed: {e}",
                                step.name
                            )));
                        }
                        Strategy::CollectErrors => {
                            failures.push(format!("{}: {e}", step.name))
                        }
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Steps(format!(
                "{name}: {} step(s) failed: {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }
    .instrument(span)
    .await
}
