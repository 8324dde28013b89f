//! Scripted power sequences.
//!
//! One command per line, case insensitive, blank lines ignored:
//!
//! ```text
//! START
//! POW [100, 0, 0, 0, 0, 0]
//! SLEEP 500
//! POW [0, 0, 0, 0, 0, 0]
//! SLEEP 500
//! REP 10
//! ```
//!
//! `REP n` jumps back to just after `START` until the body has run `n`
//! times in total. Anything unrecognized is skipped.

use std::{str::FromStr, time::Duration};

use common::physical::{PowerVector, PowerVectorError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    scheduler::{SchedulerError, SchedulerHandle},
    signal::SignalMode,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCommand {
    Start,
    Pow(PowerVector),
    Sleep(Duration),
    Rep(u32),
    Unknown(String),
}

/// A command and the (zero based) line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    pub line: usize,
    pub command: ScriptCommand,
}

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Line {line}: expected an argument.")]
    MissingArgument { line: usize },

    #[error("Line {line}: '{text}' is not a number.")]
    InvalidNumber { line: usize, text: String },

    #[error("Line {line}: {reason}")]
    Power {
        line: usize,
        reason: PowerVectorError,
    },

    #[error("Scheduler unavailable: {0}")]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Script {
    lines: Vec<ScriptLine>,
}

impl Script {
    pub fn lines(&self) -> &[ScriptLine] {
        &self.lines
    }

    /// Index of the first command after `START`, or the first command when
    /// there is no `START`.
    fn loop_start(&self) -> usize {
        self.lines
            .iter()
            .position(|l| l.command == ScriptCommand::Start)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

fn parse_number<T: FromStr>(line: usize, text: &str) -> Result<T, ScriptError> {
    text.trim().parse().map_err(|_| ScriptError::InvalidNumber {
        line,
        text: text.trim().to_string(),
    })
}

fn argument(line: usize, text: &str) -> Result<&str, ScriptError> {
    text.split_whitespace()
        .nth(1)
        .ok_or(ScriptError::MissingArgument { line })
}

fn parse_pow(line: usize, text: &str) -> Result<PowerVector, ScriptError> {
    let (Some(open), Some(close)) = (text.find('['), text.rfind(']')) else {
        return Err(ScriptError::MissingArgument { line });
    };
    if close < open {
        return Err(ScriptError::MissingArgument { line });
    }
    let levels = text[open + 1..close]
        .split(',')
        .map(|value| parse_number::<i64>(line, value))
        .collect::<Result<Vec<i64>, ScriptError>>()?;
    PowerVector::try_from_levels(&levels).map_err(|reason| ScriptError::Power { line, reason })
}

impl FromStr for Script {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = Vec::new();
        for (line, raw) in s.lines().enumerate() {
            let text = raw.trim();
            if text.is_empty() {
                continue;
            }
            let upper = text.to_uppercase();
            let command = if upper == "START" {
                ScriptCommand::Start
            } else if upper.starts_with("POW") {
                ScriptCommand::Pow(parse_pow(line, text)?)
            } else if upper.starts_with("SLEEP") {
                ScriptCommand::Sleep(Duration::from_millis(parse_number(
                    line,
                    argument(line, text)?,
                )?))
            } else if upper.starts_with("REP") {
                ScriptCommand::Rep(parse_number(line, argument(line, text)?)?)
            } else {
                ScriptCommand::Unknown(text.to_string())
            };
            lines.push(ScriptLine { line, command });
        }
        Ok(Self { lines })
    }
}

/// Run `script` against the scheduler in direct mode. Returns early when
/// cancelled. Requesting is stopped however the script ends.
#[tracing::instrument(skip_all)]
pub async fn run_script(
    token: CancellationToken,
    script: Script,
    scheduler: SchedulerHandle,
) -> Result<(), ScriptError> {
    info!("Started.");
    let outcome = play(&token, &script, &scheduler).await;
    if scheduler.stop_requesting().is_err() {
        debug!("Scheduler is already gone.");
    }
    outcome
}

async fn play(
    token: &CancellationToken,
    script: &Script,
    scheduler: &SchedulerHandle,
) -> Result<(), ScriptError> {
    scheduler.set_mode(SignalMode::Direct)?;

    let loop_start = script.loop_start();
    let mut index = 0;
    let mut repetitions = 0u32;

    while let Some(ScriptLine { line, command }) = script.lines.get(index) {
        debug!("Line {}: {:?}", line, command);
        index += 1;
        match command {
            ScriptCommand::Start => {}
            ScriptCommand::Pow(power) => scheduler.set_direct(*power)?,
            ScriptCommand::Sleep(duration) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        warn!("Cancelled.");
                        return Ok(());
                    },
                    _ = tokio::time::sleep(*duration) => {}
                }
            }
            ScriptCommand::Rep(total) => {
                repetitions += 1;
                if repetitions >= *total {
                    break;
                }
                index = loop_start;
            }
            ScriptCommand::Unknown(text) => warn!("Skipping unknown command '{}'.", text),
        }
        if token.is_cancelled() {
            warn!("Cancelled.");
            return Ok(());
        }
    }

    info!("Finished.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internals::scheduler::{scheduler_channel, SchedulerCommand};

    const SCRIPT: &str = "
        START
        pow [1, 2, 3, 4, 5, 6]
        SLEEP 100

        POW [0,0,0,0,0,0]
        beep
        Sleep 50
        REP 3
    ";

    #[test]
    fn test_parse() {
        let script: Script = SCRIPT.parse().expect("Failed to parse script.");
        let commands: Vec<&ScriptCommand> = script.lines().iter().map(|l| &l.command).collect();
        assert_eq!(
            commands,
            vec![
                &ScriptCommand::Start,
                &ScriptCommand::Pow(PowerVector::new([1, 2, 3, 4, 5, 6])),
                &ScriptCommand::Sleep(Duration::from_millis(100)),
                &ScriptCommand::Pow(PowerVector::zero()),
                &ScriptCommand::Unknown("beep".into()),
                &ScriptCommand::Sleep(Duration::from_millis(50)),
                &ScriptCommand::Rep(3),
            ]
        );
        assert_eq!(script.lines()[3].line, 5);
        assert_eq!(script.loop_start(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "SLEEP".parse::<Script>(),
            Err(ScriptError::MissingArgument { line: 0 })
        ));
        assert!(matches!(
            "START\nREP many".parse::<Script>(),
            Err(ScriptError::InvalidNumber { line: 1, .. })
        ));
        assert!(matches!(
            "POW [1, 2, 3]".parse::<Script>(),
            Err(ScriptError::Power {
                reason: PowerVectorError::WrongChannelCount(3),
                ..
            })
        ));
        assert!(matches!(
            "POW [1, 2, 3, 4, 5, -6]".parse::<Script>(),
            Err(ScriptError::Power {
                reason: PowerVectorError::OutOfRange { channel: 5, .. },
                ..
            })
        ));
        assert!(matches!(
            "POW 1, 2".parse::<Script>(),
            Err(ScriptError::MissingArgument { line: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_repeats_body() {
        let script: Script = SCRIPT.parse().expect("Failed to parse script.");
        let (handle, mut inbox) = scheduler_channel();
        run_script(CancellationToken::new(), script, handle)
            .await
            .expect("Script failed.");

        let commands: Vec<SchedulerCommand> =
            std::iter::from_fn(|| inbox.try_next_command()).collect();
        assert!(matches!(
            commands.first(),
            Some(SchedulerCommand::SetMode(SignalMode::Direct))
        ));
        let vectors: Vec<PowerVector> = commands
            .iter()
            .filter_map(|c| match c {
                SchedulerCommand::SetDirect(power) => Some(*power),
                _ => None,
            })
            .collect();
        assert_eq!(vectors.len(), 6);
        assert_eq!(vectors[0], PowerVector::new([1, 2, 3, 4, 5, 6]));
        assert!(vectors[5].is_zero());
        assert!(matches!(
            commands.last(),
            Some(SchedulerCommand::StopRequesting)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_script() {
        let script: Script = "POW [1,1,1,1,1,1]\nSLEEP 100000\nPOW [2,2,2,2,2,2]"
            .parse()
            .expect("Failed to parse script.");
        let (handle, mut inbox) = scheduler_channel();
        let token = CancellationToken::new();
        let task = tokio::spawn(run_script(token.clone(), script, handle));
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        task.await
            .expect("Task panicked.")
            .expect("Script failed.");

        let commands: Vec<SchedulerCommand> =
            std::iter::from_fn(|| inbox.try_next_command()).collect();
        let directs = commands
            .iter()
            .filter(|c| matches!(c, SchedulerCommand::SetDirect(_)))
            .count();
        assert_eq!(directs, 1);
        assert!(matches!(
            commands.last(),
            Some(SchedulerCommand::StopRequesting)
        ));
    }

    #[tokio::test]
    async fn test_closed_scheduler() {
        let script: Script = "POW [1,1,1,1,1,1]".parse().expect("Failed to parse script.");
        let (handle, inbox) = scheduler_channel();
        drop(inbox);
        assert!(matches!(
            run_script(CancellationToken::new(), script, handle).await,
            Err(ScriptError::Scheduler(SchedulerError::Closed))
        ));
    }
}
