use crate::error::ScopeError;
use crate::protocol::{self, Command, ExecutionReport};
use crate::transport::Transport;
use crate::types::ExecutionStatus;
use crate::utils::{poll_until, PollError};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Timing and retry settings of the device link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Malformed status frames tolerated per command before giving up
    pub max_protocol_retries: usize,
    /// Interval between status reads while a command is in progress
    pub poll_interval_ms: u64,
    /// Default time allowed for a command to reach a terminal status
    pub command_timeout_ms: u64,
    /// Time allowed for homing, which travels the full axis range
    pub homing_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_protocol_retries: 3,
            poll_interval_ms: 5,
            command_timeout_ms: 10_000,
            homing_timeout_ms: 60_000,
        }
    }
}

impl LinkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkState {
    Idle,
    Sent { command: Command },
    Completed,
    Failed,
}

/// Command/acknowledgment cycle over a [`Transport`].
///
/// The protocol has no message identifiers, so at most one command may be
/// outstanding. A second [`DeviceLink::submit`] while a command is in flight
/// fails with [`ScopeError::LinkBusy`]. Input left over from an earlier
/// command is discarded before sending, and status frames that echo a
/// different command code are skipped.
pub struct DeviceLink {
    transport: Box<dyn Transport>,
    config: LinkConfig,
    state: LinkState,
    sent_at: Option<Instant>,
}

impl DeviceLink {
    pub fn new(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self {
            transport,
            config,
            state: LinkState::Idle,
            sent_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Encode and transmit a command (`Idle -> Sent`)
    pub fn submit(&mut self, command: Command) -> Result<(), ScopeError> {
        if let LinkState::Sent { command: in_flight } = self.state {
            warn!("Rejected {command:?}: {in_flight:?} still outstanding");
            return Err(ScopeError::LinkBusy { in_flight });
        }
        self.state = LinkState::Idle;

        let frame = protocol::encode(&command)?;
        let stale = self.transport.discard_input()?;
        if stale > 0 {
            warn!("Discarded {stale} stale status frame(s) before {command:?}");
        }
        debug!("Sending {command:?}: {frame:02x?}");
        self.transport.send(&frame)?;

        self.state = LinkState::Sent { command };
        self.sent_at = Some(Instant::now());
        Ok(())
    }

    /// Wait for the terminal status of the outstanding command
    pub fn await_completion(&mut self, timeout: Duration) -> Result<ExecutionReport, ScopeError> {
        let LinkState::Sent { command } = self.state else {
            return Err(ScopeError::NothingOutstanding);
        };

        let max_retries = self.config.max_protocol_retries.max(1);
        let poll_interval = self.config.poll_interval();
        let mut malformed = 0usize;
        let transport = &mut self.transport;

        let outcome = poll_until(timeout, poll_interval, || -> Result<Option<ExecutionReport>, ScopeError> {
            let Some(frame) = transport.receive()? else {
                return Ok(None);
            };
            let report = match protocol::decode(&frame) {
                Ok(report) => report,
                Err(source) => {
                    malformed += 1;
                    warn!("Malformed status frame {malformed}/{max_retries} for {command:?}: {source}");
                    if malformed >= max_retries {
                        return Err(ScopeError::Protocol {
                            command,
                            attempts: malformed,
                            source,
                        });
                    }
                    return Ok(None);
                }
            };
            if report.command_code != command.code() {
                warn!(
                    "Skipping status frame for command code {} while waiting for {command:?}",
                    report.command_code
                );
                return Ok(None);
            }

            match report.status {
                ExecutionStatus::InProgress => Ok(None),
                ExecutionStatus::CompletedWithoutErrors => Ok(Some(report)),
                status => Err(ScopeError::DeviceExecution {
                    command,
                    axis: command.axis(),
                    status,
                }),
            }
        });

        let waited = self.sent_at.map(|t| t.elapsed()).unwrap_or_default();
        match outcome {
            Ok(report) => {
                debug!("{command:?} completed after {waited:?}");
                self.state = LinkState::Completed;
                Ok(report)
            }
            Err(e) => {
                self.state = LinkState::Failed;
                let err = match e {
                    PollError::Expired { .. } => ScopeError::Timeout { command, waited },
                    PollError::Failed(err) => err,
                };
                error!("{err}");
                Err(err)
            }
        }
    }

    /// Submit a command and wait for its terminal status
    pub fn execute(&mut self, command: Command, timeout: Duration) -> Result<ExecutionReport, ScopeError> {
        self.submit(command)?;
        self.await_completion(timeout)
    }
}
