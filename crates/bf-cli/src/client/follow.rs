//! Client side of the log channel
//!
//! A follower starts attached to the push stream. If that stream closes
//! before the terminal sentinel arrives it switches to polling, resuming
//! from the number of complete lines already received. Every input goes
//! through [`FollowMachine::step`]; the driver only performs I/O.
//!
//! The push sentinel carries the subprocess exit code, which does not say
//! whether the job was stopped. Seeing it moves the follower to the pull
//! side for one confirming poll; the job status comes from that page.
//!
//! Lines around the handover may be delivered twice. Consumers render a
//! growing transcript, so a repeated tail line is harmless.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use bf_core::error::{BfError, JobError};
use bf_core::types::{parse_done_line, JobId, JobStatus};
use bf_server::api::NOT_FOUND_FRAME;
use bf_server::jobs::LogPage;

use super::JobClient;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_POLLS: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    AttachedPush,
    AttachedPull,
    Terminal,
}

/// Something that happened on either side of the channel
#[derive(Debug, Clone)]
pub enum FollowInput {
    /// Text frame from the push stream
    Frame(String),
    /// The push stream closed
    PushClosed,
    /// The push stream could not be opened or broke
    PushFailed(String),
    /// Reply to a poll
    Page(LogPage),
    /// A poll failed
    PollFailed(String),
}

/// Published to the consumer of a follower
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowEvent {
    /// One log line, without its newline
    Line(String),
    /// The job reached a terminal state
    ///
    /// `status` is `None` when the sentinel was seen but the server could
    /// not be asked for the final status afterwards.
    Finished {
        status: Option<JobStatus>,
        returncode: Option<i32>,
    },
    /// Artifacts of the finished job
    ArtifactsAvailable(Vec<String>),
    /// Polling stopped before the job finished
    GaveUp { polls: u32 },
}

impl FollowEvent {
    /// Whether a `Finished` event reports a completed job
    ///
    /// An unconfirmed finish is never a success: a stopped job can exit 0.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            FollowEvent::Finished {
                status: Some(JobStatus::Completed),
                ..
            }
        )
    }
}

/// Transition function of a follower
#[derive(Debug)]
pub struct FollowMachine {
    state: FollowState,
    /// Complete lines received so far; the `since` bookmark for polling
    offset: usize,
    /// Text of a frame that did not end in a newline yet
    partial: String,
    /// Exit code from the push sentinel, awaiting a confirming poll
    sentinel: Option<Option<i32>>,
    polls: u32,
    max_polls: u32,
}

impl FollowMachine {
    pub fn new(max_polls: u32) -> Self {
        Self {
            state: FollowState::AttachedPush,
            offset: 0,
            partial: String::new(),
            sentinel: None,
            polls: 0,
            max_polls,
        }
    }

    pub fn state(&self) -> FollowState {
        self.state
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn step(&mut self, input: FollowInput) -> Vec<FollowEvent> {
        match (self.state, input) {
            (FollowState::AttachedPush, FollowInput::Frame(text)) => self.on_frame(&text),
            (FollowState::AttachedPush, FollowInput::PushClosed) => {
                self.handover("push stream closed before the job finished");
                Vec::new()
            }
            (FollowState::AttachedPush, FollowInput::PushFailed(reason)) => {
                self.handover(&reason);
                Vec::new()
            }
            (FollowState::AttachedPull, FollowInput::Page(page)) => self.on_page(page),
            (FollowState::AttachedPull, FollowInput::PollFailed(reason)) => {
                tracing::debug!("Poll failed: {}", reason);
                match self.sentinel {
                    Some(returncode) => {
                        tracing::warn!("Job finished but its final status is unknown: {}", reason);
                        self.state = FollowState::Terminal;
                        vec![FollowEvent::Finished {
                            status: None,
                            returncode,
                        }]
                    }
                    None => self.count_poll(),
                }
            }
            // Late input from the side we already left
            (state, input) => {
                tracing::trace!("Ignoring {:?} in state {:?}", input, state);
                Vec::new()
            }
        }
    }

    fn on_frame(&mut self, text: &str) -> Vec<FollowEvent> {
        self.partial.push_str(text);
        let mut events = Vec::new();
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            self.offset += 1;
            if let Some(returncode) = parse_done_line(line) {
                tracing::debug!("Sentinel seen, confirming status by poll");
                self.sentinel = Some(returncode);
                self.partial.clear();
                self.state = FollowState::AttachedPull;
                break;
            }
            events.push(FollowEvent::Line(line.to_string()));
        }
        events
    }

    fn handover(&mut self, reason: &str) {
        tracing::info!("Switching to polling at offset {} ({})", self.offset, reason);
        // An incomplete line is replayed by the first poll
        self.partial.clear();
        self.state = FollowState::AttachedPull;
    }

    fn on_page(&mut self, page: LogPage) -> Vec<FollowEvent> {
        let mut events: Vec<FollowEvent> = page
            .logs
            .into_iter()
            .filter(|entry| parse_done_line(&entry.line).is_none())
            .map(|entry| FollowEvent::Line(entry.line))
            .collect();
        self.offset = self.offset.max(page.next_offset);

        if page.status.is_terminal() {
            self.state = FollowState::Terminal;
            events.push(FollowEvent::Finished {
                status: Some(page.status),
                returncode: page.returncode,
            });
            return events;
        }
        events.extend(self.count_poll());
        events
    }

    fn count_poll(&mut self) -> Vec<FollowEvent> {
        self.polls += 1;
        if self.polls >= self.max_polls {
            tracing::warn!("Giving up after {} polls", self.polls);
            self.state = FollowState::Terminal;
            return vec![FollowEvent::GaveUp { polls: self.polls }];
        }
        Vec::new()
    }
}

/// Follows one job and publishes [`FollowEvent`]s
pub struct LogFollower {
    client: JobClient,
    id: JobId,
    machine: FollowMachine,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<FollowEvent>,
}

impl LogFollower {
    /// Create a follower and the receiver its events are published on
    pub fn new(client: JobClient, id: JobId) -> (Self, mpsc::UnboundedReceiver<FollowEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let follower = Self {
            client,
            id,
            machine: FollowMachine::new(DEFAULT_MAX_POLLS),
            poll_interval: DEFAULT_POLL_INTERVAL,
            events,
        };
        (follower, rx)
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.machine = FollowMachine::new(max_polls);
        self
    }

    fn apply(&mut self, input: FollowInput) {
        for event in self.machine.step(input) {
            // A consumer that went away just stops listening
            let _ = self.events.send(event);
        }
    }

    /// Follow the job until it finishes or polling gives up
    pub async fn run(mut self) -> Result<(), BfError> {
        let url = self.client.ws_url(&self.id);
        tracing::debug!("Attaching to {}", url);

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                while self.machine.state() == FollowState::AttachedPush {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if text.trim_end() == NOT_FOUND_FRAME {
                                return Err(JobError::NotFound(self.id.to_string()).into());
                            }
                            self.apply(FollowInput::Frame(text));
                        }
                        Some(Ok(Message::Close(_))) | None => self.apply(FollowInput::PushClosed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => self.apply(FollowInput::PushFailed(e.to_string())),
                    }
                }
            }
            Err(e) => self.apply(FollowInput::PushFailed(e.to_string())),
        }

        while self.machine.state() == FollowState::AttachedPull {
            match self.client.logs(&self.id, self.machine.offset()).await {
                Ok(page) => self.apply(FollowInput::Page(page)),
                Err(BfError::Job(JobError::NotFound(id))) => {
                    return Err(JobError::NotFound(id).into())
                }
                Err(e) => self.apply(FollowInput::PollFailed(e.to_string())),
            }
            if self.machine.state() == FollowState::AttachedPull {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        match self.client.artifacts(&self.id).await {
            Ok(artifacts) if !artifacts.is_empty() => {
                let _ = self.events.send(FollowEvent::ArtifactsAvailable(artifacts));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Could not list artifacts: {}", e),
        }
        Ok(())
    }
}
