//! Scripted fakes shared by the unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bf_core::pidfile::Termination;
use bf_core::{ExecOutput, RemoteExec, TunnelError};

use crate::forward::{ForwardSpec, Forwarder};
use crate::prompt::Interaction;

type Responder = Box<dyn Fn(&str) -> Result<ExecOutput, TunnelError> + Send + Sync>;

/// Remote host answering every command through a closure
pub struct ScriptedHost {
    respond: Responder,
    pub commands: Mutex<Vec<String>>,
}

impl ScriptedHost {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Result<ExecOutput, TunnelError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }
}

#[async_trait]
impl RemoteExec for ScriptedHost {
    async fn run(&self, command: &str) -> Result<ExecOutput, TunnelError> {
        self.commands.lock().unwrap().push(command.to_string());
        (self.respond)(command)
    }

    fn host(&self) -> &str {
        "scripted"
    }
}

pub fn ok(stdout: &str) -> Result<ExecOutput, TunnelError> {
    Ok(ExecOutput {
        stdout: stdout.to_string(),
        ..Default::default()
    })
}

pub fn exit(code: i32, stderr: &str) -> Result<ExecOutput, TunnelError> {
    Ok(ExecOutput {
        stderr: stderr.to_string(),
        exit_code: code,
        ..Default::default()
    })
}

/// Forwarder keeping its channels in memory
#[derive(Default)]
pub struct FakeForwarder {
    pub(crate) next_pid: AtomicU32,
    pub live: Mutex<Vec<u32>>,
    pub opened: Mutex<Vec<ForwardSpec>>,
    /// Report no PID after opening, as if the process could not be found
    pub lose_pid: bool,
    /// Act as if autossh were not installed
    pub no_autossh: bool,
}

#[async_trait]
impl Forwarder for FakeForwarder {
    fn check_tools(&self, autossh: bool) -> Result<(), TunnelError> {
        if autossh && self.no_autossh {
            return Err(TunnelError::ToolMissing("autossh".to_string()));
        }
        Ok(())
    }

    async fn open(&self, spec: &ForwardSpec) -> Result<Option<u32>, TunnelError> {
        let pid = 5000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().push(pid);
        self.opened.lock().unwrap().push(spec.clone());
        Ok((!self.lose_pid).then_some(pid))
    }

    async fn close(&self, pid: u32, _grace: Duration) -> Termination {
        let mut live = self.live.lock().unwrap();
        let before = live.len();
        live.retain(|p| *p != pid);
        if live.len() < before {
            Termination::Exited
        } else {
            Termination::NotRunning
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.live.lock().unwrap().contains(&pid)
    }
}

/// Interaction answering from a queue of alternate ports
#[derive(Default)]
pub struct ScriptedInteraction {
    pub ports: Mutex<VecDeque<u16>>,
    pub asked: Mutex<Vec<u16>>,
}

impl ScriptedInteraction {
    pub fn with_ports(ports: &[u16]) -> Self {
        Self {
            ports: Mutex::new(ports.iter().copied().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }
}

impl Interaction for ScriptedInteraction {
    fn alternate_port(&self, busy: u16) -> Option<u16> {
        self.asked.lock().unwrap().push(busy);
        self.ports.lock().unwrap().pop_front()
    }

    fn confirm(&self, _question: &str) -> bool {
        false
    }

    fn password(&self, _prompt: &str) -> Option<String> {
        None
    }
}
