use std::time::Duration;

use crate::EngineError;
use crate::ftp::control::{ControlConnection, ControlTimeouts};
use crate::ftp::script::{LoginScript, ScriptVars};

use super::{Flow, Worker, WorkerState, WorkerSubState};

/// Result of one connect attempt chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ConnectOutcome {
    Connected,
    /// Stop was requested while connecting.
    Stopping,
    /// Login failed and the policy forbids silent retry; the worker parks in
    /// `ConnectionError` until the user supplies new parameters.
    GaveUp,
}

impl Worker {
    /// Drive the connect phases: resolve + TCP, greeting, optional AUTH
    /// TLS/PBSZ/PROT observation, login script, MODE Z, init commands, SYST.
    /// Transport failures reconnect with the host-configured delay; login
    /// failures give up unless `retry_login_without_asking` is set.
    pub(super) fn ensure_connection(&mut self) -> ConnectOutcome {
        loop {
            if self.poll_control() == Flow::Stop {
                return ConnectOutcome::Stopping;
            }
            self.connect_attempts += 1;
            {
                let mut shared = self.shared.lock().expect("worker shared lock");
                shared.connect_attempts = self.connect_attempts;
            }
            self.set_state(WorkerState::Connecting, WorkerSubState::ResolvingAddress);
            match self.connect_once() {
                Ok(()) => {
                    self.connect_attempts = 0;
                    let mut shared = self.shared.lock().expect("worker shared lock");
                    shared.connect_attempts = 0;
                    shared.last_error = None;
                    return ConnectOutcome::Connected;
                }
                Err(err) => {
                    self.conn = None;
                    let retriable = err
                        .downcast_ref::<EngineError>()
                        .map(EngineError::is_retriable_connect)
                        .unwrap_or(true);
                    self.note_error(err.to_string());
                    tracing::debug!("[worker {}] connect failed: {}", self.id, err);
                    if !retriable && !self.op.params.server.retry_login_without_asking {
                        return ConnectOutcome::GaveUp;
                    }
                    self.set_state(WorkerState::WaitingForReconnect, WorkerSubState::None);
                    let delay = Duration::from_secs(self.op.params.reconnect_delay_secs.max(1));
                    if self.sleep_interruptible(delay) == Flow::Stop {
                        return ConnectOutcome::Stopping;
                    }
                }
            }
        }
    }

    fn connect_once(&mut self) -> anyhow::Result<()> {
        let params = self.op.params.server.clone();
        let mut conn =
            ControlConnection::connect(&params.host, params.port, ControlTimeouts::default())?;

        self.set_sub_state(WorkerSubState::WaitingForGreeting);
        let greeting = conn.read_greeting()?;
        if !greeting.is_success() {
            return Err(EngineError::LoginRejected(greeting.text.trim_end().to_string()).into());
        }

        // AUTH TLS / PBSZ / PROT sequencing is observed, not negotiated; a
        // refusal just leaves the connection plain.
        if params.use_tls {
            let auth = conn.command("AUTH TLS")?;
            if auth.is_success() {
                let _ = conn.command("PBSZ 0")?;
                let _ = conn.command("PROT P")?;
            } else {
                tracing::debug!("[worker {}] AUTH TLS refused: {}", self.id, auth.first_line());
            }
        }

        self.set_sub_state(WorkerSubState::RunningLoginScript);
        let script = match params.proxy_script.as_deref() {
            Some(text) => LoginScript::parse(text)?,
            None => LoginScript::standard(params.account.is_some()),
        };
        let vars = self.script_vars(&params);
        script.run(&vars, |cmd| conn.command(cmd))?;
        conn.invalidate_working_dir();

        // MODE Z is offered once per connection; agreement is recorded only.
        if params.offer_compression {
            let reply = conn.command("MODE Z")?;
            conn.compression_agreed = reply.is_success();
            if !conn.compression_agreed {
                // Put the mode back to stream in case the server half-took it.
                let _ = conn.command("MODE S")?;
            }
        }

        if !params.init_commands.is_empty() {
            self.set_sub_state(WorkerSubState::RunningInitCommands);
            for cmd in &params.init_commands {
                let reply = conn.command(cmd)?;
                if !reply.is_success() {
                    tracing::warn!(
                        "[worker {}] init command '{}' answered {}",
                        self.id,
                        cmd,
                        reply.first_line()
                    );
                }
            }
            conn.invalidate_working_dir();
        }

        self.set_sub_state(WorkerSubState::QueryingSystem);
        let _ = conn.query_system()?;
        if conn.server_system.is_none() {
            conn.server_system = params.server_system.clone();
        }

        tracing::debug!(
            "[worker {}] connected to {} (system: {:?})",
            self.id,
            conn.addr,
            conn.server_system
        );
        self.conn = Some(conn);
        Ok(())
    }

    fn script_vars(&self, params: &crate::operation::ServerParams) -> ScriptVars {
        let (over_user, over_password, over_account) = match &self.login_override {
            Some((u, p, a)) => (u.clone(), p.clone(), a.clone()),
            None => (None, None, None),
        };
        ScriptVars {
            host: Some(params.host.clone()),
            port: Some(params.port),
            user: over_user.or_else(|| Some(params.user.clone())),
            password: over_password.or_else(|| params.password.clone()),
            account: over_account.or_else(|| params.account.clone()),
            proxy_host: params.proxy_host.clone(),
            proxy_port: params.proxy_port,
            proxy_user: params.proxy_user.clone(),
            proxy_password: params.proxy_password.clone(),
        }
    }
}
