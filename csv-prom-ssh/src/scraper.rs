use std::sync::Arc;
use std::time::Duration;

use csv_prom_config::TargetSpec;
use csv_prom_metrics::{ColumnReader, LabelSet, MetricRegistry};
use quanta::Clock;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ParserExit, SshError};
use crate::parser::LogParser;

/// Remote command run to tail the target file from the current end-of-file
/// (spec §4.4 "equivalent to `tail -n0 --follow=name`"). `2>/dev/null`
/// suppresses the remote `tail`'s own diagnostics from polluting the stream.
fn tail_command(file: &str) -> String {
    format!("tail -n0 --follow=name {} 2>/dev/null", shell_quote(file))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

const COOLDOWN: Duration = Duration::from_secs(30);

/// Per-target SSH connect/tail/reconnect state machine (spec §4.4). Owns its
/// own cancellation token; the `Supervisor` drops this handle (after
/// awaiting `run`'s return) to tear a target down.
pub struct SSHScraper {
    target: TargetSpec,
    readers: Arc<Vec<ColumnReader>>,
    registry: Arc<MetricRegistry>,
    clock: Clock,
}

impl SSHScraper {
    pub fn new(target: TargetSpec, readers: Arc<Vec<ColumnReader>>, registry: Arc<MetricRegistry>) -> Self {
        Self { target, readers, registry, clock: Clock::new() }
    }

    /// Runs the `connecting → tailing → cooldown → connecting ...` loop
    /// until `cancel` fires. Returns once `terminated` is reached.
    pub async fn run(mut self, cancel: CancellationToken) {
        let connected_labels = {
            let mut labels = LabelSet::new(&self.target.environment);
            labels.set("host", self.target.host.clone());
            labels
        };
        let connected = self.registry.connected().with_labels(&connected_labels);

        let span = tracing::info_span!(
            "ssh_scraper",
            environment = %self.target.environment,
            host = %self.target.host,
            file = self.target.connection.file.as_deref().unwrap_or(""),
        );
        let _entered = span.enter();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            connected.set(0.0, self.clock.now()).ok();

            match self.connect_and_tail(&cancel).await {
                Ok(ParserExit::Cancelled) => break,
                Ok(ParserExit::EndOfStream) => {
                    info!("remote tail stream ended; reconnecting after cooldown");
                }
                Ok(ParserExit::StreamStarvation) => {
                    warn!("stream_starvation: no data within the read timeout; reconnecting");
                }
                Err(err) => {
                    error!(error = %err, "ssh session failed, entering cooldown");
                }
            }

            connected.set(0.0, self.clock.now()).ok();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(COOLDOWN) => {}
            }
        }

        self.registry.connected().drop_labels(&connected_labels);
    }

    /// Connects, launches the remote tail, and feeds its stdout to a
    /// `LogParser` until the stream ends, starves, errors, or `cancel`
    /// fires. On success, returns the reason the parser stopped; any
    /// connect/auth/channel failure surfaces as `Err`.
    async fn connect_and_tail(&mut self, cancel: &CancellationToken) -> Result<ParserExit, SshError> {
        let connect_timeout = Duration::from_secs(self.target.connection.connect_timeout());
        let read_timeout = Duration::from_millis(self.target.connection.read_timeout_ms());

        let mut session = tokio::time::timeout(connect_timeout, self.connect())
            .await
            .map_err(|_| SshError::Timeout(connect_timeout))??;

        self.authenticate(&mut session).await?;

        let mut channel =
            session.channel_open_session().await.map_err(SshError::Connection)?;
        let file = self
            .target
            .connection
            .file
            .clone()
            .expect("TargetSpec construction guarantees `file` is present");
        channel.exec(true, tail_command(&file)).await.map_err(SshError::Connection)?;

        let connected_labels = {
            let mut labels = LabelSet::new(&self.target.environment);
            labels.set("host", self.target.host.clone());
            labels
        };
        self.registry.connected().with_labels(&connected_labels).set(1.0, self.clock.now()).ok();

        let (pipe_reader, mut pipe_writer) = tokio::io::duplex(64 * 1024);
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<Option<u32>>();

        // The channel is owned exclusively by this task for its whole
        // lifetime, so both "stop the remote command" (on starvation or
        // cancellation) and "read its output" are driven from the one place
        // that holds it, rather than fighting over a shared borrow.
        let pump_handle = tokio::spawn(async move {
            let mut exit_status = None;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        channel.close().await.ok();
                        break;
                    }
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if pipe_writer.write_all(&data).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            exit_status = Some(status);
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            exit_tx.send(exit_status).ok();
        });

        let mut parser = LogParser::new(
            self.target.environment.clone(),
            self.target.target_id.clone(),
            self.readers.clone(),
            self.registry.clone(),
            read_timeout,
        );

        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stop_tx.send(()).ok();
                ParserExit::Cancelled
            }
            exit = parser.run(BufReader::new(pipe_reader), cancel) => {
                if exit == ParserExit::StreamStarvation {
                    // Cancel the remote command before reconnecting, per
                    // spec §4.4 "the remote command is cancelled first".
                    stop_tx.send(()).ok();
                }
                exit
            }
        };

        pump_handle.await.ok();
        let exit_status = exit_rx.await.unwrap_or(None);

        session.disconnect(Disconnect::ByApplication, "", "").await.ok();

        if let Some(status) = exit_status {
            if status != 0 && exit != ParserExit::Cancelled {
                return Err(SshError::NonZeroExit(status));
            }
        }

        Ok(exit)
    }

    async fn connect(&self) -> Result<Handle<ScraperHandler>, SshError> {
        let config = Arc::new(client::Config::default());
        let addr = (self.target.host.as_str(), 22);
        client::connect(config, addr, ScraperHandler)
            .await
            .map_err(SshError::Connection)
    }

    async fn authenticate(&self, session: &mut Handle<ScraperHandler>) -> Result<(), SshError> {
        let user = self
            .target
            .connection
            .user
            .clone()
            .expect("TargetSpec construction guarantees `user` is present");

        let authenticated = if let Some(pkey_path) = &self.target.connection.pkey {
            let passphrase = self.target.connection.pkey_passphrase.as_deref();
            let key_pair = russh_keys::load_secret_key(pkey_path, passphrase)
                .map_err(|_| SshError::Auth { user: user.clone() })?;
            session
                .authenticate_publickey(&user, Arc::new(key_pair))
                .await
                .map_err(SshError::Connection)?
        } else if let Some(password) = &self.target.connection.password {
            session.authenticate_password(&user, password).await.map_err(SshError::Connection)?
        } else {
            return Err(SshError::Auth { user });
        };

        if authenticated {
            Ok(())
        } else {
            Err(SshError::Auth { user })
        }
    }
}

/// Minimal `russh` client handler. Host-key verification is intentionally
/// permissive: the spec treats SSH transport failures uniformly as
/// `ssh_connection_error`/`ssh_auth_error` and says nothing about a known-
/// hosts store, so there is nowhere to persist or compare fingerprints
/// against.
struct ScraperHandler;

impl client::Handler for ScraperHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &russh_keys::key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_command_quotes_the_filename() {
        assert_eq!(
            tail_command("/var/log/app's.log"),
            r"tail -n0 --follow=name '/var/log/app'\''s.log' 2>/dev/null"
        );
    }

    #[test]
    fn tail_command_is_well_formed_for_a_plain_path() {
        assert_eq!(tail_command("/var/log/app.log"), "tail -n0 --follow=name '/var/log/app.log' 2>/dev/null");
    }
}
