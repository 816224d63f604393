//! Serving channels the gateway opens on the tunnel.
//!
//! [`serve_channel`] is the one place that dispatches on [`Purpose`].
//! Setup failures reject the open with a reason code; once accepted, a
//! channel is closed with the process exit status when there is one.

use crate::forward::{serve_forward, ForwardPolicy};
use crate::pty::PtyHandle;
use hatch_core::{
    ChannelEvent, ChannelParams, ChannelReceiver, ChannelSender, HatchError, HatchResult,
    PendingChannel, Purpose, ReasonCode,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 16 * 1024;

/// How long to keep draining PTY output after the child has exited.
const PTY_DRAIN: Duration = Duration::from_millis(500);

/// What this device offers on its channels.
pub struct ChannelServices {
    /// Shell used for `shell` channels and to run `exec` commands.
    pub shell: String,
    /// sftp-server binary; `sftp` channels are unsupported without one.
    pub sftp_server: Option<PathBuf>,
    pub forward: ForwardPolicy,
}

impl ChannelServices {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            sftp_server: None,
            forward: ForwardPolicy::deny_all(),
        }
    }
}

/// `$SHELL`, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Serve one channel open until the channel ends.
pub async fn serve_channel(pending: PendingChannel, services: &ChannelServices) {
    let channel_id = pending.id();
    let purpose = pending.purpose();
    debug!(channel_id, purpose = %purpose, "channel open received");

    let result = match purpose {
        Purpose::Shell => serve_shell(pending, services).await,
        Purpose::Exec => serve_exec(pending, services).await,
        Purpose::PortForward => serve_forward(pending, &services.forward).await,
        Purpose::Sftp => serve_sftp(pending, services).await,
    };
    match result {
        Ok(()) => debug!(channel_id, purpose = %purpose, "channel finished"),
        Err(e) => warn!(channel_id, purpose = %purpose, error = %e, "channel failed"),
    }
}

async fn serve_shell(pending: PendingChannel, services: &ChannelServices) -> HatchResult<()> {
    let params = pending.params().clone();
    let Some(size) = params.pty else {
        // No terminal requested (or not allowed): plain pipes.
        let mut cmd = Command::new(&services.shell);
        if let Some(command) = &params.command {
            cmd.arg("-c").arg(command);
        }
        return spawn_and_run(pending, cmd, &params).await;
    };

    let pty = match PtyHandle::spawn(
        &services.shell,
        params.command.as_deref(),
        size.cols,
        size.rows,
        &params.env,
    ) {
        Ok(pty) => pty,
        Err(e) => {
            pending.reject(ReasonCode::Internal, e.to_string());
            return Err(e);
        }
    };
    let channel_id = pending.id();
    let (sender, receiver) = pending.accept()?.split();
    info!(channel_id, cols = size.cols, rows = size.rows, "shell started");
    run_pty(pty, sender, receiver).await
}

async fn serve_exec(pending: PendingChannel, services: &ChannelServices) -> HatchResult<()> {
    let params = pending.params().clone();
    let Some(command) = params.command.clone() else {
        pending.reject(ReasonCode::ProtocolViolation, "exec without a command");
        return Ok(());
    };
    let mut cmd = Command::new(&services.shell);
    cmd.arg("-c").arg(&command);
    info!(channel_id = pending.id(), command = %command, "exec");
    spawn_and_run(pending, cmd, &params).await
}

async fn serve_sftp(pending: PendingChannel, services: &ChannelServices) -> HatchResult<()> {
    let Some(server) = &services.sftp_server else {
        pending.reject(ReasonCode::Unsupported, "sftp is not enabled on this device");
        return Ok(());
    };
    let params = pending.params().clone();
    spawn_and_run(pending, Command::new(server), &params).await
}

async fn spawn_and_run(
    pending: PendingChannel,
    mut cmd: Command,
    params: &ChannelParams,
) -> HatchResult<()> {
    cmd.envs(&params.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(home) = dirs::home_dir() {
        cmd.current_dir(home);
    }
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            pending.reject(ReasonCode::Internal, format!("spawn failed: {e}"));
            return Err(e.into());
        }
    };
    let (sender, receiver) = pending.accept()?.split();
    run_process(child, sender, receiver).await
}

/// Copy a byte stream into the channel until either side ends.
pub(crate) async fn copy_to_channel<R: AsyncRead + Unpin>(mut reader: R, sender: &ChannelSender) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sender.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Pump a piped child process. stdout and stderr share the channel.
async fn run_process(
    mut child: Child,
    sender: ChannelSender,
    mut receiver: ChannelReceiver,
) -> HatchResult<()> {
    let channel_id = sender.id();
    let mut stdin = child.stdin.take();
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let sender = sender.clone();
        pumps.push(tokio::spawn(async move { copy_to_channel(stdout, &sender).await }));
    }
    if let Some(stderr) = child.stderr.take() {
        let sender = sender.clone();
        pumps.push(tokio::spawn(async move { copy_to_channel(stderr, &sender).await }));
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            event = receiver.recv() => match event {
                Some(ChannelEvent::Data(data)) => {
                    if let Some(input) = stdin.as_mut() {
                        if input.write_all(&data).await.is_err() {
                            stdin = None;
                        }
                    }
                }
                Some(ChannelEvent::Eof) => stdin = None,
                Some(ChannelEvent::Resize { .. }) => {}
                Some(ChannelEvent::Closed { .. }) | Some(ChannelEvent::Failed { .. }) | None => {
                    debug!(channel_id, "channel ended before process, killing it");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    for pump in pumps {
                        pump.abort();
                    }
                    return Ok(());
                }
            },
        }
    };

    for pump in pumps {
        let _ = pump.await;
    }
    let code = exit_code(status);
    info!(channel_id, code, "process exited");
    sender.close(Some(code));
    Ok(())
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

async fn run_pty(
    mut pty: PtyHandle,
    sender: ChannelSender,
    mut receiver: ChannelReceiver,
) -> HatchResult<()> {
    let channel_id = sender.id();
    let reader = pty.take_reader()?;
    let writer = pty.take_writer()?;

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::task::spawn_blocking(move || read_pty(reader, out_tx));
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::task::spawn_blocking(move || write_pty(writer, in_rx));

    let mut output = {
        let sender = sender.clone();
        tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                if sender.write(&chunk).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut wait = pty.spawn_wait()?;
    let code = loop {
        tokio::select! {
            result = &mut wait => {
                break result.map_err(|e| HatchError::Other(format!("join error: {e}")))??;
            }
            event = receiver.recv() => match event {
                Some(ChannelEvent::Data(data)) => {
                    if in_tx.send(data).await.is_err() {
                        debug!(channel_id, "PTY input closed");
                    }
                }
                Some(ChannelEvent::Resize { cols, rows }) => {
                    if let Err(e) = pty.resize(cols, rows) {
                        warn!(channel_id, error = %e, "resize failed");
                    }
                }
                // A terminal has no half-close.
                Some(ChannelEvent::Eof) => {}
                Some(ChannelEvent::Closed { .. }) | Some(ChannelEvent::Failed { .. }) | None => {
                    debug!(channel_id, "channel ended before shell, killing it");
                    pty.kill();
                    let _ = wait.await;
                    output.abort();
                    return Ok(());
                }
            },
        }
    };

    if tokio::time::timeout(PTY_DRAIN, &mut output).await.is_err() {
        output.abort();
    }
    info!(channel_id, code, "shell exited");
    sender.close(Some(code));
    Ok(())
}

fn read_pty(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

fn write_pty(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_core::transport::split_stream;
    use hatch_core::{Channel, ForwardTarget, MuxConfig, Role, TunnelConnection};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Gateway end of an in-memory tunnel whose agent end serves `services`.
    fn tunnel(services: ChannelServices) -> TunnelConnection {
        let (gw, agent) = tokio::io::duplex(1 << 20);
        let (gr, gww) = split_stream(gw);
        let (ar, aw) = split_stream(agent);
        let config = |role| MuxConfig {
            heartbeat_interval: None,
            ..MuxConfig::new(role)
        };
        let (gateway, _) = TunnelConnection::spawn(gr, gww, config(Role::Gateway), "gw");
        let (_agent, mut incoming) = TunnelConnection::spawn(ar, aw, config(Role::Agent), "agent");
        let services = Arc::new(services);
        tokio::spawn(async move {
            while let Some(pending) = incoming.next().await {
                let services = services.clone();
                tokio::spawn(async move { serve_channel(pending, &services).await });
            }
        });
        gateway
    }

    fn sh() -> ChannelServices {
        ChannelServices::new("/bin/sh")
    }

    /// Collect data until the channel closes.
    async fn drain(channel: &mut Channel) -> (Vec<u8>, Option<i32>) {
        let mut out = Vec::new();
        loop {
            match channel.recv().await {
                Some(ChannelEvent::Data(data)) => out.extend_from_slice(&data),
                Some(ChannelEvent::Closed { exit_status }) => return (out, exit_status),
                Some(ChannelEvent::Failed { code, message }) => panic!("failed: {code} {message}"),
                Some(_) => {}
                None => panic!("channel ended without close"),
            }
        }
    }

    fn exec(command: &str) -> ChannelParams {
        ChannelParams {
            command: Some(command.to_string()),
            ..ChannelParams::default()
        }
    }

    #[tokio::test]
    async fn exec_reports_output_and_status() {
        let gw = tunnel(sh());
        let mut ch = gw
            .open_channel(Purpose::Exec, exec("echo hello; exit 3"))
            .await
            .unwrap();
        let (out, status) = drain(&mut ch).await;
        assert_eq!(out, b"hello\n");
        assert_eq!(status, Some(3));
    }

    #[tokio::test]
    async fn exec_passes_env_and_stdin() {
        let gw = tunnel(sh());
        let mut params = exec("read line; echo \"$GREETING $line\"");
        params.env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);
        let mut ch = gw.open_channel(Purpose::Exec, params).await.unwrap();
        ch.send(b"there\n").unwrap();
        ch.sender().eof();
        let (out, status) = drain(&mut ch).await;
        assert_eq!(out, b"hi there\n");
        assert_eq!(status, Some(0));
    }

    #[tokio::test]
    async fn exec_without_command_is_rejected() {
        let gw = tunnel(sh());
        let err = gw
            .open_channel(Purpose::Exec, ChannelParams::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ReasonCode::ProtocolViolation);
    }

    #[tokio::test]
    async fn shell_without_pty_uses_pipes() {
        let gw = tunnel(sh());
        let mut ch = gw
            .open_channel(Purpose::Shell, exec("echo forced"))
            .await
            .unwrap();
        let (out, status) = drain(&mut ch).await;
        assert_eq!(out, b"forced\n");
        assert_eq!(status, Some(0));
    }

    #[tokio::test]
    async fn sftp_is_unsupported_without_server() {
        let gw = tunnel(sh());
        let err = gw
            .open_channel(Purpose::Sftp, ChannelParams::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ReasonCode::Unsupported);
    }

    #[tokio::test]
    async fn closing_the_channel_kills_the_process() {
        let gw = tunnel(sh());
        let ch = gw
            .open_channel(Purpose::Exec, exec("sleep 30"))
            .await
            .unwrap();
        ch.close(None);
        drop(ch);
        tokio::time::timeout(Duration::from_secs(5), async {
            while gw.channel_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn forward_splices_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
        });

        let mut services = sh();
        services.forward = ForwardPolicy::new(&["127.0.0.1".to_string()], 4);
        let gw = tunnel(services);
        let params = ChannelParams {
            forward: Some(ForwardTarget {
                host: "127.0.0.1".into(),
                port,
            }),
            ..ChannelParams::default()
        };
        let mut ch = gw.open_channel(Purpose::PortForward, params).await.unwrap();
        ch.send(b"ping").unwrap();
        ch.sender().eof();

        let mut echoed = Vec::new();
        loop {
            match ch.recv().await {
                Some(ChannelEvent::Data(data)) => echoed.extend_from_slice(&data),
                Some(ChannelEvent::Eof) => {}
                Some(ChannelEvent::Closed { exit_status }) => {
                    assert_eq!(exit_status, None);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(echoed, b"ping");
    }

    #[tokio::test]
    async fn forward_outside_allowlist_is_denied() {
        let gw = tunnel(sh());
        let params = ChannelParams {
            forward: Some(ForwardTarget {
                host: "127.0.0.1".into(),
                port: 22,
            }),
            ..ChannelParams::default()
        };
        let err = gw
            .open_channel(Purpose::PortForward, params)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), ReasonCode::PolicyDenied);
    }
}
