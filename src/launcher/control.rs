use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use anyhow::Context as _;
use nix::sys::socket::{
    bind, connect, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;

use crate::launcher::launcher_event;

/// Abstract-namespace name of the control socket. Holding the bind is what
/// makes an invocation "the one running instance".
pub const CONTROL_SOCKET_NAME: &str = "applauncher";

const BIND_ATTEMPTS: u32 = 20;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);
const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire commands understood by a running supervisor. The protocol is a
/// single unframed ASCII message per connection; anything else, including a
/// connection closed without data, means [`Command::Stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Restart,
    StopForRestart,
}

impl Command {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Command::Stop => b"stop",
            Command::Restart => b"restart",
            Command::StopForRestart => b"stopForRestart",
        }
    }

    pub fn from_payload(payload: &[u8]) -> Command {
        match payload {
            b"restart" => Command::Restart,
            b"stopForRestart" => Command::StopForRestart,
            _ => Command::Stop,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(std::str::from_utf8(self.as_bytes()).unwrap_or("stop"))
    }
}

fn abstract_addr(name: &str) -> anyhow::Result<UnixAddr> {
    UnixAddr::new_abstract(name.as_bytes())
        .with_context(|| format!("abstract socket address {name:?}"))
}

/// Sends one command to the live instance and closes the connection.
pub fn send_command(name: &str, cmd: Command) -> anyhow::Result<()> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("create control socket")?;
    let addr = abstract_addr(name)?;
    connect(fd.as_raw_fd(), &addr).context("connect to running instance")?;

    let mut rest = cmd.as_bytes();
    while !rest.is_empty() {
        let n = nix::unistd::write(&fd, rest).context("send control command")?;
        rest = &rest[n..];
    }
    Ok(())
}

/// Tries to become the single running instance by binding the control
/// socket.
///
/// `EADDRINUSE` means another instance is live: the command in `forward` is
/// relayed to it, then the bind is retried after a short sleep, bounded by
/// the attempt budget. This covers both the "displace the running app"
/// launch flow and the shutdown window in which the previous instance is
/// still releasing the address. Any other socket error is fatal.
pub fn claim(name: &str, forward: Command) -> anyhow::Result<OwnedFd> {
    claim_with(name, forward, BIND_ATTEMPTS, BIND_RETRY_DELAY)
}

fn claim_with(
    name: &str,
    forward: Command,
    attempts: u32,
    retry_delay: Duration,
) -> anyhow::Result<OwnedFd> {
    let addr = abstract_addr(name)?;
    let mut tries = attempts;
    while tries > 0 {
        tries -= 1;
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("create control socket")?;

        match bind(fd.as_raw_fd(), &addr) {
            Ok(()) => {
                listen(&fd, Backlog::new(5).context("listen backlog")?)
                    .context("listen on control socket")?;
                return Ok(fd);
            }
            Err(nix::errno::Errno::EADDRINUSE) => {
                launcher_event(
                    "control",
                    format!("outcome=address_in_use forward={forward} tries_left={tries}"),
                );
                if let Err(e) = send_command(name, forward) {
                    eprintln!("Failed to reach the running instance: {e:#}");
                }
                std::thread::sleep(retry_delay);
            }
            Err(e) => {
                return Err(e).context("bind control socket");
            }
        }
    }
    anyhow::bail!("another instance is still running after {attempts} bind attempts");
}

/// The server side of the control channel, owned by the supervisor for its
/// whole lifetime.
#[derive(Debug)]
pub struct ControlChannel {
    listener: UnixListener,
}

impl ControlChannel {
    /// Wraps a claimed listening socket for use on the reactor.
    pub fn from_claimed(fd: OwnedFd) -> anyhow::Result<Self> {
        let std_listener = std::os::unix::net::UnixListener::from(fd);
        std_listener
            .set_nonblocking(true)
            .context("set control socket non-blocking")?;
        let listener =
            UnixListener::from_std(std_listener).context("register control socket")?;
        Ok(Self { listener })
    }

    /// Accepts one client and reads its command.
    ///
    /// Control clients are rare and serialized, so one connection is
    /// serviced at a time. Accept or read failures and clients that stay
    /// silent past the deadline all degrade to `stop`.
    pub async fn accept_command(&self) -> Command {
        let (mut stream, _addr) = match self.listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                launcher_event("control", format!("outcome=accept_error err={e}"));
                return Command::Stop;
            }
        };

        let mut buf = [0u8; 256];
        match tokio::time::timeout(COMMAND_READ_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                let cmd = Command::from_payload(&buf[..n]);
                launcher_event("control", format!("command={cmd} bytes={n}"));
                cmd
            }
            Ok(Err(e)) => {
                launcher_event("control", format!("outcome=read_error err={e}"));
                Command::Stop
            }
            Err(_) => {
                eprintln!("No command received.");
                Command::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_ID: AtomicU32 = AtomicU32::new(0);

    fn unique_name() -> String {
        format!(
            "applauncher-test-{}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn payload_parsing_defaults_to_stop() {
        assert_eq!(Command::from_payload(b"stop"), Command::Stop);
        assert_eq!(Command::from_payload(b"restart"), Command::Restart);
        assert_eq!(Command::from_payload(b"stopForRestart"), Command::StopForRestart);
        assert_eq!(Command::from_payload(b""), Command::Stop);
        assert_eq!(Command::from_payload(b"reboot"), Command::Stop);
        assert_eq!(Command::from_payload(b"restart\n"), Command::Stop);
    }

    #[tokio::test]
    async fn claim_then_receive_commands() {
        let name = unique_name();
        let fd = claim(&name, Command::Stop).unwrap();
        let channel = ControlChannel::from_claimed(fd).unwrap();

        let sender = {
            let name = name.clone();
            tokio::task::spawn_blocking(move || send_command(&name, Command::Restart))
        };
        assert_eq!(channel.accept_command().await, Command::Restart);
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_payload_reads_as_stop() {
        let name = unique_name();
        let channel = ControlChannel::from_claimed(claim(&name, Command::Stop).unwrap()).unwrap();

        let addr = abstract_addr(&name).unwrap();
        let client = tokio::task::spawn_blocking(move || {
            let fd = socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )
            .unwrap();
            connect(fd.as_raw_fd(), &addr).unwrap();
            nix::unistd::write(&fd, b"frobnicate").unwrap();
        });
        assert_eq!(channel.accept_command().await, Command::Stop);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn connection_without_data_reads_as_stop() {
        let name = unique_name();
        let channel = ControlChannel::from_claimed(claim(&name, Command::Stop).unwrap()).unwrap();

        let addr = abstract_addr(&name).unwrap();
        let client = tokio::task::spawn_blocking(move || {
            let fd = socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )
            .unwrap();
            connect(fd.as_raw_fd(), &addr).unwrap();
            // Dropping fd closes the connection with zero bytes sent.
        });
        assert_eq!(channel.accept_command().await, Command::Stop);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn second_instance_forwards_its_command_and_gives_up() {
        let name = unique_name();
        let channel = ControlChannel::from_claimed(claim(&name, Command::Stop).unwrap()).unwrap();

        let second = {
            let name = name.clone();
            tokio::task::spawn_blocking(move || {
                claim_with(&name, Command::StopForRestart, 2, Duration::from_millis(10))
            })
        };
        // The loser relays its command to us, once per bind attempt.
        assert_eq!(channel.accept_command().await, Command::StopForRestart);
        assert!(second.await.unwrap().is_err());
    }
}
