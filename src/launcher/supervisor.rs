use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Context as _;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Pid};
use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE, SIGTERM};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncReadExt, Interest};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::launcher::config::{Config, ConfigSource};
use crate::launcher::control::{Command as ControlCommand, ControlChannel};
use crate::launcher::launcher_event;
use crate::launcher::perf::PerfHandoff;

/// How long a terminated child may take to exit before it is killed.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

const FORWARD_BUF_BYTES: usize = 16 * 1024;

/// Banner fragment a debug stub prints when it forks the real process.
const DEBUGGEE_MARKER: &[u8] = b" created; pid = ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Restarting,
    Crashed,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Starting => "STARTING",
            Phase::Running => "RUNNING",
            Phase::Stopping => "STOPPING",
            Phase::Restarting => "RESTARTING",
            Phase::Crashed => "CRASHED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the reactor should do after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit(i32),
}

/// Outcome of one forwarding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardStatus {
    Done,
    /// A byte appeared on the signal pipe while the destination was full.
    /// The byte is left in the pipe for the reactor to pick up.
    Interrupted,
}

/// One readiness event, produced by the single multiplexed wait point.
enum Event {
    Signal,
    Control(ControlCommand),
    Profiler(std::io::Result<(TcpStream, std::net::SocketAddr)>),
    Stdout(std::io::Result<usize>),
    Stderr(std::io::Result<usize>),
    Exited(std::io::Result<ExitStatus>),
}

/// First failing check of the spawn-failure diagnostic pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryDiagnosis {
    Ok,
    Missing,
    NotAFile,
    NotReadable,
    NotExecutable,
    TooSmall,
    Unreadable,
    BadMagic,
}

impl BinaryDiagnosis {
    fn message(&self) -> &'static str {
        match self {
            BinaryDiagnosis::Ok => "Binary looks fine.",
            BinaryDiagnosis::Missing => "Binary does not exist.",
            BinaryDiagnosis::NotAFile => "Binary is not a file.",
            BinaryDiagnosis::NotReadable => "Binary is not readable.",
            BinaryDiagnosis::NotExecutable => "Binary is not executable.",
            BinaryDiagnosis::TooSmall => "Binary is smaller than 4 bytes.",
            BinaryDiagnosis::Unreadable => "Could not open binary to analyze.",
            BinaryDiagnosis::BadMagic => "Binary is not an ELF file.",
        }
    }
}

fn analyze_binary(binary: &Path) -> BinaryDiagnosis {
    use std::io::Read as _;

    let meta = match std::fs::metadata(binary) {
        Ok(m) => m,
        Err(_) => return BinaryDiagnosis::Missing,
    };
    if !meta.is_file() {
        return BinaryDiagnosis::NotAFile;
    }
    if nix::unistd::access(binary, nix::unistd::AccessFlags::R_OK).is_err() {
        return BinaryDiagnosis::NotReadable;
    }
    if nix::unistd::access(binary, nix::unistd::AccessFlags::X_OK).is_err() {
        return BinaryDiagnosis::NotExecutable;
    }
    if meta.len() < 4 {
        return BinaryDiagnosis::TooSmall;
    }
    let mut header = [0u8; 4];
    let read = std::fs::File::open(binary).and_then(|mut f| f.read_exact(&mut header));
    if read.is_err() {
        return BinaryDiagnosis::Unreadable;
    }
    if header != [0x7f, b'E', b'L', b'F'] {
        return BinaryDiagnosis::BadMagic;
    }
    BinaryDiagnosis::Ok
}

fn parse_debuggee_pid(data: &[u8]) -> Option<i32> {
    let at = data
        .windows(DEBUGGEE_MARKER.len())
        .position(|w| w == DEBUGGEE_MARKER)?;
    let rest = &data[at + DEBUGGEE_MARKER.len()..];
    let digits: &[u8] = match rest.iter().position(|b| !b.is_ascii_digit()) {
        Some(0) => return None,
        Some(end) => &rest[..end],
        None => rest,
    };
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// The argv/env actually handed to the spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LaunchPlan {
    binary: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

/// Merges the startup argument vector with the effective configuration.
///
/// Config args go after the caller's arguments. Config env entries only
/// apply when the ambient environment does not already define the key;
/// the base/platform variables are always set when non-empty.
fn compose_launch(startup_args: &[String], config: &Config) -> LaunchPlan {
    let mut all = startup_args.to_vec();
    all.extend(config.args.iter().cloned());
    let binary = all.remove(0);

    let mut env = vec![];
    for (key, value) in &config.env {
        if std::env::var_os(key).is_none() {
            env.push((key.clone(), value.clone()));
        }
    }
    if !config.base.is_empty() {
        env.push(("APPLAUNCHER_BASE".to_string(), config.base.clone()));
    }
    if !config.platform.is_empty() {
        env.push(("APPLAUNCHER_PLATFORM".to_string(), config.platform.clone()));
    }

    LaunchPlan {
        binary,
        args: all,
        env,
    }
}

/// Writes `data` to `dest` in full, handling partial writes.
///
/// A destination that reports "would block" parks the write on a
/// multiplexed wait that also watches the signal pipe, so a shutdown
/// request is never starved by a slow consumer. Any other write failure is
/// fatal to the caller.
async fn forward_output(
    signal_rx: &AsyncFd<OwnedFd>,
    dest: BorrowedFd<'_>,
    data: &[u8],
) -> anyhow::Result<ForwardStatus> {
    let mut rest = data;
    while !rest.is_empty() {
        match nix::unistd::write(dest, rest) {
            Ok(n) => rest = &rest[n..],
            Err(Errno::EAGAIN) => {
                let writable = AsyncFd::with_interest(dest, Interest::WRITABLE)
                    .context("register forwarding destination")?;
                tokio::select! {
                    _ = signal_rx.readable() => return Ok(ForwardStatus::Interrupted),
                    guard = writable.writable() => {
                        let mut guard = guard.context("wait for writable destination")?;
                        guard.clear_ready();
                    }
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("cannot forward application output"),
        }
    }
    Ok(ForwardStatus::Done)
}

/// Resolves once at least one byte has been written to the signal pipe and
/// drains whatever is there.
async fn wait_for_signal(signal_rx: &AsyncFd<OwnedFd>) {
    loop {
        let mut guard = match signal_rx.readable().await {
            Ok(g) => g,
            Err(e) => {
                launcher_event("signal", format!("outcome=pipe_error err={e}"));
                std::future::pending::<()>().await;
                return;
            }
        };
        let mut buf = [0u8; 16];
        match guard.try_io(|fd| {
            nix::unistd::read(fd.get_ref().as_raw_fd(), &mut buf)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        }) {
            Ok(_) => return,
            Err(_would_block) => continue,
        }
    }
}

async fn next_command(control: &Option<ControlChannel>) -> ControlCommand {
    match control {
        Some(channel) => channel.accept_command().await,
        None => std::future::pending().await,
    }
}

async fn accept_profiler(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn read_chunk<R>(stream: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match stream {
        Some(s) => s.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(c) => c.wait().await,
        None => std::future::pending().await,
    }
}

/// Owns the current application: spawns it, forwards its output, and funnels
/// every way of stopping it (control command, OS signal, child exit) through
/// one shutdown path.
pub struct Supervisor {
    source: ConfigSource,
    base_config: Config,
    startup_args: Vec<String>,
    binary: String,
    child: Option<Child>,
    child_stdout: Option<ChildStdout>,
    child_stderr: Option<ChildStderr>,
    debug_scan_pending: bool,
    debuggee: Option<i32>,
    stdout_dest: OwnedFd,
    being_restarted: bool,
    phase: Phase,
    signal_rx: AsyncFd<OwnedFd>,
    _signal_tx: OwnedFd,
}

impl Supervisor {
    /// Sets up the self-pipe and signal handlers. Must run on the reactor
    /// runtime; nothing is spawned until [`Supervisor::run`].
    ///
    /// `expect_debugger` arms the one-shot scan of the child's first stderr
    /// chunk for the debug stub's pid banner.
    pub fn new(
        source: ConfigSource,
        base_config: Config,
        startup_args: Vec<String>,
        stdout_dest: OwnedFd,
        expect_debugger: bool,
    ) -> anyhow::Result<Self> {
        let (rx, tx) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).context("create signal pipe")?;
        // Handlers only ever write one byte to the pipe; everything else
        // runs later on the reactor.
        for sig in [SIGINT, SIGTERM, SIGHUP, SIGPIPE] {
            signal_hook::low_level::pipe::register_raw(sig, tx.as_raw_fd())
                .with_context(|| format!("register handler for signal {sig}"))?;
        }
        let signal_rx =
            AsyncFd::with_interest(rx, Interest::READABLE).context("register signal pipe")?;

        Ok(Self {
            source,
            base_config,
            startup_args,
            binary: String::new(),
            child: None,
            child_stdout: None,
            child_stderr: None,
            debug_scan_pending: expect_debugger,
            debuggee: None,
            stdout_dest,
            being_restarted: false,
            phase: Phase::Idle,
            signal_rx,
            _signal_tx: tx,
        })
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            launcher_event("proc", format!("phase={phase}"));
        }
    }

    /// Spawns the application from the stored startup arguments merged with
    /// a freshly re-read configuration.
    fn startup(&mut self) -> anyhow::Result<()> {
        self.being_restarted = false;
        self.set_phase(Phase::Starting);

        // The overlay fragments are expected to change between launches, so
        // they are re-scanned on every start, not just the first one.
        let effective = self.source.effective(&self.base_config);
        let plan = compose_launch(&self.startup_args, &effective);
        self.binary = plan.binary.clone();
        launcher_event(
            "proc",
            format!("attempt=start binary={} args={:?}", plan.binary, plan.args),
        );

        let mut cmd = Command::new(&plan.binary);
        cmd.args(&plan.args)
            .envs(plan.env.iter().cloned())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                println!("Failed to start");
                launcher_event(
                    "proc",
                    format!("outcome=spawn_failed binary={} err={e}", plan.binary),
                );
                let diagnosis = analyze_binary(Path::new(&plan.binary));
                if diagnosis != BinaryDiagnosis::Ok {
                    println!("{}", diagnosis.message());
                }
                self.set_phase(Phase::Idle);
                return Err(anyhow::anyhow!("failed to start {}", plan.binary));
            }
        };

        self.child_stdout = child.stdout.take();
        self.child_stderr = child.stderr.take();
        self.child = Some(child);
        self.set_phase(Phase::Running);
        Ok(())
    }

    fn start(&mut self, args: Vec<String>) -> anyhow::Result<()> {
        self.startup_args = args;
        self.startup()
    }

    /// The shared shutdown path for `stop` commands, OS signals and
    /// restarts.
    ///
    /// With no child running this is a no-op that also ends the
    /// supervisor's run, unless a restart is pending.
    async fn handle_stop(&mut self) -> Flow {
        if self.child.is_none() {
            println!("No process running");
            if self.being_restarted {
                return Flow::Continue;
            }
            self.set_phase(Phase::Idle);
            return Flow::Exit(0);
        }

        self.set_phase(Phase::Stopping);
        self.kill_debuggee();
        self.kill_own_process_group();
        if let Some(status) = self.terminate_child().await {
            self.report_child_exit(status);
        }
        // The group TERM above also hit our own handler; that byte must not
        // read back as a fresh external stop request.
        self.drain_signal_pipe();

        if self.being_restarted {
            Flow::Continue
        } else {
            Flow::Exit(0)
        }
    }

    /// A debug stub's forked process does not die with the stub; it is
    /// killed directly when its pid is known.
    fn kill_debuggee(&mut self) {
        if let Some(pid) = self.debuggee.take() {
            launcher_event("proc", format!("attempt=kill_debuggee pid={pid}"));
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => eprintln!("Could not kill debuggee {pid}: {e}"),
            }
        }
    }

    /// Terminates forked descendants by signalling the whole group. Only
    /// effective when the supervisor leads its own group (debug runs);
    /// otherwise the group does not exist and ESRCH is expected.
    fn kill_own_process_group(&self) {
        let group = Pid::from_raw(-(std::process::id() as i32));
        match kill(group, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => eprintln!("Could not signal own process group: {e}"),
        }
    }

    async fn terminate_child(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        self.child_stdout = None;
        self.child_stderr = None;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                launcher_event("proc", format!("outcome=wait_error err={e}"));
                None
            }
            Err(_elapsed) => {
                launcher_event(
                    "proc",
                    format!(
                        "outcome=terminate_timeout timeout_ms={} decision=kill",
                        CHILD_EXIT_TIMEOUT.as_millis()
                    ),
                );
                let _ = child.start_kill();
                match child.wait().await {
                    Ok(status) => Some(status),
                    Err(e) => {
                        launcher_event("proc", format!("outcome=wait_error err={e}"));
                        None
                    }
                }
            }
        }
    }

    fn drain_signal_pipe(&self) {
        let fd = self.signal_rx.get_ref().as_raw_fd();
        let mut buf = [0u8; 64];
        while matches!(nix::unistd::read(fd, &mut buf), Ok(n) if n > 0) {}
    }

    fn report_child_exit(&mut self, status: ExitStatus) -> i32 {
        let code = match status.code() {
            Some(code) => {
                println!("Application exited with exit code {code}");
                code
            }
            None => {
                println!("Application stopped: {}", self.binary);
                1
            }
        };
        let phase = if self.being_restarted {
            Phase::Restarting
        } else if status.code().is_none() {
            Phase::Crashed
        } else {
            Phase::Idle
        };
        self.set_phase(phase);
        code
    }

    async fn restart(&mut self) -> Flow {
        println!("Restarting application");
        self.being_restarted = true;
        if let Flow::Exit(code) = self.handle_stop().await {
            return Flow::Exit(code);
        }
        match self.startup() {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Exit(1),
        }
    }

    /// Stops the application but keeps the supervisor and its control
    /// channel alive, awaiting a later `restart` command.
    async fn stop_for_restart(&mut self) -> Flow {
        println!("Stopping application for restart");
        self.being_restarted = true;
        self.handle_stop().await
    }

    fn scan_for_debuggee(&mut self, data: &[u8]) {
        if !self.debug_scan_pending {
            return;
        }
        // Best-effort banner match; only the first chunk is ever looked at.
        self.debug_scan_pending = false;
        if let Some(pid) = parse_debuggee_pid(data) {
            launcher_event("proc", format!("debuggee_pid={pid}"));
            self.debuggee = Some(pid);
        }
    }

    async fn on_stdout(&mut self, result: std::io::Result<usize>, buf: &[u8]) -> Flow {
        match result {
            Ok(0) => {
                self.child_stdout = None;
                Flow::Continue
            }
            Ok(n) => self.forward_stdout_chunk(&buf[..n]).await,
            Err(e) => {
                launcher_event("proc", format!("stream=stdout outcome=read_error err={e}"));
                self.child_stdout = None;
                Flow::Continue
            }
        }
    }

    async fn forward_stdout_chunk(&mut self, data: &[u8]) -> Flow {
        match forward_output(&self.signal_rx, self.stdout_dest.as_fd(), data).await {
            Ok(_) => Flow::Continue,
            Err(e) => self.forwarding_failed(e).await,
        }
    }

    async fn on_stderr(&mut self, result: std::io::Result<usize>, buf: &[u8]) -> Flow {
        match result {
            Ok(0) => {
                self.child_stderr = None;
                Flow::Continue
            }
            Ok(n) => {
                let data = &buf[..n];
                self.scan_for_debuggee(data);
                let stderr = std::io::stderr();
                match forward_output(&self.signal_rx, stderr.as_fd(), data).await {
                    Ok(_) => Flow::Continue,
                    Err(e) => self.forwarding_failed(e).await,
                }
            }
            Err(e) => {
                launcher_event("proc", format!("stream=stderr outcome=read_error err={e}"));
                self.child_stderr = None;
                Flow::Continue
            }
        }
    }

    /// A forwarding failure other than backpressure takes the application
    /// down with the supervisor.
    async fn forwarding_failed(&mut self, e: anyhow::Error) -> Flow {
        eprintln!("Cannot forward application output: {e:#}");
        let _ = self.handle_stop().await;
        Flow::Exit(1)
    }

    /// Forwards whatever the child left in its pipes after exiting.
    async fn drain_child_output(&mut self) {
        let mut buf = vec![0u8; FORWARD_BUF_BYTES];
        loop {
            let n = match self.child_stdout.as_mut() {
                Some(s) => s.read(&mut buf).await.unwrap_or(0),
                None => break,
            };
            if n == 0 {
                self.child_stdout = None;
                continue;
            }
            if self.forward_stdout_chunk(&buf[..n]).await != Flow::Continue {
                return;
            }
        }
        loop {
            let n = match self.child_stderr.as_mut() {
                Some(s) => s.read(&mut buf).await.unwrap_or(0),
                None => break,
            };
            if n == 0 {
                self.child_stderr = None;
                continue;
            }
            let data = &buf[..n];
            self.scan_for_debuggee(data);
            let stderr = std::io::stderr();
            if forward_output(&self.signal_rx, stderr.as_fd(), data).await.is_err() {
                return;
            }
        }
    }

    async fn on_child_exit(&mut self, result: std::io::Result<ExitStatus>) -> Flow {
        self.drain_child_output().await;
        self.child = None;
        self.child_stdout = None;
        self.child_stderr = None;
        match result {
            Ok(status) => {
                let code = self.report_child_exit(status);
                if self.being_restarted {
                    Flow::Continue
                } else {
                    Flow::Exit(code)
                }
            }
            Err(e) => {
                launcher_event("proc", format!("outcome=wait_error err={e}"));
                if self.being_restarted {
                    Flow::Continue
                } else {
                    Flow::Exit(1)
                }
            }
        }
    }

    /// Runs the reactor until the application exits or a stop is requested.
    /// Returns the supervisor's process exit code.
    ///
    /// With a profiling handoff pending, the application start is deferred
    /// until the profiling client connects; its socket then becomes the
    /// stdout destination.
    pub async fn run(
        mut self,
        control: Option<ControlChannel>,
        perf: Option<PerfHandoff>,
    ) -> i32 {
        let mut perf_listener = None;
        let mut perf_argv = vec![];
        match perf {
            Some(handoff) => {
                match prepare_perf_listener(handoff.listener) {
                    Ok(l) => {
                        perf_listener = Some(l);
                        perf_argv = handoff.argv;
                    }
                    Err(e) => {
                        eprintln!("Could not wait for profiling connection: {e:#}");
                        return 1;
                    }
                }
            }
            None => {
                if self.startup().is_err() {
                    return 1;
                }
            }
        }

        let mut out_buf = vec![0u8; FORWARD_BUF_BYTES];
        let mut err_buf = vec![0u8; FORWARD_BUF_BYTES];
        loop {
            let event = tokio::select! {
                _ = wait_for_signal(&self.signal_rx) => Event::Signal,
                cmd = next_command(&control) => Event::Control(cmd),
                conn = accept_profiler(&perf_listener) => Event::Profiler(conn),
                n = read_chunk(&mut self.child_stdout, &mut out_buf) => Event::Stdout(n),
                n = read_chunk(&mut self.child_stderr, &mut err_buf) => Event::Stderr(n),
                status = wait_child(&mut self.child) => Event::Exited(status),
            };

            let flow = match event {
                Event::Signal => {
                    launcher_event("signal", "outcome=termination_requested");
                    self.handle_stop().await
                }
                Event::Control(cmd) => match cmd {
                    ControlCommand::Stop => self.handle_stop().await,
                    ControlCommand::Restart => self.restart().await,
                    ControlCommand::StopForRestart => self.stop_for_restart().await,
                },
                Event::Profiler(result) => match result {
                    Ok((stream, peer)) => {
                        launcher_event("profiler", format!("outcome=connected peer={peer}"));
                        perf_listener = None;
                        match profiler_dest_fd(stream) {
                            Ok(dest) => {
                                self.stdout_dest = dest;
                                let argv = std::mem::take(&mut perf_argv);
                                match self.start(argv) {
                                    Ok(()) => Flow::Continue,
                                    Err(_) => Flow::Exit(1),
                                }
                            }
                            Err(e) => {
                                eprintln!("Could not adopt profiling connection: {e:#}");
                                Flow::Exit(1)
                            }
                        }
                    }
                    Err(e) => {
                        launcher_event("profiler", format!("outcome=accept_error err={e}"));
                        Flow::Continue
                    }
                },
                Event::Stdout(result) => self.on_stdout(result, &out_buf).await,
                Event::Stderr(result) => self.on_stderr(result, &err_buf).await,
                Event::Exited(result) => self.on_child_exit(result).await,
            };

            if let Flow::Exit(code) = flow {
                launcher_event("proc", format!("outcome=supervisor_exit code={code}"));
                return code;
            }
        }
    }
}

fn prepare_perf_listener(listener: std::net::TcpListener) -> anyhow::Result<TcpListener> {
    listener
        .set_nonblocking(true)
        .context("set profiling listener non-blocking")?;
    TcpListener::from_std(listener).context("register profiling listener")
}

fn profiler_dest_fd(stream: TcpStream) -> anyhow::Result<OwnedFd> {
    let std_stream = stream
        .into_std()
        .context("detach profiling socket from reactor")?;
    // Stays non-blocking: forwarding handles EAGAIN by waiting for
    // writability.
    Ok(OwnedFd::from(std_stream))
}
