use std::os::fd::AsFd as _;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use nix::unistd::Pid;

use crate::launcher::config::{ConfigSource, DebugInterface};
use crate::launcher::control::{self, Command as ControlCommand, ControlChannel};
use crate::launcher::daemonize::{self, Forked};
use crate::launcher::perf::{self, PerfHandoff};
use crate::launcher::portlist::{self, PortList};
use crate::launcher::supervisor::Supervisor;
use crate::launcher::{bootdefault, build_info};

#[derive(Debug, Parser)]
#[command(name = "applauncher", about = "Single-instance application launcher")]
pub struct Args {
    /// Port range to use for debugging and profiling connections
    #[arg(long = "port-range", value_name = "RANGE")]
    pub port_range: Option<String>,

    /// Launch under gdbserver on an allocated port
    #[arg(long = "debug-gdb")]
    pub debug_gdb: bool,

    /// Enable QML debugging on an allocated port
    #[arg(long = "debug-qml")]
    pub debug_qml: bool,

    /// Comma-separated QML debug services to expose
    #[arg(long = "qml-debug-services", value_name = "SERVICES")]
    pub qml_debug_services: Option<String>,

    /// Parameters passed to "perf record"; comma-separated, escape a
    /// literal comma by doubling it
    #[arg(long = "profile-perf", value_name = "PARAMS")]
    pub profile_perf: Option<String>,

    /// Stop the running application
    #[arg(long)]
    pub stop: bool,

    /// Ask the running instance to restart its application
    #[arg(long)]
    pub restart: bool,

    /// Stop the running application but keep its supervisor waiting for a
    /// later restart
    #[arg(long = "stop-for-restart")]
    pub stop_for_restart: bool,

    /// Start without stopping an already running application
    #[arg(long)]
    pub launch: bool,

    /// Show platform information
    #[arg(long = "show-platform")]
    pub show_platform: bool,

    /// Make this application the default on boot
    #[arg(long = "make-default", value_name = "BINARY")]
    pub make_default: Option<String>,

    /// Restore the default application
    #[arg(long = "remove-default")]
    pub remove_default: bool,

    /// Print version information
    #[arg(long)]
    pub version: bool,

    /// Start the application as usual, then go into the background
    #[arg(long)]
    pub detach: bool,

    /// Executable to launch, followed by its arguments
    #[arg(
        value_name = "EXECUTABLE [ARGS]...",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

fn forwarded_command(args: &Args) -> Option<ControlCommand> {
    if args.stop {
        Some(ControlCommand::Stop)
    } else if args.restart {
        Some(ControlCommand::Restart)
    } else if args.stop_for_restart {
        Some(ControlCommand::StopForRestart)
    } else {
        None
    }
}

fn qml_debug_argument(port: u16, services: Option<&str>) -> String {
    match services {
        Some(list) => format!("-qmljsdebugger=port:{port},block,services:{list}"),
        None => format!("-qmljsdebugger=port:{port},block"),
    }
}

/// Injects the requested debugging tools into the user's command line.
///
/// GDB wraps the whole command in `gdbserver <iface>:<port>`; the QML
/// debugger argument goes right after the binary, before the user's own
/// arguments. A public debug interface leaves the host part empty so the
/// stub listens on all interfaces.
fn rewrite_startup_args(
    command: &[String],
    gdb_port: Option<u16>,
    debug_interface: DebugInterface,
    qml_port: Option<u16>,
    qml_services: Option<&str>,
) -> Vec<String> {
    let mut argv = vec![];
    if let Some(port) = gdb_port {
        let interface = match debug_interface {
            DebugInterface::Local => "localhost",
            DebugInterface::Public => "",
        };
        argv.push("gdbserver".to_string());
        argv.push(format!("{interface}:{port}"));
    }
    argv.push(command[0].clone());
    if let Some(port) = qml_port {
        argv.push(qml_debug_argument(port, qml_services));
    }
    argv.extend(command[1..].iter().cloned());
    argv
}

fn allocate_port(range: &mut PortList) -> anyhow::Result<u16> {
    portlist::find_first_free_port(range)
        .ok_or_else(|| anyhow::anyhow!("could not find an unused port in range"))
}

pub fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    if args.version {
        println!("{}", build_info::banner());
        return Ok(ExitCode::SUCCESS);
    }

    let source = ConfigSource::system();
    let config = source.load_base();

    if args.show_platform {
        println!("base:{}", config.base);
        println!("platform:{}", config.platform);
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(binary) = &args.make_default {
        bootdefault::make_default(binary)?;
        return Ok(ExitCode::SUCCESS);
    }
    if args.remove_default {
        bootdefault::remove_default()?;
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(cmd) = forwarded_command(&args) {
        if let Err(e) = control::send_command(control::CONTROL_SOCKET_NAME, cmd) {
            eprintln!("Could not reach a running instance: {e:#}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    anyhow::ensure!(!args.command.is_empty(), "no binary to execute");
    anyhow::ensure!(
        !(args.detach && (args.debug_gdb || args.debug_qml)),
        "detached debugging is not possible; --detach cannot be combined with --debug-gdb or --debug-qml"
    );

    if args.debug_gdb {
        // Becoming a session/group leader makes the group kill during stop
        // reach the debug stub's descendants. Must precede setsid.
        let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
        let _ = nix::unistd::setsid();
    }

    let mut range = match args.port_range.as_deref() {
        Some(spec) => {
            let range = PortList::from_spec(spec);
            anyhow::ensure!(range.has_more(), "invalid port range");
            range
        }
        None => PortList::default(),
    };
    if (args.debug_gdb || args.debug_qml) && !range.has_more() {
        anyhow::bail!("--port-range is mandatory with --debug-gdb and --debug-qml");
    }

    let gdb_port = if args.debug_gdb {
        Some(allocate_port(&mut range)?)
    } else {
        None
    };
    let qml_port = if args.debug_qml {
        Some(allocate_port(&mut range)?)
    } else {
        None
    };
    if let Some(port) = qml_port {
        println!("QML Debugger: Going to wait for connection on port {port}...");
    }

    let startup_args = rewrite_startup_args(
        &args.command,
        gdb_port,
        config.debug_interface,
        qml_port,
        args.qml_debug_services.as_deref(),
    );

    // Claiming the control socket is what makes this invocation the single
    // running instance; a plain launch displaces whoever held it. --launch
    // skips the claim entirely (fire and forget).
    let claimed = if args.launch {
        None
    } else {
        Some(
            control::claim(control::CONTROL_SOCKET_NAME, ControlCommand::Stop)
                .context("could not create server socket")?,
        )
    };

    let perf = match args.profile_perf.as_deref() {
        Some(params) => {
            let params = perf::extract_perf_params(params);
            let (listener, port) = portlist::bind_first_free(&mut range)
                .ok_or_else(|| anyhow::anyhow!("could not find an unused port in range"))?;
            println!("AppLauncher: Going to wait for perf connection on port {port}...");
            Some(PerfHandoff {
                listener,
                argv: perf::perf_record_argv(&params, &startup_args),
            })
        }
        None => None,
    };

    // The control socket fd survives the forks; everything async is created
    // afterwards, on the daemon side.
    if args.detach && daemonize::detach()? == Forked::Parent {
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let code = runtime.block_on(async {
        let control_channel = match claimed {
            Some(fd) => Some(ControlChannel::from_claimed(fd)?),
            None => None,
        };
        let stdout_dest = std::io::stdout()
            .as_fd()
            .try_clone_to_owned()
            .context("duplicate stdout")?;
        let supervisor = Supervisor::new(
            source,
            config,
            startup_args,
            stdout_dest,
            args.debug_gdb,
        )?;
        anyhow::Ok(supervisor.run(control_channel, perf).await)
    })?;

    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_command_passes_through() {
        let argv = rewrite_startup_args(
            &cmd(&["/usr/bin/app", "--fullscreen"]),
            None,
            DebugInterface::Local,
            None,
            None,
        );
        assert_eq!(argv, cmd(&["/usr/bin/app", "--fullscreen"]));
    }

    #[test]
    fn gdb_wraps_the_command() {
        let argv = rewrite_startup_args(
            &cmd(&["/usr/bin/app", "--fullscreen"]),
            Some(5000),
            DebugInterface::Local,
            None,
            None,
        );
        assert_eq!(
            argv,
            cmd(&["gdbserver", "localhost:5000", "/usr/bin/app", "--fullscreen"])
        );
    }

    #[test]
    fn public_debug_interface_listens_on_all_interfaces() {
        let argv = rewrite_startup_args(
            &cmd(&["/usr/bin/app"]),
            Some(5000),
            DebugInterface::Public,
            None,
            None,
        );
        assert_eq!(argv[1], ":5000");
    }

    #[test]
    fn qml_argument_goes_before_user_arguments() {
        let argv = rewrite_startup_args(
            &cmd(&["/usr/bin/app", "--fullscreen"]),
            None,
            DebugInterface::Local,
            Some(5001),
            None,
        );
        assert_eq!(
            argv,
            cmd(&["/usr/bin/app", "-qmljsdebugger=port:5001,block", "--fullscreen"])
        );
    }

    #[test]
    fn qml_services_are_appended() {
        assert_eq!(
            qml_debug_argument(5001, Some("DebugMessages,QmlProfiler")),
            "-qmljsdebugger=port:5001,block,services:DebugMessages,QmlProfiler"
        );
    }

    #[test]
    fn gdb_and_qml_compose() {
        let argv = rewrite_startup_args(
            &cmd(&["/usr/bin/app", "--a"]),
            Some(5000),
            DebugInterface::Local,
            Some(5001),
            None,
        );
        assert_eq!(
            argv,
            cmd(&[
                "gdbserver",
                "localhost:5000",
                "/usr/bin/app",
                "-qmljsdebugger=port:5001,block",
                "--a",
            ])
        );
    }

    #[test]
    fn command_line_stops_parsing_at_the_executable() {
        let args = Args::parse_from([
            "applauncher",
            "--port-range",
            "5000-5010",
            "/usr/bin/app",
            "--stop",
        ]);
        assert_eq!(args.port_range.as_deref(), Some("5000-5010"));
        assert_eq!(args.command, cmd(&["/usr/bin/app", "--stop"]));
        // "--stop" after the executable belongs to the application.
        assert!(!args.stop);
    }

    #[test]
    fn forwarded_command_picks_the_requested_action() {
        let stop = Args::parse_from(["applauncher", "--stop"]);
        assert_eq!(forwarded_command(&stop), Some(ControlCommand::Stop));
        let restart = Args::parse_from(["applauncher", "--restart"]);
        assert_eq!(forwarded_command(&restart), Some(ControlCommand::Restart));
        let sfr = Args::parse_from(["applauncher", "--stop-for-restart"]);
        assert_eq!(forwarded_command(&sfr), Some(ControlCommand::StopForRestart));
        let none = Args::parse_from(["applauncher", "/usr/bin/app"]);
        assert_eq!(forwarded_command(&none), None);
    }
}
