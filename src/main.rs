use clap::Parser;
use livesession::{DebugProfile, DebugSessionController, DebugTarget, SessionConfig, TerminalEvent};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod kube;

use kube::{ConsoleAttach, KubectlCommands, KubectlTunnel};

/// Run a debuggee inside a dev container and keep a debugger attached to it
#[derive(Parser, Debug)]
#[command(name = "livedebug", version)]
struct Args {
    #[arg(short, long)]
    namespace: String,
    /// Workload name, e.g. the deployment
    #[arg(short, long)]
    workload: String,
    #[arg(long, default_value = "deployment")]
    resource_type: String,
    #[arg(short, long, default_value = "nocalhost-dev")]
    container: String,
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
    /// Working directory inside the container
    #[arg(long, default_value = "/home/nocalhost-dev")]
    work_dir: String,
    /// java, go or ruby
    #[arg(short, long)]
    language: String,
    /// Debug port inside the container
    #[arg(long)]
    remote_port: u16,
    /// Local port for the tunnel, 0 picks a free one
    #[arg(long, default_value_t = 0)]
    local_port: u16,
    /// Shell command that starts the debuggee
    #[arg(long)]
    command: String,
    /// JSON file with session timeouts
    #[arg(long)]
    config: Option<PathBuf>,
}

fn print_terminal_event(event: TerminalEvent) {
    let mut stdout = std::io::stdout();
    match event {
        TerminalEvent::Output(text) => {
            let _ = write!(stdout, "{}", text.replace("\r\n", "\n"));
        }
        TerminalEvent::Clear => {
            let _ = write!(stdout, "\x1b[2J\x1b[H");
        }
        TerminalEvent::Bound { pid } => log::debug!("Debug terminal bound (PID {:?})", pid),
        TerminalEvent::Unbound { exit_code } => {
            log::debug!("Debug terminal released (exit code {:?})", exit_code)
        }
    }
    let _ = stdout.flush();
}

async fn run(args: Args) -> livesession::Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let target = DebugTarget {
        namespace: args.namespace,
        workload_name: args.workload,
        resource_type: args.resource_type,
        container_name: args.container,
        kubeconfig_path: args.kubeconfig,
        work_dir: args.work_dir,
    };
    let profile = DebugProfile {
        language: args.language,
        remote_port: args.remote_port,
        command: args.command,
    };

    let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel();
    let controller = Arc::new(
        DebugSessionController::new(
            config,
            Arc::new(KubectlTunnel { local_port: args.local_port }),
            Arc::new(KubectlCommands),
        )
        .with_terminal_sink(terminal_tx),
    );

    tokio::spawn(async move {
        while let Some(event) = terminal_rx.recv().await {
            print_terminal_event(event);
        }
    });

    let input = controller.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(terminal) = input.terminal() {
                terminal.write(&format!("{}\n", line)).await;
            }
        }
    });

    let interrupt = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, stopping debug session");
            interrupt.cancel();
        }
    });

    controller
        .launch(target, profile, Arc::new(ConsoleAttach::default()))
        .await
}

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("livesession", log::LevelFilter::Debug)
        .with_module_level("debugprobe", log::LevelFilter::Debug)
        .init()
        .unwrap();

    let args = Args::parse();
    log::info!("livedebug starting for {}/{}", args.namespace, args.workload);

    let exit_code = match run(args).await {
        Ok(()) => 0,
        Err(livesession::SessionError::Cancelled) => 130,
        Err(e) => {
            eprintln!("{}", e.user_message());
            1
        }
    };
    log::info!("livedebug exited with code: {exit_code}");
    std::process::exit(exit_code);
}
