use std::{io::SeekFrom, path::Path, time::Duration};

use clap::Parser;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn, Level};
use uart_monitor::{
    cli::{self, Cli, Commands, MonitorArgs},
    config::{Config, DeviceFilter},
    control::{self, ControlCommand},
    daemon::{self, Notify, PidFile},
    identify::{table, PortIdentifier, SysfsIdentifier},
    logging,
    reactor::ReactorBuilder,
    serial::Baud,
    session,
};

const TAIL_POLL: Duration = Duration::from_millis(200);

// How much history `tail` shows before following.
const TAIL_LINES: usize = 10;
const TAIL_WINDOW: u64 = 64 * 1024;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };

    if let Some(log_root) = cli.log_root {
        config.log_root = log_root;
    }

    match cli.command {
        Commands::Monitor(args) => monitor(config, args).await,
        Commands::Identify { verbose } => {
            identify(verbose);
            Ok(())
        }
        Commands::Status => ask(&config, ControlCommand::Status).await,
        Commands::Yield { device } => ask(&config, ControlCommand::Yield(device)).await,
        Commands::Reclaim { device } => ask(&config, ControlCommand::Reclaim(device)).await,
        Commands::Tail { name } => tail(&config, &name).await,
        Commands::Examples(example) => match example {
            cli::Examples::Config => {
                println!("{}", Config::example().serialize_pretty()?);
                Ok(())
            }
        },
    }
}

async fn monitor(mut config: Config, args: MonitorArgs) -> Result<()> {
    if let Some(baud) = args.baud {
        config.baud = Baud::new(baud)?;
    }
    if let Some(only) = args.only {
        config.only = DeviceFilter::parse(&only);
    }
    config.proxy |= args.proxy;

    config.validate()?;

    std::fs::create_dir_all(&config.log_root)
        .wrap_err_with(|| format!("Cannot create log root {}", config.log_root.display()))?;

    let file_logging = config
        .file_logging
        .then(|| (Level::DEBUG, config.log_root.clone()));
    logging::init(Level::INFO, file_logging).await;
    debug!(?config, "Config");

    let _pid_file = PidFile::acquire(&config.pid_path())?;

    let mut reactor = ReactorBuilder::new(config).build()?;
    reactor.rescan();

    if args.systemd {
        notify(Notify::Ready);
    }

    reactor.run().await;

    if args.systemd {
        notify(Notify::Stopping);
    }

    reactor.shutdown();
    logging::shutdown();

    Ok(())
}

fn notify(state: Notify) {
    match daemon::notify(state) {
        Ok(true) => {}
        Ok(false) => debug!("No service manager to notify"),
        Err(e) => warn!(?e, ?state, "Could not notify service manager"),
    }
}

fn identify(verbose: bool) {
    let ports = SysfsIdentifier::default().scan();
    let groups = table::group(&ports);

    print!("{}", table::render(&groups, verbose));
}

async fn ask(config: &Config, command: ControlCommand) -> Result<()> {
    let socket = config.socket_path();

    let response = control::send_command(&socket, &command)
        .await
        .wrap_err_with(|| {
            format!(
                "Cannot reach the daemon at {}, is it running?",
                socket.display()
            )
        })?;

    print!("{response}");

    if response.starts_with("ERROR") {
        return Err(eyre!("The daemon refused `{command}`"));
    }

    Ok(())
}

async fn tail(config: &Config, name: &str) -> Result<()> {
    let path = session::latest_log(&config.log_root, name);

    if !path.is_file() {
        let available = session::latest_logs(&config.log_root);

        eprintln!("No log for `{name}` in the latest session.");
        if available.is_empty() {
            eprintln!("No logs found under {}", config.log_root.display());
        } else {
            eprintln!("Available logs:");
            for log in available {
                eprintln!("  {log}");
            }
        }

        return Err(eyre!("No log for `{name}`"));
    }

    tokio::select! {
        result = follow(&path) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting");
            Ok(())
        }
    }
}

async fn follow(path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .wrap_err_with(|| format!("Cannot open {}", path.display()))?;
    let mut stdout = tokio::io::stdout();

    let len = file.metadata().await?.len();
    let window = len.min(TAIL_WINDOW);
    file.seek(SeekFrom::Start(len - window)).await?;

    let mut tail = vec![0u8; window as usize];
    file.read_exact(&mut tail).await?;
    stdout
        .write_all(&tail[session::tail_offset(&tail, TAIL_LINES)..])
        .await?;
    stdout.flush().await?;

    let mut buf = vec![0u8; 4096];

    loop {
        let n = file.read(&mut buf).await?;

        if n == 0 {
            // Truncated from under us: start over.
            let len = tokio::fs::metadata(path).await?.len();
            if len < file.stream_position().await? {
                file.rewind().await?;
            }

            tokio::time::sleep(TAIL_POLL).await;
            continue;
        }

        stdout.write_all(&buf[..n]).await?;
        stdout.flush().await?;
    }
}
