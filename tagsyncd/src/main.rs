use tagsyncd::daemon::{DaemonConfig, DaemonRuntime, authorize, logout};
use tagsyncd::logging;
use tagsyncd::sync::engine::SyncStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Authorize,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--authorize" => mode = CliMode::Authorize,
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: tagsyncd [--once | --authorize | --logout]");
        println!("  --once       Run a single sync pass and print the result");
        println!("  --authorize  Link a remote account (reads the code from stdin)");
        println!("  --logout     Remove stored credentials and exit");
        return Ok(());
    }

    logging::init()?;
    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::Authorize => authorize(&config).await,
        CliMode::Logout => logout(&config).await,
        CliMode::Once => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            match daemon.run_once().await? {
                SyncStatus::Error | SyncStatus::Unreachable => std::process::exit(1),
                _ => Ok(()),
            }
        }
        CliMode::Run | CliMode::Help => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
    }
}
