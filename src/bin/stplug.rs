use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use stplug::app::{App, ProgressSink};
use stplug::config::ConfigLoader;
use stplug::domain::{FixKind, ResourceId};
use stplug::error::{ErrorKind, StplugError};
use stplug::output::{ConsoleProgress, JsonOutput, OutputMode};

#[derive(Parser)]
#[command(name = "stplug")]
#[command(about = "Install stplug-in Lua scripts from ranked mirrors and manage game fixes")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./stplug.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download and install the script for an app id")]
    Add(IdArgs),
    #[command(about = "Remove an installed script")]
    Remove(IdArgs),
    #[command(about = "List installed scripts")]
    List,
    #[command(about = "Show the enabled download sources in priority order")]
    Sources,
    #[command(about = "Check, apply and revert game fixes")]
    Fix(FixArgs),
}

#[derive(Args)]
struct IdArgs {
    id: String,
}

#[derive(Args)]
struct FixArgs {
    #[command(subcommand)]
    command: FixCommand,
}

#[derive(Subcommand)]
enum FixCommand {
    #[command(about = "Probe the fix servers for an app id")]
    Check(IdArgs),
    #[command(about = "Download a fix archive into an install directory")]
    Apply(ApplyArgs),
    #[command(about = "Revert applied fixes using the transaction log")]
    Remove(UnfixArgs),
    #[command(about = "List fixes recorded in installed games")]
    List,
}

#[derive(Args)]
struct ApplyArgs {
    id: String,

    #[arg(long)]
    url: String,

    #[arg(long)]
    path: Utf8PathBuf,

    #[arg(long = "type", default_value = "Generic Fix")]
    fix_type: String,

    #[arg(long)]
    game: Option<String>,
}

#[derive(Args)]
struct UnfixArgs {
    id: String,

    #[arg(long)]
    path: Option<Utf8PathBuf>,

    /// Only revert the fix logged with this date
    #[arg(long)]
    date: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<StplugError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &StplugError) -> u8 {
    match error.kind() {
        ErrorKind::Validation => 2,
        ErrorKind::Network => 3,
        ErrorKind::Filesystem | ErrorKind::Cancelled => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = App::from_config(&config)?;

    match cli.command {
        Commands::Add(args) => run_add(&app, parse_id(&args.id)?, output_mode),
        Commands::Remove(args) => {
            let result = app.remove_script(parse_id(&args.id)?)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
                OutputMode::Human => {
                    if result.removed.is_empty() {
                        println!("No script installed for {}", result.id);
                    }
                    for path in &result.removed {
                        println!("Removed {path}");
                    }
                    Ok(())
                }
            }
        }
        Commands::List => {
            let result = app.installed_scripts()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
                OutputMode::Human => {
                    for script in &result.scripts {
                        let state = if script.disabled { " (disabled)" } else { "" };
                        println!(
                            "{:>10}  {}{state}  {} bytes  {}",
                            script.id, script.name, script.size, script.modified
                        );
                    }
                    Ok(())
                }
            }
        }
        Commands::Sources => {
            let result = app.sources()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
                OutputMode::Human => {
                    if result.sources.is_empty() {
                        println!("No sources configured");
                    }
                    for (rank, source) in result.sources.iter().enumerate() {
                        println!("{}. {}  {}", rank + 1, source.name, source.url_template);
                    }
                    Ok(())
                }
            }
        }
        Commands::Fix(args) => run_fix(&app, args.command, output_mode),
    }
}

fn parse_id(raw: &str) -> Result<ResourceId, StplugError> {
    raw.parse()
}

fn sink_for(output_mode: OutputMode) -> Box<dyn ProgressSink> {
    match output_mode {
        OutputMode::Json => Box::new(JsonOutput),
        OutputMode::Human => Box::new(ConsoleProgress),
    }
}

fn finish<T: Serialize>(
    output_mode: OutputMode,
    status: &T,
    success: bool,
    error: Option<&str>,
    done_message: String,
) -> miette::Result<()> {
    if let OutputMode::Json = output_mode {
        JsonOutput::print(status).into_diagnostic()?;
    }
    if success {
        if let OutputMode::Human = output_mode {
            println!("{done_message}");
        }
        return Ok(());
    }
    Err(miette::Report::msg(
        error.unwrap_or("operation did not complete").to_string(),
    ))
}

fn run_add(app: &App, id: ResourceId, output_mode: OutputMode) -> miette::Result<()> {
    app.start_download(id)?;
    let status = app.wait_for_download(id, sink_for(output_mode).as_ref());
    let message = format!(
        "Installed {id} from {} -> {}",
        status.api_used.as_deref().unwrap_or("-"),
        status
            .installed_path
            .as_ref()
            .map(|path| path.as_str())
            .unwrap_or("-")
    );
    finish(
        output_mode,
        &status,
        status.success,
        status.error.as_deref(),
        message,
    )
}

fn run_fix(app: &App, command: FixCommand, output_mode: OutputMode) -> miette::Result<()> {
    match command {
        FixCommand::Check(args) => {
            let result = app.check_fix_availability(parse_id(&args.id)?);
            match output_mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
                OutputMode::Human => {
                    println!("{} ({})", result.game_name, result.appid);
                    for (label, probe) in [
                        ("Generic fix", &result.generic_fix),
                        ("Online fix", &result.online_fix),
                    ] {
                        match &probe.url {
                            Some(url) => println!("  {label}: available at {url}"),
                            None => println!("  {label}: not available (status {})", probe.status),
                        }
                    }
                    Ok(())
                }
            }
        }
        FixCommand::Apply(args) => {
            let id = parse_id(&args.id)?;
            let kind = args
                .fix_type
                .parse::<FixKind>()
                .unwrap_or_else(|never| match never {});
            app.apply_fix(id, &args.url, args.path.clone(), kind, args.game)?;
            let status = app.wait_for_fix(id, sink_for(output_mode).as_ref());
            let message = format!(
                "Applied fix to {} ({} files)",
                args.path, status.files_extracted
            );
            finish(
                output_mode,
                &status,
                status.success,
                status.error.as_deref(),
                message,
            )
        }
        FixCommand::Remove(args) => {
            let id = parse_id(&args.id)?;
            app.unfix(id, args.path, args.date)?;
            let status = app.wait_for_unfix(id, sink_for(output_mode).as_ref());
            let message = format!("Removed {} files", status.files_removed);
            finish(
                output_mode,
                &status,
                status.success,
                status.error.as_deref(),
                message,
            )
        }
        FixCommand::List => {
            let result = app.list_installed_fixes()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
                OutputMode::Human => {
                    if result.fixes.is_empty() {
                        println!("No fixes recorded");
                    }
                    for fix in &result.fixes {
                        println!(
                            "{:>10}  {}  {}  {}  {} files",
                            fix.appid,
                            fix.game_name,
                            fix.record.fix_type,
                            fix.record.date,
                            fix.files_count
                        );
                    }
                    Ok(())
                }
            }
        }
    }
}
