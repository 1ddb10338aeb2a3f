use adalog_lib::{
    inspect::{self, DatasetSummary, InspectFilter},
    tags::{known_tags, parse_tag_input},
    AdalogConfig, PanelRegistry, SessionController, SessionRequest,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{after, never, select, unbounded, Receiver};
use env_logger::Env;
use log::{info, warn};
use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

#[derive(Parser)]
#[command(
    name = "adalog",
    version,
    about = "Synchronized multimodal session recording"
)]
struct Cli {
    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the panels that can be attached
    Panels,
    /// Record one session, reading +tag / -tag / tags / status / stop from stdin
    Record {
        #[arg(long)]
        user: String,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        session_type: Option<String>,
        /// Panel to attach, by catalog name (repeatable)
        #[arg(long = "panel")]
        panels: Vec<String>,
        /// Tag active from the start (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Stop on its own after this many seconds
        #[arg(long)]
        duration_s: Option<f64>,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print tags used in earlier sessions of a user
    Tags {
        #[arg(long)]
        user: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Summarize the recorded sessions of a user
    Inspect {
        #[arg(long)]
        user: String,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long = "modality")]
        modalities: Vec<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level)).init();

    match cli.command {
        Commands::Panels => cmd_panels(),
        Commands::Record {
            user,
            mode,
            session_type,
            panels,
            tags,
            duration_s,
            root,
            config,
        } => {
            let mut request = SessionRequest::for_user(user);
            request.mode = mode;
            request.session_type = session_type;
            let mut config = load_config(config.as_deref(), root)?;
            config.initial_tags.extend(tags);
            let limit = duration_s.filter(|s| *s > 0.0).map(Duration::from_secs_f64);
            cmd_record(&config, &request, &panels, limit)
        }
        Commands::Tags { user, root, config } => {
            let config = load_config(config.as_deref(), root)?;
            for tag in known_tags(&config.sessions_root, &user)? {
                println!("{}", tag);
            }
            Ok(())
        }
        Commands::Inspect {
            user,
            root,
            config,
            tags,
            modalities,
            json,
        } => {
            let config = load_config(config.as_deref(), root)?;
            let filter = InspectFilter {
                tags: tags.into_iter().collect(),
                modalities: modalities.into_iter().collect(),
            };
            let summary = inspect::summarize(&config.sessions_root, &user, &filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<AdalogConfig> {
    let mut config = match path {
        Some(path) => AdalogConfig::load(path)?,
        None => AdalogConfig::default(),
    };
    if let Some(root) = root {
        config.sessions_root = root;
    }
    Ok(config)
}

fn cmd_panels() -> Result<()> {
    let registry = PanelRegistry::builtin();
    for (name, descriptor) in registry.available() {
        println!("{}\t{}", name, descriptor.capability);
    }
    for (name, reason) in registry.skipped() {
        println!("{}\tskipped: {}", name, reason);
    }
    Ok(())
}

enum Command {
    Add(String),
    Remove(String),
    ShowTags,
    Status,
    Stop,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if let Some(tag) = line.strip_prefix('+') {
        return parse_tag_input(tag).map(Command::Add);
    }
    if let Some(tag) = line.strip_prefix('-') {
        return parse_tag_input(tag).map(Command::Remove);
    }
    match line {
        "tags" => Some(Command::ShowTags),
        "status" => Some(Command::Status),
        "stop" => Some(Command::Stop),
        _ => None,
    }
}

/// Forward stdin lines until EOF; the channel disconnects afterwards.
fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn cmd_record(
    config: &AdalogConfig,
    request: &SessionRequest,
    panels: &[String],
    limit: Option<Duration>,
) -> Result<()> {
    let registry = PanelRegistry::builtin();
    let settings = config.panel_settings();
    let mut controller = SessionController::from_config(config);
    for name in panels {
        controller
            .attach(&registry, name, &settings)
            .with_context(|| format!("attaching panel {}", name))?;
    }

    let report = controller.start(request)?;
    for (title, outcome) in &report.outcomes {
        info!("{}: {:?}", title, outcome);
    }
    let dir = report
        .session_dir
        .clone()
        .context("session started without a directory")?;

    let lines = stdin_lines();
    let deadline = limit.map(after).unwrap_or_else(never);
    loop {
        select! {
            recv(lines) -> line => {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(Command::Add(tag)) => {
                        controller.add_tag(&tag)?;
                    }
                    Some(Command::Remove(tag)) => {
                        controller.remove_tag(&tag)?;
                    }
                    Some(Command::ShowTags) => println!("{}", controller.tags().tags().join(", ")),
                    Some(Command::Status) => {
                        println!("elapsed {}", controller.elapsed_label());
                        for panel in controller.panels() {
                            match panel.readout {
                                Some(readout) => {
                                    println!("{}\t{}\t{}", panel.title, panel.status, readout)
                                }
                                None => println!("{}\t{}", panel.title, panel.status),
                            }
                        }
                    }
                    Some(Command::Stop) => break,
                    None if line.trim().is_empty() => {}
                    None => warn!("unknown command '{}'", line.trim()),
                }
            }
            recv(deadline) -> _ => {
                info!("duration reached");
                break;
            }
        }
    }

    let report = controller.stop()?;
    for (title, outcome) in report.failures() {
        warn!("{} did not stop cleanly: {:?}", title, outcome);
    }
    println!("{}", dir.display());
    Ok(())
}

fn print_summary(summary: &DatasetSummary) {
    println!("sessions: {}", summary.sessions);
    for (modality, stats) in &summary.modalities {
        println!(
            "{}\tsessions {}\tduration {}\twords {}\tsnapshots {}",
            modality,
            stats.sessions,
            inspect::human_duration(stats.duration_s),
            stats.words,
            stats.snapshots
        );
    }
    for overlap in &summary.overlaps {
        println!(
            "{} & {}\t{}",
            overlap.a,
            overlap.b,
            inspect::human_duration(overlap.seconds)
        );
    }
}
