// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tun Proxy Contributors

// Tun Proxy - CLI Client
// Command-line interface for the tunnel daemon and its preferences

mod config;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::Password;

use tun_proxy_common::{
    is_valid_ipv4_endpoint, parse_host_port, DateTime, DaemonClient, EventListener, FilterMode, IpPrefix, LogLevel, Preferences,
    RemoteOutcome, StartOutcome, StatusEvent, StopOutcome, TomlPreferenceStore,
    TunnelStatusResponse, Utc,
};

#[derive(Parser)]
#[command(name = "tun-proxy")]
#[command(about = "Route system traffic through a SOCKS proxy", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up with the stored settings
    Start,

    /// Bring the tunnel down
    Stop,

    /// Show tunnel status
    Status {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Follow status changes as they happen
    Watch,

    /// Start or stop the tunnel on behalf of another program
    Remote {
        #[command(subcommand)]
        action: RemoteCommands,
    },

    /// Upstream proxy settings
    Proxy {
        #[command(subcommand)]
        action: ProxyCommands,
    },

    /// Per-application filter
    Filter {
        #[command(subcommand)]
        action: FilterCommands,
    },

    /// Set the forwarding engine log level
    LogLevel {
        #[arg(value_enum)]
        level: LevelArg,
    },

    /// Show or change the tunnel interface addresses
    Addresses {
        /// IPv4 address with prefix, e.g. 26.26.26.1/30
        #[arg(long)]
        ipv4: Option<String>,

        /// IPv6 address with prefix, e.g. da26:2626::1/126
        #[arg(long)]
        ipv6: Option<String>,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Route only the given applications through the proxy
    Allow {
        /// Proxy endpoint, IPv4 literal and port
        endpoint: String,
        apps: Vec<String>,
    },
    /// Route everything except the given applications through the proxy
    Deny {
        /// Proxy endpoint, IPv4 literal and port
        endpoint: String,
        apps: Vec<String>,
    },
    /// Stop a remotely started tunnel
    Stop,
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// Store the proxy endpoint
    Set {
        /// host:port
        endpoint: String,

        /// Username for proxy authentication (password is prompted)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Show the stored proxy endpoint
    Show,
}

#[derive(Subcommand)]
enum FilterCommands {
    /// Select which list applies
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Add applications to the active list
    Add {
        #[arg(required = true)]
        apps: Vec<String>,
    },
    /// Remove applications from the active list
    Remove {
        #[arg(required = true)]
        apps: Vec<String>,
    },
    /// Show both lists
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Allow,
    Deny,
}

impl From<ModeArg> for FilterMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Allow => FilterMode::Allow,
            ModeArg::Deny => FilterMode::Deny,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LevelArg {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LevelArg> for LogLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Verbose => LogLevel::VERBOSE,
            LevelArg::Debug => LogLevel::DEBUG,
            LevelArg::Info => LogLevel::INFO,
            LevelArg::Warn => LogLevel::WARN,
            LevelArg::Error => LogLevel::ERROR,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let cli_config = config::CliConfig::load()?;

    match cli.command {
        Commands::Start => start_tunnel(&cli_config).await?,
        Commands::Stop => stop_tunnel(&cli_config).await?,
        Commands::Status { json } => show_status(&cli_config, json).await?,
        Commands::Watch => watch_events(&cli_config).await?,
        Commands::Remote { action } => remote(&cli_config, action).await?,
        Commands::Proxy { action } => proxy(&open_preferences(&cli_config)?, action)?,
        Commands::Filter { action } => filter(&open_preferences(&cli_config)?, action)?,
        Commands::LogLevel { level } => {
            let level = LogLevel::from(level);
            open_preferences(&cli_config)?.set_log_level(level)?;
            println!(
                "{}",
                format!("✓ Engine log level set to {}", level.engine_name()).green()
            );
            print_restart_hint();
        }
        Commands::Addresses { ipv4, ipv6 } => {
            addresses(&open_preferences(&cli_config)?, ipv4, ipv6)?;
        }
    }

    Ok(())
}

fn daemon_client(cli_config: &config::CliConfig) -> Result<DaemonClient> {
    DaemonClient::new(cli_config.daemon_config.clone())
}

fn open_preferences(cli_config: &config::CliConfig) -> Result<Preferences> {
    let path = cli_config.preferences_path()?;
    Ok(Preferences::new(Arc::new(TomlPreferenceStore::new(path))))
}

fn print_restart_hint() {
    println!(
        "{}",
        "Takes effect the next time the tunnel starts".dimmed()
    );
}

async fn start_tunnel(cli_config: &config::CliConfig) -> Result<()> {
    println!("{}", "Starting tunnel...".dimmed());

    match daemon_client(cli_config)?.start().await? {
        StartOutcome::Started => println!("{}", "✓ Tunnel started".green().bold()),
        StartOutcome::Idle => {
            println!("{}", "✓ Tunnel interface is up".green().bold());
            println!(
                "{}",
                "No proxy configured, traffic is not forwarded. Set one with: tun-proxy proxy set <host:port>"
                    .yellow()
            );
        }
        StartOutcome::AlreadyRunning => println!("{}", "Tunnel is already running".yellow()),
        StartOutcome::Ignored => println!(
            "{}",
            "Another start or stop is in progress, try again shortly".yellow()
        ),
    }
    Ok(())
}

async fn stop_tunnel(cli_config: &config::CliConfig) -> Result<()> {
    println!("{}", "Stopping tunnel...".dimmed());

    match daemon_client(cli_config)?.stop().await? {
        StopOutcome::Stopped => println!("{}", "✓ Tunnel stopped".green().bold()),
        StopOutcome::AlreadyStopped => println!("{}", "Tunnel is not running".yellow()),
        StopOutcome::Ignored => println!(
            "{}",
            "Another start or stop is in progress, try again shortly".yellow()
        ),
    }
    Ok(())
}

async fn show_status(cli_config: &config::CliConfig, json: bool) -> Result<()> {
    let status = daemon_client(cli_config)?.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status_table(&status);
    }
    Ok(())
}

fn print_status_table(status: &TunnelStatusResponse) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("State")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Interface")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Forwarding")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("Started by")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
    ]);

    let state_color = if status.running {
        Color::Green
    } else if status.state.is_in_progress() || status.busy {
        Color::Yellow
    } else {
        Color::DarkGrey
    };
    let forwarding = if status.worker_active {
        "active"
    } else if status.running {
        "idle"
    } else {
        "-"
    };
    let origin = if !status.running {
        "-"
    } else if status.started_remotely {
        "remote"
    } else {
        "local"
    };

    table.add_row(vec![
        Cell::new(status.state.to_string()).fg(state_color),
        Cell::new(status.interface.as_deref().unwrap_or("-")),
        Cell::new(forwarding),
        Cell::new(origin).fg(Color::DarkGrey),
    ]);

    println!();
    println!("{}", table);
    println!();
}

async fn watch_events(cli_config: &config::CliConfig) -> Result<()> {
    let mut events = EventListener::new(cli_config.daemon_config.clone()).listen();

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                print_event(&event);
            }
        }
    }

    Ok(())
}

fn print_event(event: &StatusEvent) {
    match event {
        StatusEvent::StateChanged { state, timestamp } => {
            println!("{} {}", stamp(timestamp), format!("State: {state}").cyan());
        }
        StatusEvent::Running { running, timestamp } => {
            let text = if *running {
                "Tunnel up".green()
            } else {
                "Tunnel down".yellow()
            };
            println!("{} {}", stamp(timestamp), text);
        }
        StatusEvent::Busy { busy, timestamp } => {
            let text = if *busy { "Working..." } else { "Idle" };
            println!("{} {}", stamp(timestamp), text.dimmed());
        }
        StatusEvent::StartedRemotely {
            started_remotely: true,
            timestamp,
        } => {
            println!("{} {}", stamp(timestamp), "Started by a remote request".magenta());
        }
        StatusEvent::StartedRemotely { .. } => {}
        StatusEvent::Error { error, timestamp } => {
            eprintln!("{} {}", stamp(timestamp), format!("Error: {error}").red());
        }
        StatusEvent::Heartbeat { .. } => {
            // Ignore heartbeats in watch mode
        }
    }
}

fn stamp(timestamp: &DateTime<Utc>) -> colored::ColoredString {
    timestamp.format("%H:%M:%S").to_string().dimmed()
}

async fn remote(cli_config: &config::CliConfig, action: RemoteCommands) -> Result<()> {
    let client = daemon_client(cli_config)?;

    let outcome = match action {
        RemoteCommands::Allow { endpoint, apps } => {
            let (host, port) = parse_host_port(&endpoint)?;
            client.remote_start(FilterMode::Allow, &host, port, apps).await?
        }
        RemoteCommands::Deny { endpoint, apps } => {
            let (host, port) = parse_host_port(&endpoint)?;
            client.remote_start(FilterMode::Deny, &host, port, apps).await?
        }
        RemoteCommands::Stop => client.remote_stop().await?,
    };

    match outcome {
        RemoteOutcome::Success => {
            println!("{}", "✓ Done".green().bold());
            Ok(())
        }
        RemoteOutcome::PermissionDenied => {
            anyhow::bail!(
                "The daemon lacks permission to create the tunnel (needs root or CAP_NET_ADMIN). \
                 Settings were stored and apply on the next start."
            )
        }
        RemoteOutcome::Failed { error } => anyhow::bail!("Remote request failed: {}", error),
    }
}

fn proxy(preferences: &Preferences, action: ProxyCommands) -> Result<()> {
    match action {
        ProxyCommands::Set { endpoint, user } => {
            if !is_valid_ipv4_endpoint(&endpoint) {
                anyhow::bail!("'{}' is not an IPv4 address with port, e.g. 10.0.0.5:1080", endpoint);
            }
            let (host, port) = parse_host_port(&endpoint)?;
            preferences.save_host_port(&host, port)?;

            match user {
                Some(user) => {
                    let password = Password::new()
                        .with_prompt(format!("Password for {}", user))
                        .allow_empty_password(true)
                        .interact()
                        .context("Failed to read password input")?;
                    preferences.save_credentials(&user, &password)?;
                }
                None => preferences.save_credentials("", "")?,
            }

            println!(
                "{}",
                format!("✓ Proxy set to {}", tun_proxy_common::format_host_port(&host, port))
                    .green()
            );
            print_restart_hint();
        }
        ProxyCommands::Show => match preferences.proxy_endpoint()? {
            Some(proxy) => {
                println!("{} {}", "Proxy:".bold(), proxy.to_string().cyan());
                let (user, _) = proxy.user_pass();
                if !user.is_empty() {
                    println!("{} {}", "User:".bold(), user);
                }
            }
            None => {
                println!("{}", "No proxy configured.".yellow());
                println!("Set one with: {}", "tun-proxy proxy set <host:port>".cyan());
            }
        },
    }
    Ok(())
}

fn filter(preferences: &Preferences, action: FilterCommands) -> Result<()> {
    match action {
        FilterCommands::Mode { mode } => {
            let mode = FilterMode::from(mode);
            preferences.set_filter_mode(mode)?;
            println!("{}", format!("✓ Filter mode set to {}", mode).green());
            print_restart_hint();
        }
        FilterCommands::Add { apps } => {
            let mode = preferences.filter_mode()?;
            let updated = edit_list(preferences.filter_apps(mode)?, &apps, true);
            preferences.store_filter_apps(mode, &updated)?;
            println!("{}", format!("✓ {} list: {}", mode, join(&updated)).green());
            print_restart_hint();
        }
        FilterCommands::Remove { apps } => {
            let mode = preferences.filter_mode()?;
            let updated = edit_list(preferences.filter_apps(mode)?, &apps, false);
            preferences.store_filter_apps(mode, &updated)?;
            println!("{}", format!("✓ {} list: {}", mode, join(&updated)).green());
            print_restart_hint();
        }
        FilterCommands::List => {
            let active = preferences.filter_mode()?;
            for mode in [FilterMode::Allow, FilterMode::Deny] {
                let marker = if mode == active { "*" } else { " " };
                let apps = preferences.filter_apps(mode)?;
                println!("{} {:<6} {}", marker.green(), mode.to_string().bold(), join(&apps));
            }
        }
    }
    Ok(())
}

fn edit_list(mut current: BTreeSet<String>, apps: &[String], add: bool) -> BTreeSet<String> {
    for app in apps.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
        if add {
            current.insert(app.to_string());
        } else {
            current.remove(app);
        }
    }
    current
}

fn join(apps: &BTreeSet<String>) -> String {
    if apps.is_empty() {
        "-".to_string()
    } else {
        apps.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

fn addresses(preferences: &Preferences, ipv4: Option<String>, ipv6: Option<String>) -> Result<()> {
    if ipv4.is_none() && ipv6.is_none() {
        println!("{} {}", "IPv4:".bold(), preferences.local_ipv4()?);
        println!("{} {}", "IPv6:".bold(), preferences.local_ipv6()?);
        return Ok(());
    }

    let ipv4 = ipv4
        .map(|s| s.parse::<IpPrefix>())
        .transpose()
        .context("Invalid IPv4 address")?;
    let ipv6 = ipv6
        .map(|s| s.parse::<IpPrefix>())
        .transpose()
        .context("Invalid IPv6 address")?;
    preferences.set_local_addresses(ipv4, ipv6)?;

    println!("{}", "✓ Interface addresses updated".green());
    print_restart_hint();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_remote_allow() {
        let cli = Cli::try_parse_from(["tun-proxy", "remote", "allow", "10.0.0.1:1080", "firefox", "curl"])
            .unwrap();
        match cli.command {
            Commands::Remote {
                action: RemoteCommands::Allow { endpoint, apps },
            } => {
                assert_eq!(endpoint, "10.0.0.1:1080");
                assert_eq!(apps, vec!["firefox", "curl"]);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_filter_add_requires_apps() {
        assert!(Cli::try_parse_from(["tun-proxy", "filter", "add"]).is_err());
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::from(LevelArg::Warn), LogLevel::WARN);
        assert_eq!(LogLevel::from(LevelArg::Verbose), LogLevel::VERBOSE);
    }

    #[test]
    fn test_edit_list() {
        let added = edit_list(set(&["a"]), &["b".to_string(), " ".to_string()], true);
        assert_eq!(added, set(&["a", "b"]));

        let removed = edit_list(added, &["a".to_string(), "zzz".to_string()], false);
        assert_eq!(removed, set(&["b"]));
    }

    #[test]
    fn test_filter_commands_edit_active_list() {
        let prefs = Preferences::in_memory();
        filter(&prefs, FilterCommands::Mode { mode: ModeArg::Allow }).unwrap();
        filter(
            &prefs,
            FilterCommands::Add {
                apps: vec!["firefox".to_string()],
            },
        )
        .unwrap();

        assert_eq!(prefs.filter_mode().unwrap(), FilterMode::Allow);
        assert_eq!(prefs.filter_apps(FilterMode::Allow).unwrap(), set(&["firefox"]));
        assert!(prefs.filter_apps(FilterMode::Deny).unwrap().is_empty());
    }

    #[test]
    fn test_proxy_set_requires_ipv4_endpoint() {
        let prefs = Preferences::in_memory();
        let result = proxy(
            &prefs,
            ProxyCommands::Set {
                endpoint: "proxy.example.com:1080".to_string(),
                user: None,
            },
        );
        assert!(result.is_err());
        assert!(prefs.proxy_endpoint().unwrap().is_none());

        proxy(
            &prefs,
            ProxyCommands::Set {
                endpoint: "10.0.0.5:1080".to_string(),
                user: None,
            },
        )
        .unwrap();
        let stored = prefs.proxy_endpoint().unwrap().unwrap();
        assert_eq!((stored.host.as_str(), stored.port), ("10.0.0.5", 1080));
    }

    #[test]
    fn test_addresses_rejects_garbage() {
        let prefs = Preferences::in_memory();
        assert!(addresses(&prefs, Some("not-an-ip".to_string()), None).is_err());
        addresses(&prefs, Some("10.1.0.1/24".to_string()), None).unwrap();
        assert_eq!(prefs.local_ipv4().unwrap().to_string(), "10.1.0.1/24");
    }
}
