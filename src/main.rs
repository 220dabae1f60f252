mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use cli::{Cli, Command};
use rundrawer::config::ProjectConfig;
use rundrawer::drawer::DrawerEvent;
use rundrawer::drawer::runtime::{DrawerRuntime, RunOutcome};
use rundrawer::execution::{ExecutionId, ExecutionStatus};
use rundrawer::foreground;
use rundrawer::journal::Journal;
use rundrawer::source::LogSource;
use rundrawer::source::http::{HttpLogSource, HttpLogStream};
use rundrawer::tabs::{self, TabId, TabOwnership};
use rundrawer::view::TerminalView;

fn parse_tab(raw: &str) -> Result<TabId> {
    raw.parse::<TabId>().map_err(anyhow::Error::msg)
}

/// `:artifacts` and friends typed on stdin while watching.
fn parse_tab_command(line: &str) -> Option<TabId> {
    line.trim().strip_prefix(':')?.parse().ok()
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .rundrawer/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("API\n");
    push_kv(&mut output, "base_url", &config.api.base_url);
    let token_state = if config.token().is_some() {
        "set"
    } else {
        "unset"
    };
    push_kv(
        &mut output,
        "token_env",
        format!("{} ({token_state})", config.api.token_env),
    );
    push_kv(&mut output, "timeout", format!("{}s", config.api.timeout_secs));
    output.push('\n');

    output.push_str("Stream\n");
    push_kv(
        &mut output,
        "reconnect_attempts",
        config.stream.reconnect_attempts,
    );
    push_kv(
        &mut output,
        "reconnect_backoff",
        format!("{}ms", config.stream.reconnect_backoff_millis),
    );
    output.push('\n');

    output.push_str("Drawer\n");
    push_kv(&mut output, "default_tab", config.drawer.default_tab);
    push_kv(&mut output, "hydrate", hydrate_label(config));
    push_kv(
        &mut output,
        "artifact_poll",
        format!("{}s", config.drawer.artifact_poll_secs),
    );
    push_kv(
        &mut output,
        "status_poll",
        format!("{}s", config.drawer.status_poll_secs),
    );
    output.push('\n');

    output.push_str("Journal\n");
    push_kv(&mut output, "enabled", config.journal.enabled);
    push_kv(
        &mut output,
        "dir",
        config.journal_dir(config_path).display(),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn hydrate_label(config: &ProjectConfig) -> &'static str {
    match config.drawer.hydrate {
        rundrawer::drawer::HydratePolicy::Always => "always",
        rundrawer::drawer::HydratePolicy::LiveOnly => "live-only",
    }
}

fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "api": {
            "base_url": &config.api.base_url,
            "token_env": &config.api.token_env,
            "token_set": config.token().is_some(),
            "timeout_secs": config.api.timeout_secs
        },
        "stream": &config.stream,
        "drawer": &config.drawer,
        "journal": {
            "enabled": config.journal.enabled,
            "dir": config.journal_dir(config_path)
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Forward tab commands from stdin until EOF.
fn spawn_tab_reader(tx: Sender<DrawerEvent>) {
    let spawned = std::thread::Builder::new()
        .name("drawer-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match parse_tab_command(&line) {
                    Some(tab) => {
                        if tx.send(DrawerEvent::SelectTab(tab)).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("[rundrawer] unknown command: {}", line.trim()),
                }
            }
            debug!("stdin closed");
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start stdin reader; tab commands disabled");
    }
}

fn watch(
    config: &ProjectConfig,
    config_path: Option<&Path>,
    execution_id: String,
    tab: Option<String>,
    plain: bool,
    journal: bool,
) -> Result<()> {
    let initial_tab = tab.as_deref().map(parse_tab).transpose()?;
    let settings = config.http_settings();
    if settings.token.is_none() {
        warn!(env = %config.api.token_env, "no API token set; requests are unauthenticated");
    }

    let source = Arc::new(HttpLogSource::new(&settings));
    let stream = Arc::new(HttpLogStream::new(&settings));
    let id = ExecutionId::new(execution_id);
    let record = source
        .fetch_execution(&id)
        .with_context(|| format!("failed to load execution {id}"))?;
    info!(execution_id = %id, status = %record.status, "opening drawer");

    let view = TerminalView::new(io::stdout(), io::stderr(), plain);
    let mut runtime = DrawerRuntime::new(config.drawer_settings(), source, stream, Box::new(view));
    if journal || config.journal.enabled {
        let journal = Journal::for_execution(&config.journal_dir(config_path), &id)?;
        info!(path = %journal.path().display(), "journaling drawer transitions");
        runtime = runtime.with_journal(journal);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .ok();

    spawn_tab_reader(runtime.sender());
    let watcher = match foreground::spawn_resume_watcher(runtime.sender(), stop.clone()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "resume detection unavailable");
            None
        }
    };

    runtime.open(record);
    if let Some(tab) = initial_tab {
        runtime.set_active_tab(tab);
    }

    let outcome = runtime.run(&stop, true);
    runtime.close();
    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = watcher {
        let _ = handle.join();
    }

    match outcome {
        RunOutcome::AuthExpired => anyhow::bail!(
            "the API rejected the credentials in ${}; refresh the token and retry",
            config.api.token_env
        ),
        RunOutcome::Settled => {
            info!(execution_id = %id, "execution finished");
            Ok(())
        }
        RunOutcome::Stopped | RunOutcome::Shutdown => Ok(()),
    }
}

fn evaluate_tabs(
    status: &str,
    artifacts: bool,
    analysis: bool,
    desired: Option<&str>,
    owner: Option<&str>,
    current: Option<&str>,
    default_tab: &str,
) -> Result<String> {
    let status = ExecutionStatus::parse(status);
    let default_tab = parse_tab(default_tab)?;
    let current = current.map(ExecutionId::from);
    let ownership = match desired {
        Some(desired) => Some(TabOwnership::new(
            owner.map(ExecutionId::from).or_else(|| current.clone()),
            parse_tab(desired)?,
        )),
        None => None,
    };

    let visible = tabs::visible_tabs(&status, artifacts, analysis);
    let effective = tabs::effective_tab(
        ownership.as_ref(),
        current.as_ref(),
        default_tab,
        &visible,
    );

    let mut output = String::new();
    push_kv(&mut output, "status", &status);
    push_kv(&mut output, "visible", visible);
    push_kv(&mut output, "effective", effective);
    Ok(output)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_quiet_command = matches!(&cli.command, Command::Config { .. } | Command::Tabs { .. });

    let filter = match cli.verbose {
        0 if is_quiet_command => "rundrawer=warn",
        0 => "rundrawer=info",
        1 => "rundrawer=debug",
        _ => "rundrawer=trace",
    };
    // stdout carries the log itself.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !is_quiet_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .rundrawer/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Watch {
            execution_id,
            tab,
            plain,
            journal,
        } => watch(
            &config,
            config_path.as_deref(),
            execution_id,
            tab,
            plain,
            journal,
        ),
        Command::Tabs {
            status,
            artifacts,
            analysis,
            desired,
            owner,
            current,
            default_tab,
        } => {
            let output = evaluate_tabs(
                &status,
                artifacts,
                analysis,
                desired.as_deref(),
                owner.as_deref(),
                current.as_deref(),
                &default_tab,
            )?;
            print!("{output}");
            Ok(())
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<'a>(output: &'a str, key: &str) -> &'a str {
        output
            .lines()
            .find_map(|line| line.trim_start().strip_prefix(key))
            .map(str::trim)
            .unwrap()
    }

    #[test]
    fn tab_commands_parse_from_stdin_lines() {
        assert_eq!(parse_tab_command(":terminal"), Some(TabId::Terminal));
        assert_eq!(parse_tab_command("  :artifacts\n"), Some(TabId::Artifacts));
        assert_eq!(parse_tab_command(":ai-analysis"), Some(TabId::AiAnalysis));
        assert_eq!(parse_tab_command("artifacts"), None);
        assert_eq!(parse_tab_command(":coverage"), None);
    }

    #[test]
    fn render_config_human_groups_sections() {
        let config = ProjectConfig::default();
        let rendered = render_config_human(&config, None);

        assert!(rendered.contains("API"));
        assert!(rendered.contains("Stream"));
        assert!(rendered.contains("Drawer"));
        assert!(rendered.contains("Journal"));
        assert_eq!(field(&rendered, "hydrate"), "always");
        assert!(rendered.contains("(defaults, no .rundrawer/config.toml found)"));
    }

    #[test]
    fn render_config_json_is_valid_and_contains_expected_fields() {
        let config = ProjectConfig::default();
        let json = render_config_json(&config, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["api"]["base_url"], "http://localhost:8080/api");
        assert_eq!(value["stream"]["reconnect_attempts"], 3);
        assert_eq!(value["drawer"]["default_tab"], "terminal");
        assert_eq!(value["drawer"]["hydrate"], "always");
        assert_eq!(value["journal"]["enabled"], false);
    }

    #[test]
    fn evaluate_tabs_hides_analysis_for_errored_runs() {
        let output = evaluate_tabs(
            "ERROR",
            true,
            true,
            Some("ai-analysis"),
            None,
            Some("e1"),
            "terminal",
        )
        .unwrap();
        assert_eq!(field(&output, "visible"), "terminal, artifacts");
        assert_eq!(field(&output, "effective"), "terminal");
    }

    #[test]
    fn evaluate_tabs_ignores_selection_owned_by_another_execution() {
        let output = evaluate_tabs(
            "FAILED",
            true,
            true,
            Some("artifacts"),
            Some("e1"),
            Some("e2"),
            "ai-analysis",
        )
        .unwrap();
        assert_eq!(field(&output, "effective"), "ai-analysis");
    }

    #[test]
    fn evaluate_tabs_rejects_unknown_tab() {
        let result = evaluate_tabs(
            "RUNNING",
            false,
            false,
            Some("coverage"),
            None,
            None,
            "terminal",
        );
        assert!(result.is_err());
    }
}
