use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use zettabee::alert::{Health, Nsca};
use zettabee::config::{Settings, DEFAULT_CONFIG_PATH};
use zettabee::logging;
use zettabee::relay::MonitorOutcome;
use zettabee::report::{fingerprint_line, StatusReport};
use zettabee::{Action, Config, Dataset, Error, Outcome, Pair, PairSet, SystemShell};

const ME: &str = "zettabee";

#[derive(Parser, Debug)]
#[command(name = "zettabee", version, about = "Incremental ZFS snapshot replication")]
#[command(after_help = "<destination> is [<host>:]<filesystem>; a bare name matches the last path component")]
struct Cli {
    /// Debug output to the pair log file
    #[arg(short, long)]
    debug: bool,

    /// Log to the console as well
    #[arg(short, long)]
    verbose: bool,

    /// Nagios host to send NSCA results to
    #[arg(short = 'N', long = "nagios", value_name = "NAGIOSHOST")]
    nagios: Option<String>,

    /// Main configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Include last snapshot and port in status lines
    #[arg(short = 'F', long = "full-status")]
    full_status: bool,

    /// setup | status | runstatus | initialize | update | unlock | fingerprint | logfile
    action: Action,

    destination: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: error: {:#}", ME, e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = Config::load(&config_path, cli.config.is_some())?;
    config.settings = Settings {
        verbose: cli.verbose,
        debug: cli.debug,
        full_status: cli.full_status,
    };
    let config = Arc::new(config);

    if cli.action == Action::Setup {
        config.setup().context("setup failed")?;
        return Ok(ExitCode::SUCCESS);
    }

    let set = PairSet::load(config.clone(), Arc::new(SystemShell))?;

    let pairs: Vec<&Pair> = match &cli.destination {
        Some(destination) => vec![set.select(destination)?],
        None if matches!(cli.action, Action::Status | Action::Fingerprint) => set.iter().collect(),
        None => bail!("only status, fingerprint actions can be run against all destinations"),
    };

    let logfile = match pairs.as_slice() {
        [pair] if config.log_dir.is_dir() => Some(pair.logfile()),
        _ => None,
    };
    let _log = logging::init(&config.settings, logfile)?;

    let nsca = cli.nagios.as_deref().map(|host| Nsca::new(&config.nsca, host));
    let mut failed = false;

    for pair in pairs {
        let action = cli.action.as_str().to_uppercase();
        let mut message = format!(
            "{} {}: {}: ",
            action,
            pair.destination(),
            chrono::Local::now().format("%a %b %e %T %Y")
        );
        let mut health = Health::Ok;

        let mut stdout = tokio::io::stdout();
        match pair.execute(cli.action, &mut stdout).await {
            Ok(outcome) => {
                let throughput = render(&config.settings, pair, outcome);
                message.push_str(&format!("{}: OK", throughput.unwrap_or_default()));
            }
            Err(e) if e.is_informational() => {
                let report = pair.status_report().await;
                let verdict = while_running(
                    &action,
                    pair.destination(),
                    report,
                    &config.settings,
                    nsca.is_some(),
                );
                health = verdict.health;
                message.push_str(&verdict.text);
                failed |= verdict.failed;
            }
            Err(e) => {
                health = failure(&action, pair.destination(), &e, &mut message);
                failed = true;
            }
        }

        if let Some(nsca) = &nsca {
            let host = pair.destination().host();
            if let Err(e) = nsca
                .send(host, &pair.service_description(), health, &message)
                .await
            {
                eprintln!("{}: error: send_nsca failed: {}", ME, e);
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Health and NSCA text for one pair.
#[derive(Debug)]
struct Verdict {
    health: Health,
    text: String,
    failed: bool,
}

/// A transfer already holds the pair: show its status instead of failing,
/// unless the status itself cannot be read.
fn while_running(
    action: &str,
    destination: &Dataset,
    report: zettabee::Result<StatusReport>,
    settings: &Settings,
    nagios: bool,
) -> Verdict {
    match report {
        Ok(report) if nagios => {
            let (health, text) = report.health();
            Verdict {
                health,
                text,
                failed: false,
            }
        }
        Ok(report) => {
            println!("{}", report.render(settings.full_status));
            Verdict {
                health: Health::Ok,
                text: String::new(),
                failed: false,
            }
        }
        Err(e) => {
            let mut text = String::new();
            let health = failure(action, destination, &e, &mut text);
            Verdict {
                health,
                text,
                failed: true,
            }
        }
    }
}

fn failure(action: &str, destination: &Dataset, e: &Error, message: &mut String) -> Health {
    eprintln!("{}: error: {} {}: {}", ME, action, destination, e);
    message.push_str(&e.to_string());
    Health::Unknown
}

/// Print an action's result. Returns the transfer throughput, if any.
fn render(settings: &Settings, pair: &Pair, outcome: Outcome) -> Option<String> {
    match outcome {
        Outcome::Status(report) => println!("{}", report.render(settings.full_status)),
        Outcome::Fingerprint(fingerprint) => println!(
            "{}",
            fingerprint_line(pair.source(), pair.destination(), &fingerprint)
        ),
        Outcome::Logfile(path) => println!("{}", path.display()),
        Outcome::Runstatus(MonitorOutcome::NotRunning) => {
            eprintln!("{} currently not running", pair.destination())
        }
        Outcome::Transfer(report) => return report.throughput,
        Outcome::Runstatus(_) | Outcome::Setup | Outcome::Unlocked => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_status_while_running_fails_pair() {
        let destination = Dataset::new("backup/home", "dst01");
        let report = Err(Error::Storage(
            "cannot open 'backup/home': permission denied".into(),
        ));
        let verdict = while_running("UPDATE", &destination, report, &Settings::default(), true);
        assert_eq!(verdict.health, Health::Unknown);
        assert!(verdict.failed);
        assert!(verdict.text.contains("permission denied"), "{}", verdict.text);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["zettabee", "-v", "-F", "status", "home"]).unwrap();
        assert!(cli.verbose);
        assert!(cli.full_status);
        assert_eq!(cli.action, Action::Status);
        assert_eq!(cli.destination.as_deref(), Some("home"));
    }
}
