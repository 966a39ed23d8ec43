//! `al`: drive the asset ledger from the command line against a `SQLite`
//! ledger file.
//!
//! Hosts can embed the same surface through [`run_cli`] for parsed CLI
//! execution or [`run_command`] against an already open [`SqliteLedger`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use asset_ledger_core::{invoke_atomic, Function, LedgerConfig, LedgerError};
use asset_ledger_store_sqlite::{IndexCheck, SqliteLedger};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "al")]
#[command(about = "Asset ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./asset_ledger.sqlite3")]
    db: PathBuf,

    /// JSON ledger configuration; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one ledger function inside a single transaction.
    Invoke(InvokeArgs),
    /// List the functions `invoke` accepts.
    Functions {
        #[arg(long)]
        json: bool,
    },
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },
}

#[derive(Debug, Args)]
pub struct InvokeArgs {
    /// Authenticated identity the call is made on behalf of.
    #[arg(long)]
    caller: String,
    function: String,
    #[arg(allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum IndexCommand {
    /// Compare stored index entries with those implied by primary records.
    Check {
        #[arg(long)]
        json: bool,
    },
}

/// Failure body written to stderr.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<LedgerError>() {
            Some(ledger_err) => Self {
                code: ledger_err.code().to_string(),
                message: ledger_err.to_string(),
            },
            None => Self {
                code: "cli.error".to_string(),
                message: format!("{err:#}"),
            },
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":"cli.error","message":{:?}}}"#, self.message)
        })
    }
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when configuration loading, ledger open/migrate, or the
/// requested command fails. Ledger rejections are returned as
/// [`LedgerError`] so callers can recover the stable error code.
pub fn run_cli(cli: Cli) -> Result<()> {
    if let Command::Functions { json } = cli.command {
        print_functions(json)?;
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let mut ledger = SqliteLedger::open(&cli.db)?;
    ledger.migrate()?;
    tracing::debug!(db = %cli.db.display(), "opened ledger");
    run_command(cli.command, &mut ledger, &config)
}

/// Executes a parsed command against an existing ledger handle.
///
/// # Errors
/// Returns an error when the ledger rejects the call or the index check
/// finds inconsistencies.
pub fn run_command(
    command: Command,
    ledger: &mut SqliteLedger,
    config: &LedgerConfig,
) -> Result<()> {
    match command {
        Command::Invoke(args) => {
            let function = Function::parse(&args.function).ok_or_else(|| {
                LedgerError::InvalidArgument(format!("unknown function {:?}", args.function))
            })?;
            let payload = invoke_atomic(
                ledger,
                config,
                &args.caller,
                function.as_str(),
                &args.args,
            )?;
            print_payload(function, &payload)
        }
        Command::Functions { json } => print_functions(json),
        Command::Index { command } => match command {
            IndexCommand::Check { json } => {
                let check = ledger.index_check()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&check)?);
                } else {
                    print_index_check(&check);
                }
                if check.healthy {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "ledger indexes disagree with primary records: {} missing, {} orphaned",
                        check.missing.len(),
                        check.orphaned.len()
                    ))
                }
            }
        },
    }
}

/// Loads a ledger configuration file, falling back to the v1 defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or holds an invalid
/// configuration.
pub fn load_config(path: Option<&Path>) -> Result<LedgerConfig> {
    let Some(path) = path else {
        return Ok(LedgerConfig::v1());
    };

    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read ledger config {}", path.display()))?;
    let value: Value = serde_json::from_str(&body)
        .with_context(|| format!("ledger config {} is not valid JSON", path.display()))?;
    Ok(LedgerConfig::from_json(&value)?)
}

fn print_payload(function: Function, payload: &[u8]) -> Result<()> {
    if function.payload_is_json() {
        let value: Value =
            serde_json::from_slice(payload).context("ledger returned a malformed JSON payload")?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", String::from_utf8_lossy(payload));
    }
    Ok(())
}

fn print_functions(json: bool) -> Result<()> {
    let names: Vec<&str> = Function::ALL
        .iter()
        .map(|function| function.as_str())
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        for function in Function::ALL {
            let access = if function.is_read_only() { "read" } else { "write" };
            println!("{}\t{access}", function.as_str());
        }
    }
    Ok(())
}

fn print_index_check(check: &IndexCheck) {
    println!("healthy={}", if check.healthy { "yes" } else { "no" });
    println!("records={}", check.records);
    println!("index_entries={}", check.index_entries);
    for entry in &check.missing {
        println!("missing {} [{}]", entry.index, entry.attributes.join(", "));
    }
    for entry in &check.orphaned {
        println!("orphaned {} [{}]", entry.index, entry.attributes.join(", "));
    }
}
