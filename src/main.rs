//! wallet_ledger - operator CLI
//!
//! Runs single ledger operations against the PostgreSQL backend and prints the
//! result as JSON.
//!
//! ```text
//! wallet_ledger [--env dev] health
//! wallet_ledger [--env dev] open-wallet <user>
//! wallet_ledger [--env dev] balance <user>
//! wallet_ledger [--env dev] deposit <user> <amount> [note]
//! wallet_ledger [--env dev] transfer <from> <to> <amount> [note]
//! wallet_ledger [--env dev] history <user> [page] [page_size]
//! wallet_ledger [--env dev] reconcile <user>
//! ```

use anyhow::{Context, anyhow, bail};
use serde::Serialize;
use std::sync::Arc;

use wallet_ledger::balance::BalanceService;
use wallet_ledger::config::AppConfig;
use wallet_ledger::db::Database;
use wallet_ledger::error::LedgerError;
use wallet_ledger::history::HistoryService;
use wallet_ledger::money::parse_amount;
use wallet_ledger::store::{DEFAULT_PAGE_SIZE, PgLedger};
use wallet_ledger::transfer::PgTransferEngine;

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env(args: &[String]) -> String {
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Arguments with the program name and `--env <name>` removed
fn positional(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--env" || arg == "-e" {
            iter.next();
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn arg<'a>(rest: &'a [String], index: usize, name: &str) -> anyhow::Result<&'a str> {
    rest.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing argument <{}>", name))
}

fn user_arg(rest: &[String], index: usize, name: &str) -> anyhow::Result<i64> {
    let raw = arg(rest, index, name)?;
    raw.parse()
        .with_context(|| format!("<{}> must be an integer user id, got {:?}", name, raw))
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    status: u16,
    message: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

/// Serialize a successful outcome; ledger errors pass through untouched
fn render<T: Serialize>(
    outcome: Result<T, LedgerError>,
) -> anyhow::Result<Result<serde_json::Value, LedgerError>> {
    match outcome {
        Ok(value) => Ok(Ok(
            serde_json::to_value(value).context("Failed to serialize result")?
        )),
        Err(e) => Ok(Err(e)),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let env = get_env(&args);
    let app_config = AppConfig::load(&env)?;
    let log_guard = wallet_ledger::logging::init_logging(&app_config);

    let rest = positional(&args);
    let Some(command) = rest.first().cloned() else {
        bail!("usage: wallet_ledger [--env <name>] <health|open-wallet|balance|deposit|transfer|history|reconcile> ...");
    };

    let url = app_config
        .postgres_url
        .clone()
        .context("postgres_url is not configured (set it in config or DATABASE_URL)")?;
    let ledger_config = &app_config.ledger;
    let db = Database::connect(&url, ledger_config.max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tracing::info!(env = %env, command = %command, "wallet_ledger starting");

    let store = Arc::new(PgLedger::from_database(&db, ledger_config.lock_timeout()));
    let engine = PgTransferEngine::from_store(store.clone(), ledger_config.retry_policy());
    let balances = BalanceService::from_store(store.clone());
    let history = HistoryService::from_store(store);

    let outcome: Result<serde_json::Value, LedgerError> = match command.as_str() {
        "health" => {
            db.health_check().await.context("Health check failed")?;
            render(Ok(HealthBody { status: "ok" }))?
        }
        "open-wallet" => {
            let user = user_arg(&rest, 1, "user")?;
            render(engine.open_wallet(user).await)?
        }
        "balance" => {
            let user = user_arg(&rest, 1, "user")?;
            render(balances.get_balance(user).await)?
        }
        "deposit" => {
            let user = user_arg(&rest, 1, "user")?;
            let amount = parse_amount(arg(&rest, 2, "amount")?)?;
            let note = rest.get(3).cloned();
            render(engine.deposit(user, amount, note).await)?
        }
        "transfer" => {
            let from = user_arg(&rest, 1, "from")?;
            let to = user_arg(&rest, 2, "to")?;
            let amount = parse_amount(arg(&rest, 3, "amount")?)?;
            let note = rest.get(4).cloned();
            render(engine.transfer(from, to, amount, note).await)?
        }
        "history" => {
            let user = user_arg(&rest, 1, "user")?;
            let page = rest.get(2).and_then(|p| p.parse().ok()).unwrap_or(1);
            let page_size = rest
                .get(3)
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PAGE_SIZE as i64);
            render(history.list_page(user, page, page_size).await)?
        }
        "reconcile" => {
            let user = user_arg(&rest, 1, "user")?;
            render(balances.reconcile(user).await)?
        }
        other => bail!("unknown command: {}", other),
    };

    match outcome {
        Ok(value) => print_json(&value),
        Err(e) => {
            tracing::warn!(command = %command, code = e.code(), error = %e, "Command failed");
            print_json(&ErrorBody {
                code: e.code(),
                status: e.http_status(),
                message: e.to_string(),
            })?;
            drop(log_guard);
            std::process::exit(1);
        }
    }
}
