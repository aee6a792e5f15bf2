//! chainstream CLI: tail action and table-delta streams from the terminal.
//!
//! Usage:
//! ```bash
//! # Live transfers out of one account
//! chainstream actions --url https://wax.eosusa.io --contract eosio.token --action transfer --account alice
//!
//! # Replay a block range of a table
//! chainstream deltas --url https://wax.eosusa.io --code m.federation --table bags --from 100000000 --to 100000500
//! ```
//!
//! Records are printed as one JSON object per line. Set `RUST_LOG=debug`
//! to see head-of-chain updates.

use std::env;
use std::process;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use chainstream_core::{ActionQuery, Bound, ChainHead, DeltaQuery, Query};
use chainstream_ws::{ClientConfig, StreamClient};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "actions" => cmd_actions(&args[2..]).await,
        "deltas" => cmd_deltas(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("chainstream {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainstream {}", env!("CARGO_PKG_VERSION"));
    println!("Tail action and table-delta streams from a Hyperion endpoint\n");
    println!("USAGE:");
    println!("    chainstream <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    actions    Stream action traces");
    println!("    deltas     Stream table deltas");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("COMMON FLAGS:");
    println!("    --url <URL>         Endpoint base URL (http, https, ws, wss)  [required]");
    println!("    --from <N|TIME>     Start block or RFC3339 time (default: head)");
    println!("    --to <N|TIME>       End block or time (default: keep streaming)");
    println!("    --insecure          Skip TLS certificate verification\n");
    println!("ACTIONS FLAGS:");
    println!("    --contract <NAME>   Contract account  [required]");
    println!("    --action <NAME>     Action name (empty = any)");
    println!("    --account <NAME>    Notified account (empty = any)");
    println!("    --filter <F=V>      Match action data field F against V (repeatable)\n");
    println!("DELTAS FLAGS:");
    println!("    --code <NAME>       Contract account  [required]");
    println!("    --table <NAME>      Table name  [required]");
    println!("    --scope <NAME>      Scope (empty = any)");
    println!("    --payer <NAME>      RAM payer (empty = any)");
}

async fn cmd_actions(args: &[String]) -> Result<()> {
    let contract = parse_flag(args, "--contract").context("--contract is required")?;
    let mut query = ActionQuery::new(
        contract,
        parse_flag(args, "--account").unwrap_or_default(),
        parse_flag(args, "--action").unwrap_or_default(),
    )
    .window(parse_bound(args, "--from")?, parse_bound(args, "--to")?);
    for filter in parse_flags(args, "--filter") {
        let (field, value) = filter
            .split_once('=')
            .ok_or_else(|| anyhow!("--filter expects field=value, got '{filter}'"))?;
        query = query.with_filter(field, value);
    }
    stream(args, query.into()).await
}

async fn cmd_deltas(args: &[String]) -> Result<()> {
    let code = parse_flag(args, "--code").context("--code is required")?;
    let table = parse_flag(args, "--table").context("--table is required")?;
    let query = DeltaQuery::new(
        code,
        table,
        parse_flag(args, "--scope").unwrap_or_default(),
        parse_flag(args, "--payer").unwrap_or_default(),
    )
    .window(parse_bound(args, "--from")?, parse_bound(args, "--to")?);
    stream(args, query.into()).await
}

/// Connect, subscribe and print records until the peer ends the stream or
/// Ctrl-C is pressed.
async fn stream(args: &[String], query: Query) -> Result<()> {
    let url = parse_flag(args, "--url").context("--url is required")?;
    let mut config = ClientConfig::default();
    if has_flag(args, "--insecure") {
        config = config.insecure();
    }

    let (client, mut streams) = StreamClient::connect(&url, config)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    client.subscribe(query).await.context("subscribing")?;
    info!(url = %url, "streaming, press Ctrl-C to stop");

    let mut heads = client.watch_head();
    let mut fatal = None;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupted");
                break;
            }
            changed = heads.changed() => {
                if changed.is_ok() {
                    log_head(&mut heads);
                }
            }
            resp = streams.responses.recv() => match resp {
                Some(resp) => println!("{}", resp.to_json()?),
                None => break,
            },
            err = streams.errors.recv() => match err {
                Some(e) if e.is_fatal() && client.is_cancelled() => {
                    fatal = Some(e);
                    break;
                }
                Some(e) => eprintln!("warning: {e}"),
                None => break,
            },
        }
    }

    client.close().await;
    if fatal.is_none() {
        fatal = std::iter::from_fn(|| streams.errors.try_recv().ok()).find(|e| e.is_fatal());
    }
    match fatal {
        Some(e) if e.is_peer_exit() => {
            info!("stream ended by peer");
            Ok(())
        }
        Some(e) => Err(e).context("stream failed"),
        None => Ok(()),
    }
}

fn log_head(heads: &mut watch::Receiver<Option<ChainHead>>) {
    if let Some(head) = heads.borrow_and_update().as_ref() {
        debug!(block_num = head.block_num, block_id = %head.block_id, "last irreversible block");
    }
}

fn parse_bound(args: &[String], flag: &str) -> Result<Bound> {
    match parse_flag(args, flag) {
        Some(raw) => raw.parse().with_context(|| format!("invalid {flag} value '{raw}'")),
        None => Ok(Bound::Head),
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

/// Every value given for a repeatable flag.
fn parse_flags(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
        .collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
