//! Command-line client for an accrue node's JSON-RPC API.
//!
//! Amounts are given in display units ("12.5") and sent as base units.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::HttpClientBuilder;

use accrue_core::constants::UNIT;

/// Decimal places in a display amount.
const UNIT_DECIMALS: usize = 8;

#[derive(Parser)]
#[command(name = "accrue-cli")]
#[command(version, about = "Talk to an accrue reward node")]
struct Cli {
    /// RPC endpoint URL.
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:18640")]
    rpc_endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show live accrual, claimable balance and session countdown.
    Observe(OwnerArgs),
    /// Open a mining session.
    Start(OwnerArgs),
    /// Claim from the claimable balance.
    Claim(AmountArgs),
    /// Roll the session over if it has ended.
    Rollover(OwnerArgs),
    /// Settle and end the active session.
    Complete(OwnerArgs),
    /// Open a stake.
    Deposit(DepositArgs),
    /// Show the owner's stake and cycle progress.
    Stake(OwnerArgs),
    /// Show the cached balance aggregate.
    Balance(OwnerArgs),
    /// Register a sponsor for an owner.
    Refer(ReferArgs),
    /// List an owner's referred team.
    Team(OwnerArgs),
    /// Recompute the balance from the event log.
    Reconcile(OwnerArgs),
    /// Show or change an owner's entitlements.
    Entitlements(EntitlementArgs),
}

#[derive(Args)]
struct OwnerArgs {
    /// Owner identifier.
    owner: String,
}

#[derive(Args)]
struct AmountArgs {
    /// Owner identifier.
    owner: String,

    /// Amount in display units (e.g. 12.5).
    #[arg(short, long)]
    amount: String,
}

#[derive(Args)]
struct DepositArgs {
    /// Owner identifier.
    owner: String,

    /// Principal in display units.
    #[arg(short, long)]
    amount: String,

    /// Caller-chosen idempotency key for this deposit.
    #[arg(short = 'k', long)]
    deposit_ref: String,
}

#[derive(Args)]
struct ReferArgs {
    /// Sponsor receiving commission.
    sponsor: String,

    /// Owner being referred.
    referred: String,
}

#[derive(Args)]
struct EntitlementArgs {
    /// Owner identifier.
    owner: String,

    /// Fixed-emission multiplier in basis points (10000 = 1.0x).
    #[arg(long)]
    rate_multiplier_bps: Option<u64>,

    /// Use 48-hour sessions.
    #[arg(long)]
    extended_session: Option<bool>,

    /// Open sessions without consuming quota.
    #[arg(long)]
    unrestricted_mining: Option<bool>,

    /// Remaining session quota.
    #[arg(long)]
    sessions_remaining: Option<u32>,
}

impl EntitlementArgs {
    fn has_changes(&self) -> bool {
        self.rate_multiplier_bps.is_some()
            || self.extended_session.is_some()
            || self.unrestricted_mining.is_some()
            || self.sessions_remaining.is_some()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = HttpClientBuilder::default()
        .build(&cli.rpc_endpoint)
        .context("Failed to connect to RPC")?;

    let (method, params) = match cli.command {
        Commands::Observe(a) => ("observeaccrual", params_of([a.owner.into()])?),
        Commands::Start(a) => ("startsession", params_of([a.owner.into()])?),
        Commands::Claim(a) => {
            let amount = parse_amount(&a.amount)?;
            ("claim", params_of([a.owner.into(), amount.into()])?)
        }
        Commands::Rollover(a) => ("rolloverifexpired", params_of([a.owner.into()])?),
        Commands::Complete(a) => ("completesession", params_of([a.owner.into()])?),
        Commands::Deposit(a) => {
            let amount = parse_amount(&a.amount)?;
            ("deposit", params_of([a.owner.into(), amount.into(), a.deposit_ref.into()])?)
        }
        Commands::Stake(a) => ("getstake", params_of([a.owner.into()])?),
        Commands::Balance(a) => ("getbalance", params_of([a.owner.into()])?),
        Commands::Refer(a) => ("registerreferral", params_of([a.sponsor.into(), a.referred.into()])?),
        Commands::Team(a) => ("getteam", params_of([a.owner.into()])?),
        Commands::Reconcile(a) => ("reconcile", params_of([a.owner.into()])?),
        Commands::Entitlements(a) if a.has_changes() => {
            let current: serde_json::Value = client
                .request("getentitlements", params_of([a.owner.clone().into()])?)
                .await
                .context("RPC getentitlements failed")?;
            let updated = apply_entitlements(current, &a);
            ("setentitlements", params_of([updated])?)
        }
        Commands::Entitlements(a) => ("getentitlements", params_of([a.owner.into()])?),
    };

    let result: serde_json::Value = client
        .request(method, params)
        .await
        .with_context(|| format!("RPC {method} failed"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn params_of<const N: usize>(values: [serde_json::Value; N]) -> Result<ArrayParams> {
    let mut params = ArrayParams::new();
    for v in values {
        params.insert(v).context("Failed to encode RPC parameter")?;
    }
    Ok(params)
}

fn apply_entitlements(mut current: serde_json::Value, args: &EntitlementArgs) -> serde_json::Value {
    if let Some(bps) = args.rate_multiplier_bps {
        current["rate_multiplier_bps"] = bps.into();
    }
    if let Some(extended) = args.extended_session {
        current["extended_session"] = extended.into();
    }
    if let Some(unrestricted) = args.unrestricted_mining {
        current["unrestricted_mining"] = unrestricted.into();
    }
    if let Some(remaining) = args.sessions_remaining {
        current["sessions_remaining"] = remaining.into();
    }
    current
}

/// Parse a display amount ("12.5") into base units without going through
/// floating point.
fn parse_amount(s: &str) -> Result<u64> {
    let s = s.trim();
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.is_empty() && frac.is_empty() {
        bail!("Empty amount");
    }
    if frac.len() > UNIT_DECIMALS {
        bail!("Amount has more than {UNIT_DECIMALS} decimal places: {s}");
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        bail!("Invalid amount: {s}");
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().context("Invalid amount")? };
    let frac_units: u64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<UNIT_DECIMALS$}").parse().context("Invalid amount")?
    };
    whole
        .checked_mul(UNIT)
        .and_then(|w| w.checked_add(frac_units))
        .with_context(|| format!("Amount out of range: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_whole_and_fractional_amounts() {
        assert_eq!(parse_amount("12").unwrap(), 12 * UNIT);
        assert_eq!(parse_amount("12.5").unwrap(), 12 * UNIT + UNIT / 2);
        assert_eq!(parse_amount(".00000001").unwrap(), 1);
        assert_eq!(parse_amount(" 0.1 ").unwrap(), UNIT / 10);
    }

    #[test]
    fn parse_rejects_malformed_amounts() {
        assert!(parse_amount("").is_err());
        assert!(parse_amount(".").is_err());
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount("1.000000001").is_err());
        assert!(parse_amount("1e5").is_err());
        assert!(parse_amount("999999999999999").is_err());
    }

    #[test]
    fn entitlement_flags_patch_only_given_fields() {
        let current = serde_json::json!({
            "owner": "alice",
            "rate_multiplier_bps": 10000,
            "extended_session": false,
            "unrestricted_mining": true,
            "sessions_remaining": 0,
        });
        let args = EntitlementArgs {
            owner: "alice".into(),
            rate_multiplier_bps: Some(15_000),
            extended_session: None,
            unrestricted_mining: Some(false),
            sessions_remaining: Some(3),
        };
        let patched = apply_entitlements(current, &args);
        assert_eq!(patched["rate_multiplier_bps"], 15_000);
        assert_eq!(patched["extended_session"], false);
        assert_eq!(patched["unrestricted_mining"], false);
        assert_eq!(patched["sessions_remaining"], 3);
        assert_eq!(patched["owner"], "alice");
    }
}
