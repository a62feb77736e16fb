use alloy::primitives::Address;
use dotenv::dotenv;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

use hd_multisend::{
    network::{ChainListCatalog, ChainMetadataSource, DEFAULT_CHAIN_LIST_URL},
    utils::{format_amount, NATIVE_DECIMALS},
    wallet::BalanceEvent,
    Config, JsonFileSink, NetworkContext, TokenConfig, WalletManager,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();
    let _log_guard = init_logging()?;

    let config = Config::from_env()?;
    let seed_phrase = read_seed_phrase()?;

    let chain_id = env_parse("CHAIN_ID", 137u64)?;
    let network = resolve_network(chain_id).await?;
    let mut wallet_manager = WalletManager::connect(network.clone(), config).await?;

    if let Some(token) = resolve_token(&wallet_manager).await? {
        let rpc = wallet_manager.rpc().clone();
        wallet_manager.replace_rpc(network.with_token(token), rpc);
    }

    let start = env_parse("WALLET_START", 0u32)?;
    let end = env_parse("WALLET_END", 9u32)?;
    let count = wallet_manager.generate_wallets(&seed_phrase, start, end)?;
    drop(seed_phrase);
    info!(count, start, end, "Wallets derived");

    let snapshots = wallet_manager
        .check_all_balances(&|event| match event {
            BalanceEvent::Checking { index, address } => {
                info!(index, %address, "Checking balance")
            }
            BalanceEvent::Completed(snapshot) => info!(
                index = snapshot.index,
                native = %snapshot.native.display(NATIVE_DECIMALS),
                "Balance checked"
            ),
            BalanceEvent::Error(snapshot) => {
                warn!(index = snapshot.index, "Balance check failed")
            }
        })
        .await;

    let network = wallet_manager.network();
    let token_decimals = network.token.as_ref().map(|t| t.decimals).unwrap_or(0);
    let totals = wallet_manager.totals();
    println!("Wallets on {} (chain {}):", network.name, network.chain_id);
    for wallet in wallet_manager.session().wallets() {
        println!(
            "  {:>3}: {} {} {}",
            wallet.index,
            wallet.address,
            wallet.native_balance.display(NATIVE_DECIMALS),
            wallet.token_balance.display(token_decimals)
        );
    }
    println!(
        "Total: {} {} across {} wallets ({} failed checks)",
        format_amount(totals.total_native, NATIVE_DECIMALS),
        network.native_currency_symbol,
        totals.wallet_count,
        snapshots.iter().filter(|s| s.is_error()).count()
    );
    if let Some(token) = &network.token {
        println!(
            "Total: {} {}",
            format_amount(totals.total_token, token.decimals),
            token.symbol
        );
    }

    let export_dir = dotenv::var("EXPORT_DIR").unwrap_or_else(|_| "export".to_string());
    let sink = JsonFileSink::new(&export_dir);
    wallet_manager.export_wallets(&sink)?;
    println!("Exported to {}", sink.path_for("wallets").display());

    wallet_manager.clear_wallets();
    Ok(())
}

/// Installs stdout and daily rolling file logging. The returned guard flushes
/// the file writer on drop.
fn init_logging() -> eyre::Result<WorkerGuard> {
    std::fs::create_dir_all("logs")?;
    let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily("logs", "hd-multisend.log"));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().json().with_writer(file_writer))
        .init();
    Ok(guard)
}

fn read_seed_phrase() -> eyre::Result<Zeroizing<String>> {
    if let Ok(phrase) = dotenv::var("SEED_PHRASE") {
        return Ok(Zeroizing::new(phrase));
    }

    print!("Seed phrase: ");
    io::stdout().flush()?;
    let mut phrase = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut phrase)?;
    if phrase.trim().is_empty() {
        eyre::bail!("A seed phrase is required");
    }
    Ok(phrase)
}

fn env_parse<T>(name: &str, default: T) -> eyre::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match dotenv::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| eyre::eyre!("{} is invalid: {}", name, e)),
        Err(_) => Ok(default),
    }
}

/// Looks the chain up in the chain list. `RPC_URL` overrides the selected
/// endpoint and is used alone when the lookup fails.
async fn resolve_network(chain_id: u64) -> eyre::Result<NetworkContext> {
    let rpc_url = dotenv::var("RPC_URL").ok();
    let catalog = ChainListCatalog::new(
        dotenv::var("CHAIN_LIST_URL").unwrap_or_else(|_| DEFAULT_CHAIN_LIST_URL.to_string()),
    );

    let looked_up = match catalog.chain(chain_id).await {
        Ok(metadata) => NetworkContext::from_metadata(&metadata, None),
        Err(e) => Err(e),
    };

    match (looked_up, rpc_url) {
        (Ok(network), Some(url)) => Ok(network.with_rpc_endpoint(url)),
        (Ok(network), None) => Ok(network),
        (Err(e), Some(url)) => {
            warn!(chain_id, error = %e, "Chain lookup failed, using RPC_URL only");
            Ok(NetworkContext::new(chain_id, format!("Chain {}", chain_id), url, "ETH"))
        }
        (Err(e), None) => Err(e.into()),
    }
}

/// Builds the token config from `TOKEN_*` variables, reading symbol and
/// decimals from the contract when they are not given.
async fn resolve_token(wallet_manager: &WalletManager) -> eyre::Result<Option<TokenConfig>> {
    let address = match dotenv::var("TOKEN_ADDRESS") {
        Ok(value) => value.trim().parse::<Address>()?,
        Err(_) => return Ok(None),
    };

    let symbol = dotenv::var("TOKEN_SYMBOL").ok();
    let decimals = dotenv::var("TOKEN_DECIMALS")
        .ok()
        .map(|d| d.trim().parse::<u8>())
        .transpose()?;

    let token = match (symbol, decimals) {
        (Some(symbol), Some(decimals)) => TokenConfig::new(symbol, address, decimals),
        _ => TokenConfig::discover(wallet_manager.rpc().as_ref(), address).await?,
    };
    Ok(Some(token))
}
