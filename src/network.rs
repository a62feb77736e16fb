//! Active network parameters and the chain metadata they are built from.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Result, WalletError},
    rpc::ChainRpc,
};

/// Public chain list in the `chainid.network` format
pub const DEFAULT_CHAIN_LIST_URL: &str = "https://chainid.network/chains.json";

/// An ERC-20 style token tracked on the active network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

impl TokenConfig {
    pub fn new(symbol: impl Into<String>, address: Address, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            address,
            decimals,
        }
    }

    /// Reads `symbol()` and `decimals()` from the deployed contract.
    pub async fn discover(rpc: &dyn ChainRpc, address: Address) -> Result<Self> {
        let code = rpc.code_at(address).await?;
        if code.is_empty() {
            return Err(WalletError::ContractNotDeployed(address));
        }
        let symbol = rpc.token_symbol(address).await?;
        let decimals = rpc.token_decimals(address).await?;
        info!(%symbol, decimals, %address, "Discovered token");
        Ok(Self::new(symbol, address, decimals))
    }
}

/// Parameters of the single active chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub chain_id: u64,
    pub name: String,
    pub rpc_endpoints: Vec<String>,
    /// Endpoint the session's RPC client is connected to
    pub rpc_endpoint: String,
    pub native_currency_symbol: String,
    pub token: Option<TokenConfig>,
    pub explorer_url: Option<String>,
    pub is_testnet: bool,
}

impl NetworkContext {
    /// Builds a context for a single known endpoint.
    pub fn new(
        chain_id: u64,
        name: impl Into<String>,
        rpc_endpoint: impl Into<String>,
        native_currency_symbol: impl Into<String>,
    ) -> Self {
        let rpc_endpoint = rpc_endpoint.into();
        Self {
            chain_id,
            name: name.into(),
            rpc_endpoints: vec![rpc_endpoint.clone()],
            rpc_endpoint,
            native_currency_symbol: native_currency_symbol.into(),
            token: None,
            explorer_url: None,
            is_testnet: false,
        }
    }

    pub fn with_token(mut self, token: TokenConfig) -> Self {
        self.token = Some(token);
        self
    }

    /// Makes `url` the active endpoint, listing it first among the known ones.
    pub fn with_rpc_endpoint(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.rpc_endpoints.retain(|known| *known != url);
        self.rpc_endpoints.insert(0, url.clone());
        self.rpc_endpoint = url;
        self
    }

    /// Converts lookup-service metadata, picking the best usable endpoint.
    pub fn from_metadata(metadata: &ChainMetadata, token: Option<TokenConfig>) -> Result<Self> {
        let rpc_endpoint = select_rpc_endpoint(&metadata.rpc).ok_or_else(|| {
            WalletError::InvalidRequest(format!(
                "No usable RPC endpoint for chain {}",
                metadata.chain_id
            ))
        })?;

        Ok(Self {
            chain_id: metadata.chain_id,
            name: metadata.name.clone(),
            rpc_endpoints: metadata
                .rpc
                .iter()
                .map(|endpoint| endpoint.url().to_string())
                .collect(),
            rpc_endpoint,
            native_currency_symbol: metadata.native_currency.symbol.clone(),
            token,
            explorer_url: metadata.explorers.first().map(|e| e.url.clone()),
            is_testnet: metadata.is_testnet(),
        })
    }

    /// Explorer link for a transaction hash, when an explorer is known.
    pub fn explorer_tx_url(&self, tx_hash: &str) -> Option<String> {
        self.explorer_url
            .as_ref()
            .map(|base| format!("{}/tx/{}", base.trim_end_matches('/'), tx_hash))
    }
}

/// An RPC entry as published by chain lists: a bare URL or an annotated object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcEndpoint {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        tracking: Option<String>,
        #[serde(default, rename = "isOpenSource")]
        is_open_source: bool,
    },
}

impl RpcEndpoint {
    pub fn url(&self) -> &str {
        match self {
            RpcEndpoint::Url(url) => url,
            RpcEndpoint::Detailed { url, .. } => url,
        }
    }

    fn is_non_tracking(&self) -> bool {
        matches!(self, RpcEndpoint::Detailed { tracking: Some(t), .. } if t == "none")
    }

    fn is_open_source(&self) -> bool {
        matches!(self, RpcEndpoint::Detailed { is_open_source: true, .. })
    }

    /// An `http(s)` URL without unresolved `${...}` placeholders.
    pub fn is_usable(&self) -> bool {
        let url = self.url();
        (url.starts_with("https://") || url.starts_with("http://"))
            && !url.contains("${")
            && !url.contains('{')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    #[serde(default)]
    pub name: String,
    pub symbol: String,
    #[serde(default = "default_native_decimals")]
    pub decimals: u8,
}

fn default_native_decimals() -> u8 {
    18
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explorer {
    #[serde(default)]
    pub name: String,
    pub url: String,
}

/// One chain entry of a public chain list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMetadata {
    pub chain_id: u64,
    pub name: String,
    #[serde(default)]
    pub rpc: Vec<RpcEndpoint>,
    pub native_currency: NativeCurrency,
    #[serde(default)]
    pub explorers: Vec<Explorer>,
    #[serde(default)]
    pub is_testnet: Option<bool>,
}

impl ChainMetadata {
    pub fn is_testnet(&self) -> bool {
        self.is_testnet.unwrap_or_else(|| {
            let name = self.name.to_lowercase();
            ["testnet", "sepolia", "goerli", "holesky", "amoy", "devnet"]
                .iter()
                .any(|marker| name.contains(marker))
        })
    }
}

/// Picks an endpoint: open-source non-tracking, then non-tracking, then the
/// first usable one.
pub fn select_rpc_endpoint(endpoints: &[RpcEndpoint]) -> Option<String> {
    let usable: Vec<&RpcEndpoint> = endpoints.iter().filter(|e| e.is_usable()).collect();

    usable
        .iter()
        .find(|e| e.is_non_tracking() && e.is_open_source())
        .or_else(|| usable.iter().find(|e| e.is_non_tracking()))
        .or_else(|| usable.first())
        .map(|e| e.url().to_string())
}

/// Looks up chain metadata by chain ID.
#[async_trait]
pub trait ChainMetadataSource: Send + Sync {
    async fn chain(&self, chain_id: u64) -> Result<ChainMetadata>;
}

/// Fetches a chain list over HTTP on every lookup.
#[derive(Debug, Clone)]
pub struct ChainListCatalog {
    url: String,
}

impl Default for ChainListCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_CHAIN_LIST_URL)
    }
}

impl ChainListCatalog {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ChainMetadataSource for ChainListCatalog {
    async fn chain(&self, chain_id: u64) -> Result<ChainMetadata> {
        let response = reqwest::get(&self.url)
            .await
            .map_err(|e| WalletError::ProviderError(format!("Failed to fetch chain list: {}", e)))?;

        let body = response.text().await.map_err(|e| {
            WalletError::ProviderError(format!("Failed to read response body: {}", e))
        })?;

        find_chain(&body, chain_id)
    }
}

/// Finds `chain_id` in a JSON chain list, skipping entries that do not parse.
pub fn find_chain(body: &str, chain_id: u64) -> Result<ChainMetadata> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(body)?;
    entries
        .into_iter()
        .filter(|entry| entry["chainId"].as_u64() == Some(chain_id))
        .find_map(|entry| serde_json::from_value::<ChainMetadata>(entry).ok())
        .ok_or_else(|| {
            WalletError::InvalidRequest(format!("Chain {} not found in chain list", chain_id))
        })
}
