//! 配置管理模塊
//!
//! 負責加載和驗證完整性節點配置

use crate::comparison::TrustedPeer;
use crate::error::{IntegrityError, Result};
use crate::keystore::read_shared_key;
use crate::types::OperatorIdentity;
use base64::{engine::general_purpose, Engine as _};
use config::{Config, Environment, File};
use serde::Deserialize;
use snapshot_signer::SignatureAlgorithm;
use std::path::{Path, PathBuf};

/// 環境變量前綴
pub const ENV_PREFIX: &str = "INTEGRITY";

/// 受信任對等節點配置
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrustedPeerConfig {
    pub node_identity: String,
    /// Base64 編碼的 Dilithium3 公鑰
    #[serde(default)]
    pub public_key: Option<String>,
    /// HMAC 共享密鑰文件
    #[serde(default)]
    pub shared_key_path: Option<PathBuf>,
}

/// 完整性節點配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 節點身份（寫入快照）
    pub node_identity: String,
    /// 受監控的代碼根目錄
    pub code_root: PathBuf,
    pub code_extensions: Vec<String>,
    pub code_exclude_dirs: Vec<String>,
    /// JSON Lines 賬本文件；未設置時使用內存賬本
    pub ledger_path: Option<PathBuf>,
    /// 狀態目錄（基線、告警、審批、報告）；未設置時只在內存中運行
    pub state_dir: Option<PathBuf>,
    pub keystore_path: PathBuf,
    pub signature_algorithm: SignatureAlgorithm,
    pub generate_keys_if_missing: bool,
    /// 週期性審計間隔（秒）
    pub monitor_interval_secs: u64,
    /// 只追加主體全量重掃間隔（採集次數，0 表示從不）
    pub ledger_rescan_every: u32,
    pub listen_addr: String,
    /// 審批接口的 Bearer token；未設置時不做鑑權
    pub admin_token: Option<String>,
    /// 授權的審批人；為空表示接受任何有效身份
    pub authorized_approvers: Vec<String>,
    pub trusted_peers: Vec<TrustedPeerConfig>,
    /// 對等節點 HTTP 請求超時（秒）
    pub http_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_identity: "integrity-node".to_string(),
            code_root: PathBuf::from("."),
            code_extensions: vec!["rs".to_string(), "toml".to_string()],
            code_exclude_dirs: vec!["target".to_string(), ".git".to_string()],
            ledger_path: None,
            state_dir: None,
            keystore_path: PathBuf::from("./keys"),
            signature_algorithm: SignatureAlgorithm::Dilithium3,
            generate_keys_if_missing: true,
            monitor_interval_secs: 300,
            ledger_rescan_every: 12,
            listen_addr: "127.0.0.1:8080".to_string(),
            admin_token: None,
            authorized_approvers: Vec::new(),
            trusted_peers: Vec::new(),
            http_timeout_secs: 10,
        }
    }
}

impl NodeConfig {
    /// 解析授權審批人名單
    pub fn approver_identities(&self) -> Result<Vec<OperatorIdentity>> {
        self.authorized_approvers
            .iter()
            .map(|raw| OperatorIdentity::parse(raw))
            .collect()
    }

    /// 解析受信任對等節點（讀取共享密鑰文件、解碼公鑰）
    pub fn trusted_peers(&self) -> Result<Vec<TrustedPeer>> {
        self.trusted_peers
            .iter()
            .map(|peer| {
                let public_key = peer
                    .public_key
                    .as_ref()
                    .map(|pk| {
                        general_purpose::STANDARD.decode(pk).map_err(|e| {
                            IntegrityError::Config(format!(
                                "Invalid public key for peer {}: {}",
                                peer.node_identity, e
                            ))
                        })
                    })
                    .transpose()?;
                let shared_key = peer
                    .shared_key_path
                    .as_deref()
                    .map(read_shared_key)
                    .transpose()?;
                Ok(TrustedPeer {
                    node_identity: peer.node_identity.clone(),
                    public_key,
                    shared_key,
                })
            })
            .collect()
    }
}

/// 從配置文件加載節點配置，環境變量覆蓋文件中的值
///
/// # 參數
/// - `config_path`: 配置文件路徑（支持 TOML、JSON、YAML）
///
/// # 返回
/// - `Ok(NodeConfig)`: 成功加載的配置
/// - `Err(IntegrityError)`: 配置文件格式錯誤或字段無效
///
/// # 示例
/// ```no_run
/// use integrity_node::config::load_config;
///
/// let config = load_config("config.toml").expect("Failed to load config");
/// println!("Code root: {:?}", config.code_root);
/// ```
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<NodeConfig> {
    let config = Config::builder()
        .add_source(File::from(config_path.as_ref()))
        .add_source(Environment::with_prefix(ENV_PREFIX))
        .build()
        .map_err(|e| IntegrityError::Config(format!("Failed to load config file: {}", e)))?;

    let node_config: NodeConfig = config
        .try_deserialize()
        .map_err(|e| IntegrityError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&node_config)?;

    Ok(node_config)
}

/// 從環境變量加載配置（用於容器化部署）
///
/// 環境變量前綴: `INTEGRITY_`
/// 示例: `INTEGRITY_NODE_IDENTITY`, `INTEGRITY_CODE_ROOT`
pub fn load_config_from_env() -> Result<NodeConfig> {
    let config = Config::builder()
        .add_source(Environment::with_prefix(ENV_PREFIX))
        .build()
        .map_err(|e| IntegrityError::Config(format!("Failed to load env vars: {}", e)))?;

    let node_config: NodeConfig = config
        .try_deserialize()
        .map_err(|e| IntegrityError::Config(format!("Failed to parse env config: {}", e)))?;

    validate_config(&node_config)?;

    Ok(node_config)
}

/// 驗證配置的有效性
///
/// 檢查:
/// - 節點身份與代碼範圍
/// - 週期與超時不為 0
/// - 審批人名單與對等節點密鑰材料
pub fn validate_config(config: &NodeConfig) -> Result<()> {
    if config.node_identity.trim().is_empty() {
        return Err(IntegrityError::Config("node_identity must not be empty".to_string()));
    }

    if config.code_extensions.is_empty() {
        return Err(IntegrityError::Config(
            "code_extensions must list at least one extension".to_string(),
        ));
    }

    if config.monitor_interval_secs == 0 {
        return Err(IntegrityError::Config(
            "monitor_interval_secs must be greater than 0".to_string(),
        ));
    }

    if config.http_timeout_secs == 0 {
        return Err(IntegrityError::Config(
            "http_timeout_secs must be greater than 0".to_string(),
        ));
    }

    if matches!(&config.admin_token, Some(token) if token.trim().is_empty()) {
        return Err(IntegrityError::Config("admin_token must not be blank".to_string()));
    }

    for raw in &config.authorized_approvers {
        OperatorIdentity::parse(raw).map_err(|e| {
            IntegrityError::Config(format!("Invalid authorized approver {:?}: {}", raw, e))
        })?;
    }

    for peer in &config.trusted_peers {
        if peer.public_key.is_none() && peer.shared_key_path.is_none() {
            return Err(IntegrityError::Config(format!(
                "Trusted peer {} needs public_key or shared_key_path",
                peer.node_identity
            )));
        }
    }

    Ok(())
}
