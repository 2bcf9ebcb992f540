//! 節點簽名密鑰管理與持久化模塊
//!
//! # 文件結構
//!
//! ```text
//! {base_path}/
//!   ├── node_public.key   (Dilithium3 公鑰, 1952 bytes)
//!   ├── node_secret.key   (Dilithium3 私鑰, 僅所有者可讀)
//!   └── node_hmac.key     (HMAC-SHA256 共享密鑰, 32 bytes, 僅所有者可讀)
//! ```
//!
//! ## 文件權限（Unix/Linux）
//!
//! - 私鑰與 HMAC 密鑰文件設置為 `0o600`
//! - 公鑰文件設置為 `0o644`
//!
//! ⚠️ 密鑰以**未加密**形式存儲，依賴操作系統文件權限保護。
//!
//! # 使用示例
//!
//! ```no_run
//! use integrity_node::keystore::{keystore_exists, Keystore};
//! use snapshot_signer::SignatureAlgorithm;
//! use std::path::Path;
//!
//! let path = Path::new("./keys");
//! let keystore = if keystore_exists(path, SignatureAlgorithm::Dilithium3) {
//!     Keystore::load(path, SignatureAlgorithm::Dilithium3)?
//! } else {
//!     Keystore::generate_and_save(path, SignatureAlgorithm::Dilithium3)?
//! };
//! # Ok::<(), integrity_node::error::IntegrityError>(())
//! ```

use crate::error::{IntegrityError, Result};
use snapshot_signer::{Dilithium3Signer, HmacSha256Signer, SignatureAlgorithm, Signer};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const PUBLIC_KEY_FILE: &str = "node_public.key";
const SECRET_KEY_FILE: &str = "node_secret.key";
const HMAC_KEY_FILE: &str = "node_hmac.key";

/// 節點密鑰
pub enum NodeKey {
    Dilithium3(Dilithium3Signer),
    HmacSha256(HmacSha256Signer),
}

impl NodeKey {
    pub fn signer(&self) -> &dyn Signer {
        match self {
            NodeKey::Dilithium3(s) => s,
            NodeKey::HmacSha256(s) => s,
        }
    }
}

/// 密鑰庫：管理節點簽名密鑰的持久化存儲
pub struct Keystore {
    key: NodeKey,
    /// 密鑰存儲路徑（用於日誌和調試）
    base_path: PathBuf,
}

impl Keystore {
    /// 生成新密鑰並保存到文件
    ///
    /// # 參數
    ///
    /// - `base_path`: 密鑰文件存儲目錄（會自動創建）
    /// - `algorithm`: 簽名算法
    ///
    /// # 文件操作
    ///
    /// 1. 創建目錄（如果不存在）
    /// 2. 生成密鑰
    /// 3. 寫入密鑰文件並設置權限（僅 Unix）
    pub fn generate_and_save(base_path: &Path, algorithm: SignatureAlgorithm) -> Result<Self> {
        info!("Generating new {} key at {:?}", algorithm, base_path);

        // 步驟 1: 確保目錄存在
        fs::create_dir_all(base_path).map_err(|e| {
            IntegrityError::Config(format!(
                "Failed to create keystore directory {:?}: {}",
                base_path, e
            ))
        })?;

        // 步驟 2 & 3: 生成並寫入
        let key = match algorithm {
            SignatureAlgorithm::Dilithium3 => {
                let signer = Dilithium3Signer::generate();
                write_key_file(&base_path.join(PUBLIC_KEY_FILE), signer.public_key_bytes(), 0o644)?;
                write_key_file(&base_path.join(SECRET_KEY_FILE), signer.secret_key_bytes(), 0o600)?;
                NodeKey::Dilithium3(signer)
            }
            SignatureAlgorithm::HmacSha256 => {
                let signer = HmacSha256Signer::generate();
                write_key_file(&base_path.join(HMAC_KEY_FILE), signer.key_bytes(), 0o600)?;
                NodeKey::HmacSha256(signer)
            }
        };

        info!("Key successfully saved to {:?}", base_path);

        Ok(Self {
            key,
            base_path: base_path.to_path_buf(),
        })
    }

    /// 從文件加載現有密鑰
    ///
    /// # 錯誤
    ///
    /// - 密鑰文件不存在
    /// - 文件讀取失敗
    /// - 密鑰格式無效
    pub fn load(base_path: &Path, algorithm: SignatureAlgorithm) -> Result<Self> {
        info!("Loading {} key from {:?}", algorithm, base_path);

        let key = match algorithm {
            SignatureAlgorithm::Dilithium3 => {
                let public_key = read_key_file(&base_path.join(PUBLIC_KEY_FILE))?;
                let secret_path = base_path.join(SECRET_KEY_FILE);
                let secret_key = read_key_file(&secret_path)?;
                check_permissions(&secret_path);

                let signer = Dilithium3Signer::from_bytes(&public_key, &secret_key).map_err(|e| {
                    IntegrityError::SigningFailure(format!(
                        "Failed to restore keypair from files: {}. Files may be corrupted.",
                        e
                    ))
                })?;
                NodeKey::Dilithium3(signer)
            }
            SignatureAlgorithm::HmacSha256 => {
                let key_path = base_path.join(HMAC_KEY_FILE);
                let key = read_key_file(&key_path)?;
                check_permissions(&key_path);
                NodeKey::HmacSha256(HmacSha256Signer::new(&key)?)
            }
        };

        info!("Key successfully loaded from {:?}", base_path);

        Ok(Self {
            key,
            base_path: base_path.to_path_buf(),
        })
    }

    /// 存在則加載，否則按配置生成
    ///
    /// `generate_if_missing = false` 且文件不存在時返回 `Config` 錯誤
    pub fn load_or_generate(
        base_path: &Path,
        algorithm: SignatureAlgorithm,
        generate_if_missing: bool,
    ) -> Result<Self> {
        if keystore_exists(base_path, algorithm) {
            Self::load(base_path, algorithm)
        } else if generate_if_missing {
            Self::generate_and_save(base_path, algorithm)
        } else {
            Err(IntegrityError::Config(format!(
                "No {} key found in {:?} and key generation is disabled",
                algorithm, base_path
            )))
        }
    }

    pub fn signer(&self) -> &dyn Signer {
        self.key.signer()
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.signer().algorithm()
    }

    /// 公鑰字節（僅非對稱算法）
    pub fn public_key_bytes(&self) -> Option<Vec<u8>> {
        self.signer().public_key().map(|pk| pk.to_vec())
    }

    /// 共享密鑰字節（僅對稱算法）
    pub fn shared_key_bytes(&self) -> Option<Vec<u8>> {
        match &self.key {
            NodeKey::HmacSha256(s) => Some(s.key_bytes().to_vec()),
            NodeKey::Dilithium3(_) => None,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// 檢查密鑰文件是否存在
///
/// # 返回
///
/// - `true`: 該算法所需的所有文件都存在
/// - `false`: 至少有一個文件不存在
pub fn keystore_exists(base_path: &Path, algorithm: SignatureAlgorithm) -> bool {
    match algorithm {
        SignatureAlgorithm::Dilithium3 => {
            base_path.join(PUBLIC_KEY_FILE).exists() && base_path.join(SECRET_KEY_FILE).exists()
        }
        SignatureAlgorithm::HmacSha256 => base_path.join(HMAC_KEY_FILE).exists(),
    }
}

/// 讀取對等節點的 HMAC 共享密鑰文件
pub fn read_shared_key(path: &Path) -> Result<Vec<u8>> {
    read_key_file(path)
}

fn read_key_file(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(IntegrityError::Config(format!("Key file not found: {:?}", path)));
    }
    fs::read(path)
        .map_err(|e| IntegrityError::Config(format!("Failed to read key from {:?}: {}", path, e)))
}

fn write_key_file(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    fs::write(path, bytes)
        .map_err(|e| IntegrityError::Config(format!("Failed to write key to {:?}: {}", path, e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = fs::metadata(path)
            .map_err(|e| IntegrityError::Config(format!("Failed to read key metadata: {}", e)))?
            .permissions();
        perms.set_mode(mode);
        fs::set_permissions(path, perms).map_err(|e| {
            IntegrityError::Config(format!("Failed to set key permissions on {:?}: {}", path, e))
        })?;
        info!("Key file {:?} permissions set to {:o}", path, mode);
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        warn!("File permissions not set (non-Unix system). Ensure key security manually!");
    }

    Ok(())
}

fn check_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Ok(meta) = fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode != 0o600 {
                warn!(
                    "WARNING: Key file has insecure permissions: {:o} (should be 0o600)",
                    mode
                );
                warn!("Run: chmod 600 {:?}", path);
            }
        }
    }

    #[cfg(not(unix))]
    let _ = path;
}
