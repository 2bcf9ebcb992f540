//! SHA-256 輔助函數與規範化 JSON 序列化
//!
//! 快照 ID 的可重現性依賴於規範化序列化：
//! 對象鍵按字典序排序、無多餘空白、字符串按 JSON 標準轉義。
//! 任何審計方對同一個 `snapshot` 塊執行相同步驟都會得到相同的字節序列。

use crate::error::Result;
use crate::types::Digest;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest as _, Sha256};

/// 計算單段數據的 SHA-256
pub fn sha256(data: &[u8]) -> Digest {
    Digest(Sha256::digest(data).into())
}

/// 依序計算多段數據拼接後的 SHA-256（不分配拼接緩衝區）
pub fn sha256_parts(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Digest(hasher.finalize().into())
}

/// 將任意可序列化值轉為規範化 JSON 字符串
///
/// 不依賴 `serde_json` 的 map 實現細節，遞歸地對所有對象鍵排序
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_parts_equals_concatenation() {
        assert_eq!(sha256_parts(&[b"ab", b"c"]), sha256(b"abc"));
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = json!({
            "b": 1,
            "a": { "z": [ { "y": true, "x": null } ], "c": "text" }
        });

        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"c":"text","z":[{"x":null,"y":true}]},"b":1}"#
        );
    }
}
