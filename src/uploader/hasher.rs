// 内容指纹计算
//
// SHA-256 十六进制取前 16 位，作为上游去重 / 缓存键
// 同一内容总是得到同一指纹

use crate::uploader::asset::Asset;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 指纹长度（十六进制字符数）
pub const FINGERPRINT_LEN: usize = 16;

/// 内容指纹计算器
pub struct ContentHasher;

impl ContentHasher {
    /// 计算内存中资源的指纹
    pub fn fingerprint(asset: &Asset) -> String {
        Self::fingerprint_bytes(&asset.data)
    }

    pub fn fingerprint_bytes(data: &[u8]) -> String {
        let digest = Sha256::digest(data);
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        hex
    }

    /// 计算本地文件的指纹
    ///
    /// 文件 I/O 放到阻塞线程池执行，不占用异步运行时
    pub async fn fingerprint_file(path: &Path) -> Result<String> {
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || Self::fingerprint_file_sync(&path))
            .await
            .context("计算指纹任务执行失败")?
    }

    fn fingerprint_file_sync(path: &Path) -> Result<String> {
        let file = std::fs::File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);

        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 65536]; // 64KB 缓冲区
        let mut total: u64 = 0;

        loop {
            let bytes_read = reader.read(&mut buffer).context("读取文件失败")?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            total += bytes_read as u64;
        }

        let mut hex = hex::encode(hasher.finalize());
        hex.truncate(FINGERPRINT_LEN);

        debug!("文件指纹计算完成: path={:?}, size={}, hash={}", path, total, hex);
        Ok(hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Asset::new("a.jpg", "image/jpeg", b"same bytes".to_vec());
        let b = Asset::new("b.png", "image/png", b"same bytes".to_vec());
        let c = Asset::new("a.jpg", "image/jpeg", b"other bytes".to_vec());

        let fa = ContentHasher::fingerprint(&a);
        assert_eq!(fa.len(), FINGERPRINT_LEN);
        // 只与内容有关，与文件名无关
        assert_eq!(fa, ContentHasher::fingerprint(&b));
        assert_ne!(fa, ContentHasher::fingerprint(&c));
    }

    #[test]
    fn test_known_digest_prefix() {
        // sha256("abc") = ba7816bf8f01cfea...
        assert_eq!(ContentHasher::fingerprint_bytes(b"abc"), "ba7816bf8f01cfea");
    }

    #[tokio::test]
    async fn test_fingerprint_file_matches_memory() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let content = vec![42u8; 200 * 1024];
        temp_file.write_all(&content).unwrap();
        temp_file.flush().unwrap();

        let from_file = ContentHasher::fingerprint_file(temp_file.path()).await.unwrap();
        assert_eq!(from_file, ContentHasher::fingerprint_bytes(&content));
    }

    #[tokio::test]
    async fn test_fingerprint_nonexistent_file() {
        let result = ContentHasher::fingerprint_file(Path::new("/nonexistent/file.bin")).await;
        assert!(result.is_err());
    }
}
