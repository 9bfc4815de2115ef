//! 解密 token 与加密分片还原.
//!
//! 服务端可对文件头部一小段 (至多 16 KiB) 做 AES-128-CBC 加密,
//! 并通过 base64 token 下发范围与密钥. 会话在该范围数据齐全后
//! 原地解密, 解密后的明文才进入内存窗口与磁盘缓存.

use aes::Aes128;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cbc::Decryptor;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use log::warn;

use chuan_core::{ChuanError, ChuanResult};

/// token 固定布局长度: u32 + u32 + 16 + 16 + u32
const TOKEN_RAW_LEN: usize = 44;

/// 服务端加密范围上限
const MAX_ENCRYPTED_LEN: u32 = 20 * 1024;

/// 加密算法类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherType {
    None,
    Aes128Cbc,
}

/// 解密 token: 加密范围与密钥材料
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub range_start: u32,
    pub range_stop: u32,
    pub iv: [u8; 16],
    pub key: [u8; 16],
    pub cipher_type: CipherType,
}

impl TokenInfo {
    /// 从 base64 token 解析, 布局为小端定长结构
    pub fn parse(token: &str) -> ChuanResult<TokenInfo> {
        if token.is_empty() {
            return Err(ChuanError::InvalidArgument("token 为空".to_string()));
        }
        let raw = STANDARD
            .decode(token)
            .map_err(|e| ChuanError::InvalidArgument(format!("token base64 解码失败: {e}")))?;
        if raw.len() != TOKEN_RAW_LEN {
            return Err(ChuanError::InvalidArgument(format!(
                "token 长度错误: {} != {TOKEN_RAW_LEN}",
                raw.len()
            )));
        }

        let range_start = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let range_stop = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&raw[8..24]);
        let mut key = [0u8; 16];
        key.copy_from_slice(&raw[24..40]);
        let cipher_type = match u32::from_le_bytes(raw[40..44].try_into().unwrap()) {
            0 => CipherType::None,
            _ => CipherType::Aes128Cbc,
        };

        let info = TokenInfo {
            range_start,
            range_stop,
            iv,
            key,
            cipher_type,
        };
        if info.cipher_type != CipherType::None && !info.range_is_valid() {
            warn!(
                "token 加密范围非法: [{}, {})",
                info.range_start, info.range_stop
            );
            return Err(ChuanError::InvalidArgument(format!(
                "token 加密范围非法: [{}, {})",
                info.range_start, info.range_stop
            )));
        }
        Ok(info)
    }

    /// 加密范围长度
    pub fn encrypted_len(&self) -> u32 {
        self.range_stop.saturating_sub(self.range_start)
    }

    /// 是否确实携带加密数据
    pub fn is_active(&self) -> bool {
        self.cipher_type != CipherType::None && self.encrypted_len() > 0
    }

    fn range_is_valid(&self) -> bool {
        let len = self.encrypted_len();
        len > 0 && len < MAX_ENCRYPTED_LEN && len % 16 == 0
    }

    /// 原地解密整个加密范围, `buf` 长度必须等于范围长度
    pub fn decrypt(&self, buf: &mut [u8]) -> ChuanResult<()> {
        if self.cipher_type == CipherType::None {
            return Ok(());
        }
        if buf.len() != self.encrypted_len() as usize {
            return Err(ChuanError::InvalidArgument(format!(
                "解密缓冲长度 {} 与加密范围 {} 不一致",
                buf.len(),
                self.encrypted_len()
            )));
        }
        let decryptor = Decryptor::<Aes128>::new((&self.key).into(), (&self.iv).into());
        decryptor
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|e| ChuanError::PoisonedData(format!("AES-128-CBC 解密失败: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use cbc::Encryptor;

    fn build_token(range_start: u32, range_stop: u32, cipher_type: u32) -> String {
        let mut raw = Vec::with_capacity(TOKEN_RAW_LEN);
        raw.extend_from_slice(&range_start.to_le_bytes());
        raw.extend_from_slice(&range_stop.to_le_bytes());
        raw.extend_from_slice(&[0x11u8; 16]);
        raw.extend_from_slice(&[0x22u8; 16]);
        raw.extend_from_slice(&cipher_type.to_le_bytes());
        STANDARD.encode(raw)
    }

    #[test]
    fn parse_round_trip() {
        let token = build_token(0, 4096, 1);
        let info = TokenInfo::parse(&token).unwrap();
        assert_eq!(info.range_start, 0);
        assert_eq!(info.range_stop, 4096);
        assert_eq!(info.cipher_type, CipherType::Aes128Cbc);
        assert_eq!(info.iv, [0x11u8; 16]);
        assert_eq!(info.key, [0x22u8; 16]);
        assert!(info.is_active());
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(TokenInfo::parse("").is_err());
        assert!(TokenInfo::parse("not-base64!!!").is_err());
        // 长度不足
        let short = STANDARD.encode([0u8; 10]);
        assert!(TokenInfo::parse(&short).is_err());
        // 范围未对齐 16 字节
        let unaligned = build_token(0, 100, 1);
        assert!(TokenInfo::parse(&unaligned).is_err());
        // 超过服务端加密上限
        let oversized = build_token(0, 64 * 1024, 1);
        assert!(TokenInfo::parse(&oversized).is_err());
    }

    #[test]
    fn cipher_none_is_pass_through() {
        let token = build_token(0, 0, 0);
        let info = TokenInfo::parse(&token).unwrap();
        assert!(!info.is_active());
        let mut data = vec![7u8; 32];
        info.decrypt(&mut data).unwrap();
        assert_eq!(data, vec![7u8; 32]);
    }

    #[test]
    fn decrypt_recovers_plaintext() {
        let token = build_token(0, 32, 1);
        let info = TokenInfo::parse(&token).unwrap();

        let plain = [0xabu8; 32];
        let mut cipher_buf = plain;
        let encryptor = Encryptor::<Aes128>::new((&info.key).into(), (&info.iv).into());
        encryptor
            .encrypt_padded_mut::<NoPadding>(&mut cipher_buf, 32)
            .unwrap();
        assert_ne!(cipher_buf, plain);

        info.decrypt(&mut cipher_buf).unwrap();
        assert_eq!(cipher_buf, plain);
    }

    #[test]
    fn decrypt_checks_length() {
        let token = build_token(0, 32, 1);
        let info = TokenInfo::parse(&token).unwrap();
        let mut wrong = vec![0u8; 16];
        assert!(info.decrypt(&mut wrong).is_err());
    }
}
