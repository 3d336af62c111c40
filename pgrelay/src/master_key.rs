//! The master key: `~/.pgrelay/master.key`, base64, used as an AES-256-CBC
//! key to decrypt the `password` field of every credential table at load
//! time.
//!
//! `sqlx_core`'s own config loading never needs a directory/file mode
//! discipline like this — it never stores secrets at rest — but a 32-byte
//! AES key sitting in a dotfile does, so `0700`/`0600` permissions are
//! enforced before the key is ever read.

use std::path::{Path, PathBuf};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

#[derive(Clone)]
pub struct MasterKey(pub [u8; KEY_LEN]);

/// Default location, `~/.pgrelay/master.key`.
pub fn default_path() -> Result<PathBuf> {
    let home = dirs_home().context("could not determine home directory for the master key")?;
    Ok(home.join(".pgrelay").join("master.key"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Loads and validates the master key file: dir mode `0700`, file mode
/// `0600`; decode failure is fatal at load.
pub fn load(path: &Path) -> Result<MasterKey> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(dir) = path.parent() {
            let dir_meta = std::fs::metadata(dir)
                .with_context(|| format!("reading master key directory {}", dir.display()))?;
            if dir_meta.permissions().mode() & 0o777 != 0o700 {
                bail!(
                    "master key directory {} must be mode 0700 (found {:o})",
                    dir.display(),
                    dir_meta.permissions().mode() & 0o777
                );
            }
        }
        let file_meta = std::fs::metadata(path)
            .with_context(|| format!("reading master key file {}", path.display()))?;
        if file_meta.permissions().mode() & 0o777 != 0o600 {
            bail!(
                "master key file {} must be mode 0600 (found {:o})",
                path.display(),
                file_meta.permissions().mode() & 0o777
            );
        }
    }

    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("reading master key file {}", path.display()))?;
    let decoded = BASE64
        .decode(encoded.trim())
        .context("master key file did not contain valid base64")?;
    let key: [u8; KEY_LEN] = decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("master key must decode to exactly {KEY_LEN} bytes"))?;
    Ok(MasterKey(key))
}

/// Writes a freshly generated master key to `path`, creating the parent
/// directory at mode `0700` and the file at mode `0600` (used by the
/// `pgrelay master-key` administrative key-generation entry point).
pub fn generate(path: &Path) -> Result<MasterKey> {
    use rand::RngCore;
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    std::fs::write(path, BASE64.encode(key))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(MasterKey(key))
}

/// AES-256-CBC encrypt, `iv || ciphertext`: a random IV prepended to the
/// ciphertext, both base64-encoded together at rest.
pub fn encrypt(key: &MasterKey, plaintext: &str) -> Result<String> {
    use rand::RngCore;
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut buf = vec![0u8; plaintext.len() + 16];
    let ciphertext = Aes256CbcEnc::new(&key.0.into(), &iv.into())
        .encrypt_padded_b2b_mut::<Pkcs7>(plaintext.as_bytes(), &mut buf)
        .map_err(|e| anyhow::anyhow!("AES-256-CBC encryption failed: {e}"))?;

    let mut envelope = Vec::with_capacity(IV_LEN + ciphertext.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(ciphertext);
    Ok(BASE64.encode(envelope))
}

/// Decrypts a `password` field previously produced by [`encrypt`].
/// Decryption failure is fatal at config-load time.
pub fn decrypt(key: &MasterKey, encoded: &str) -> Result<String> {
    let envelope = BASE64
        .decode(encoded)
        .context("credential field was not valid base64")?;
    if envelope.len() < IV_LEN {
        bail!("encrypted credential shorter than one IV");
    }
    let (iv, ciphertext) = envelope.split_at(IV_LEN);
    let mut buf = ciphertext.to_vec();
    let plaintext = Aes256CbcDec::new(key.0.as_slice().into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| anyhow::anyhow!("AES-256-CBC decryption failed (wrong master key?): {e}"))?;
    String::from_utf8(plaintext.to_vec()).context("decrypted credential was not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let mut raw = [0u8; KEY_LEN];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        let key = MasterKey(raw);
        let encrypted = encrypt(&key, "s3cret!").unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();
        assert_eq!(decrypted, "s3cret!");
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let key = MasterKey([7u8; KEY_LEN]);
        assert!(decrypt(&key, "not even base64!!").is_err());
    }
}
