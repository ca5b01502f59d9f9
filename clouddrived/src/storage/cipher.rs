use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use chacha20::{
    ChaCha20, Key, Nonce,
    cipher::{KeyIvInit, StreamCipher, StreamCipherSeek},
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error};

const KEY_PHRASE: &str = "clouddrive at-rest content key";
const NONCE_PHRASE: &str = "clouddrive at-rest content vector";
const BUFFER_SIZE: usize = 64 * 1024;
const SCRATCH_SUFFIX: &str = "cipher-scratch";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CipherError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| CipherError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

pub trait KeyProvider: Send + Sync {
    fn key(&self) -> [u8; 32];
    fn nonce(&self) -> [u8; 12];
}

/// Process-wide key derived from phrases compiled into the binary.
///
/// Every installation shares the same key and nonce, so anyone holding the
/// binary can read the cache and staged uploads. Replace with a provider
/// that loads per-installation material before relying on this for secrecy.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedKeyProvider;

impl KeyProvider for FixedKeyProvider {
    fn key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(KEY_PHRASE.as_bytes()));
        key
    }

    fn nonce(&self) -> [u8; 12] {
        let digest = md5::compute(NONCE_PHRASE.as_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest.0[..12]);
        nonce
    }
}

/// Streams files through an unauthenticated ChaCha20 keystream.
///
/// The cipher is length preserving and needs no padding or final block, so a
/// transformed file always has the length of its input. Decrypting bytes that
/// were never encrypted does not fail; it yields garbage, and integrity is
/// left to content fingerprints.
#[derive(Clone)]
pub struct FileCipher {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl FileCipher {
    pub fn new(provider: &dyn KeyProvider) -> Self {
        Self {
            key: provider.key(),
            nonce: provider.nonce(),
        }
    }

    pub fn global() -> &'static FileCipher {
        static GLOBAL: OnceLock<FileCipher> = OnceLock::new();
        GLOBAL.get_or_init(|| FileCipher::new(&FixedKeyProvider))
    }

    /// Keystream positioned at byte `offset` of a file, for transforming
    /// content chunk by chunk as it arrives.
    pub fn keystream_at(&self, offset: u64) -> Keystream {
        let mut inner = self.keystream();
        inner.seek(offset);
        Keystream { inner }
    }

    pub async fn transform(
        &self,
        source: &Path,
        dest: &Path,
        direction: Direction,
    ) -> Result<u64, CipherError> {
        let result = self.stream(source, dest).await;
        match &result {
            Ok(bytes) => debug!(
                ?direction,
                source = %source.display(),
                dest = %dest.display(),
                bytes,
                "cipher transform finished"
            ),
            Err(err) => error!(?direction, "cipher transform abandoned: {err}"),
        }
        result
    }

    /// Transforms `path` over itself through a scratch copy next to it.
    pub async fn transform_in_place(
        &self,
        path: &Path,
        direction: Direction,
    ) -> Result<u64, CipherError> {
        let scratch = scratch_path(path);
        tokio::fs::copy(path, &scratch)
            .await
            .map_err(CipherError::io(path))?;
        let result = self.transform(&scratch, path, direction).await;
        if let Err(err) = tokio::fs::remove_file(&scratch).await {
            debug!(path = %scratch.display(), "failed to remove cipher scratch file: {err}");
        }
        result
    }

    async fn stream(&self, source: &Path, dest: &Path) -> Result<u64, CipherError> {
        let mut input = tokio::fs::File::open(source)
            .await
            .map_err(CipherError::io(source))?;
        let mut output = tokio::fs::File::create(dest)
            .await
            .map_err(CipherError::io(dest))?;
        let mut keystream = self.keystream();
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let read = input.read(&mut buf).await.map_err(CipherError::io(source))?;
            if read == 0 {
                break;
            }
            keystream.apply_keystream(&mut buf[..read]);
            output
                .write_all(&buf[..read])
                .await
                .map_err(CipherError::io(dest))?;
            total += read as u64;
        }

        output.flush().await.map_err(CipherError::io(dest))?;
        output.sync_all().await.map_err(CipherError::io(dest))?;
        Ok(total)
    }

    fn keystream(&self) -> ChaCha20 {
        ChaCha20::new(Key::from_slice(&self.key), Nonce::from_slice(&self.nonce))
    }
}

pub struct Keystream {
    inner: ChaCha20,
}

impl Keystream {
    pub fn apply(&mut self, chunk: &mut [u8]) {
        self.inner.apply_keystream(chunk);
    }
}

fn scratch_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{SCRATCH_SUFFIX}", std::process::id()));
    path.with_file_name(name)
}
