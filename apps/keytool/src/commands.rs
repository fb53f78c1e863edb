use std::path::{Path, PathBuf};
use std::sync::Arc;

use zeroize::Zeroizing;

use veilbox_crypto::config::VeilboxConfig;
use veilbox_crypto::device_keys::{legacy_sources, DeviceKeyStore, KeyConsistency, KeyProvisioning};
use veilbox_crypto::directory::{HttpKeyDirectory, KeyDirectoryClient, PublicKeyRecord};
use veilbox_crypto::error::CryptoError;
use veilbox_crypto::media::{MediaAdapter, MediaKind, MediaMetadata, ObjectBlobStore, Recipient, TextAdapter};
use veilbox_crypto::primitives::PublicKey;
use veilbox_crypto::sas::{self, SasFingerprint};
use veilbox_crypto::storage::unlock::{generate_salt, open_key_database, Unlock, KEYCHAIN_SERVICE};
use veilbox_shared::ids::{DeviceId, UserId};

/// Env var holding the key database passphrase. Unset means the OS keychain.
pub const PASSPHRASE_ENV: &str = "VEILBOX_DB_PASSPHRASE";

/// Loaded configuration plus how to unlock the key database.
pub struct Context {
    pub config: VeilboxConfig,
    pub passphrase: Option<Zeroizing<String>>,
}

impl Context {
    pub fn from_env(config: VeilboxConfig) -> Self {
        Self {
            config,
            passphrase: std::env::var(PASSPHRASE_ENV).ok().map(Zeroizing::new),
        }
    }

    fn key_store(&self) -> Result<DeviceKeyStore, CryptoError> {
        let path = Path::new(&self.config.key_db_path);
        match &self.passphrase {
            Some(passphrase) => {
                let salt = load_or_create_salt(&salt_path(path))?;
                let db = open_key_database(
                    path,
                    Unlock::Passphrase {
                        passphrase: passphrase.as_str(),
                        salt: &salt,
                    },
                )?;
                Ok(DeviceKeyStore::new(db))
            }
            None => {
                let db = open_key_database(path, Unlock::Keychain)?;
                Ok(DeviceKeyStore::with_legacy_sources(
                    db,
                    legacy_sources(Some(KEYCHAIN_SERVICE)),
                ))
            }
        }
    }

    fn directory(&self, user: UserId) -> Result<KeyDirectoryClient, CryptoError> {
        let url = self
            .config
            .directory_url
            .as_deref()
            .ok_or_else(|| CryptoError::ConfigError("directory_url is not set".into()))?;
        Ok(KeyDirectoryClient::new(Arc::new(HttpKeyDirectory::new(url)?), user))
    }

    fn media_adapter(&self, kind: MediaKind) -> Result<MediaAdapter, CryptoError> {
        let blobs = Arc::new(ObjectBlobStore::from_config(&self.config.blob)?);
        let adapter = match kind {
            MediaKind::Audio => MediaAdapter::audio(blobs),
            MediaKind::Video => MediaAdapter::video(blobs),
            MediaKind::Text => {
                return Err(CryptoError::ConfigError("text has no media adapter".into()));
            }
        };
        Ok(adapter.with_config(&self.config.media, self.config.blob.naming))
    }
}

/// `<db>.salt` next to the key database.
fn salt_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".salt");
    PathBuf::from(name)
}

fn load_or_create_salt(path: &Path) -> Result<Vec<u8>, CryptoError> {
    match std::fs::read(path) {
        Ok(salt) => Ok(salt),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let salt = generate_salt()?;
            std::fs::write(path, salt)?;
            tracing::info!(path = %path.display(), "created key database salt");
            Ok(salt.to_vec())
        }
        Err(e) => Err(e.into()),
    }
}

pub struct InitReport {
    pub device: DeviceId,
    pub public_key: PublicKey,
    pub provisioning: KeyProvisioning,
}

pub fn init(ctx: &Context, device: DeviceId) -> Result<InitReport, CryptoError> {
    let store = ctx.key_store()?;
    let (pair, provisioning) = store.get_or_create_key_pair_with_outcome(&device)?;
    if let KeyConsistency::Mismatch { .. } = store.verify_consistency(&device)? {
        return Err(CryptoError::InvalidKey(format!(
            "stored keypair for device {device} is inconsistent; run reset"
        )));
    }
    Ok(InitReport {
        device,
        public_key: pair.public,
        provisioning,
    })
}

pub async fn publish(ctx: &Context, user: UserId, device: DeviceId) -> Result<PublicKeyRecord, CryptoError> {
    let store = ctx.key_store()?;
    ctx.directory(user)?.publish_device_key(&store, &device).await
}

pub fn fingerprint(
    ctx: &Context,
    device: DeviceId,
    peer_key: &str,
    session_context: Option<&str>,
) -> Result<SasFingerprint, CryptoError> {
    let peer = PublicKey::from_base64(peer_key)?;
    let own = ctx.key_store()?.public_key(&device)?;
    sas::derive_fingerprint_with_length(&own, &peer, session_context, ctx.config.sas_symbols)
}

/// Who `encrypt` seals to.
pub enum RecipientArg {
    Key(String),
    Directory { user: UserId, peer: UserId },
}

pub async fn encrypt(
    ctx: &Context,
    kind: MediaKind,
    input: &str,
    recipient: RecipientArg,
) -> Result<MediaMetadata, CryptoError> {
    let recipient = match recipient {
        RecipientArg::Key(key) => Recipient::from(PublicKey::from_base64(&key)?),
        RecipientArg::Directory { user, peer } => {
            let record = ctx.directory(user)?.fetch_latest(&peer).await?;
            tracing::info!(peer = %peer, record_id = %record.record_id, "using latest directory key");
            Recipient::from(&record)
        }
    };
    match kind {
        MediaKind::Text => TextAdapter::encrypt(input, recipient),
        _ => {
            ctx.media_adapter(kind)?
                .encrypt_file(Path::new(input), recipient)
                .await
        }
    }
}

pub enum Decrypted {
    Text(Zeroizing<String>),
    File { path: PathBuf, bytes: u64 },
}

pub async fn decrypt(
    ctx: &Context,
    device: DeviceId,
    metadata_path: &str,
    output: Option<&str>,
) -> Result<Decrypted, CryptoError> {
    let metadata: MediaMetadata = serde_json::from_str(&std::fs::read_to_string(metadata_path)?)?;
    let pair = ctx.key_store()?.key_pair(&device)?;
    match metadata.kind {
        MediaKind::Text => Ok(Decrypted::Text(TextAdapter::decrypt(&metadata, &pair.secret)?)),
        kind => {
            let path = output
                .map(PathBuf::from)
                .ok_or_else(|| CryptoError::ConfigError(format!("--output is required for {kind}")))?;
            let bytes = ctx
                .media_adapter(kind)?
                .decrypt_to_file(&metadata, &pair.secret, &path)
                .await?;
            Ok(Decrypted::File { path, bytes })
        }
    }
}

pub fn reset(ctx: &Context, device: DeviceId) -> Result<bool, CryptoError> {
    ctx.key_store()?.reset_device(&device)
}
