//! veilbox-keytool: device key management and file encryption from the shell.
//!
//! # Usage
//!
//! ```bash
//! veilbox-keytool init --device 0192...
//! veilbox-keytool publish --user 0191... --device 0192...
//! veilbox-keytool fingerprint --device 0192... --peer-key BASE64 --context session-42
//! veilbox-keytool encrypt --kind audio --input clip.opus --peer-key BASE64 > clip.json
//! veilbox-keytool decrypt --device 0192... --metadata clip.json --output clip.opus
//! ```

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use veilbox_crypto::config::VeilboxConfig;
use veilbox_crypto::media::MediaKind;
use veilbox_shared::ids::{DeviceId, UserId};

/// Veilbox device key tool
#[derive(Parser, Debug)]
#[command(name = "veilbox-keytool")]
#[command(about = "Manage device keys and encrypt media for Veilbox peers")]
#[command(version)]
struct Cli {
    /// Path to veilbox.toml (overrides VEILBOX_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision the device keypair and check it is consistent
    Init {
        /// Device to provision; a new id is generated when omitted
        #[arg(long)]
        device: Option<DeviceId>,
    },
    /// Publish the device public key to the key directory
    Publish {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        device: DeviceId,
    },
    /// Show the SAS emoji sequence shared with a peer
    Fingerprint {
        #[arg(long)]
        device: DeviceId,
        /// Peer public key, standard base64
        #[arg(long)]
        peer_key: String,
        /// Session context mixed into the sequence
        #[arg(long)]
        context: Option<String>,
    },
    /// Encrypt text or a media file; prints metadata JSON
    Encrypt {
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Text to encrypt (text) or file to read (audio, video)
        #[arg(long)]
        input: String,
        /// Recipient public key, standard base64
        #[arg(long, conflicts_with = "peer_user")]
        peer_key: Option<String>,
        /// Recipient user; their latest key is fetched from the directory
        #[arg(long, requires = "user")]
        peer_user: Option<UserId>,
        /// Requesting user for directory lookups
        #[arg(long)]
        user: Option<UserId>,
    },
    /// Decrypt metadata produced by `encrypt`
    Decrypt {
        #[arg(long)]
        device: DeviceId,
        /// Metadata JSON file
        #[arg(long)]
        metadata: String,
        /// Destination for audio and video; text goes to stdout
        #[arg(long)]
        output: Option<String>,
    },
    /// Destroy the device keypair
    Reset {
        #[arg(long)]
        device: DeviceId,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Text,
    Audio,
    Video,
}

impl From<KindArg> for MediaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Text => MediaKind::Text,
            KindArg::Audio => MediaKind::Audio,
            KindArg::Video => MediaKind::Video,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => VeilboxConfig::load_from(Some(path))?,
        None => VeilboxConfig::load()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let ctx = commands::Context::from_env(config);
    match cli.command {
        Command::Init { device } => {
            let report = commands::init(&ctx, device.unwrap_or_else(DeviceId::new))?;
            println!("device:     {}", report.device);
            println!("public key: {}", report.public_key.to_base64());
            println!("status:     {:?}", report.provisioning);
        }
        Command::Publish { user, device } => {
            let record = commands::publish(&ctx, user, device).await?;
            println!("published record {} at {}", record.record_id, record.created_at);
        }
        Command::Fingerprint {
            device,
            peer_key,
            context,
        } => {
            let sas = commands::fingerprint(&ctx, device, &peer_key, context.as_deref())?;
            println!("{}", sas.to_display_string());
            println!("key fingerprint: {}", sas.key_fingerprint());
        }
        Command::Encrypt {
            kind,
            input,
            peer_key,
            peer_user,
            user,
        } => {
            let recipient = match (peer_key, peer_user, user) {
                (Some(key), _, _) => commands::RecipientArg::Key(key),
                (None, Some(peer), Some(user)) => commands::RecipientArg::Directory { user, peer },
                _ => return Err("either --peer-key or --peer-user with --user is required".into()),
            };
            let metadata = commands::encrypt(&ctx, kind.into(), &input, recipient).await?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::Decrypt {
            device,
            metadata,
            output,
        } => match commands::decrypt(&ctx, device, &metadata, output.as_deref()).await? {
            commands::Decrypted::Text(text) => println!("{}", text.as_str()),
            commands::Decrypted::File { path, bytes } => {
                println!("wrote {bytes} bytes to {}", path.display())
            }
        },
        Command::Reset { device } => {
            if commands::reset(&ctx, device)? {
                println!("device {device} keypair destroyed");
            } else {
                println!("device {device} had no keypair");
            }
        }
    }

    Ok(())
}
