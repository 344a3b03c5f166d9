use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sadnp_core::codec::encode_session_keys;
use sadnp_core::crypto::{CryptoProvider, KeyWrapAlgorithm, SoftwareCrypto};
use sadnp_core::objects::{AuthObject, SessionKeyChange};
use sadnp_core::store::FileStore;
use std::path::PathBuf;

/// sadnp tools - provisioning and diagnostics for secure authentication
#[derive(Parser)]
#[command(name = "sadnp-tools")]
#[command(about = "Provisioning and diagnostic tools for DNP3 secure authentication")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a random update key
    Keygen {
        /// Key wrap algorithm the key will be used with
        #[arg(long, default_value = "aes128")]
        key_wrap: String,
    },

    /// Build the g120v6 wrapped key data for a session key change
    WrapKeys {
        /// Update key as hex
        #[arg(long)]
        update_key: String,

        /// Control-direction session key as hex
        #[arg(long)]
        control: String,

        /// Monitor-direction session key as hex
        #[arg(long)]
        monitor: String,

        /// Challenge data from the outstation's key status, hex
        #[arg(long)]
        challenge: String,

        /// Key change sequence number
        #[arg(long)]
        ksq: u32,

        /// User number
        #[arg(long, default_value_t = 1)]
        user: u16,
    },

    /// Decode a Group 120 object from hex
    Decode {
        /// Object variation (1..=13)
        #[arg(long)]
        variation: u8,

        /// Object data as hex
        #[arg(long)]
        data: String,
    },

    /// Export persisted security statistics as JSON
    Stats {
        /// Statistics store file
        #[arg(long)]
        store: PathBuf,
    },
}

fn key_wrap_from_name(name: &str) -> anyhow::Result<KeyWrapAlgorithm> {
    match name.to_ascii_lowercase().as_str() {
        "aes128" => Ok(KeyWrapAlgorithm::Aes128),
        "aes256" => Ok(KeyWrapAlgorithm::Aes256),
        other => bail!("unknown key wrap algorithm: {}", other),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let crypto = SoftwareCrypto::new();

    match cli.command {
        Commands::Keygen { key_wrap } => {
            let algorithm = key_wrap_from_name(&key_wrap)?;
            let mut key = vec![0u8; algorithm.key_len()];
            crypto
                .fill_random(&mut key)
                .context("random generation failed")?;
            println!("{}", hex::encode(&key));
        }

        Commands::WrapKeys {
            update_key,
            control,
            monitor,
            challenge,
            ksq,
            user,
        } => {
            let update_key = hex::decode(&update_key).context("invalid update key hex")?;
            let control = hex::decode(&control).context("invalid control key hex")?;
            let monitor = hex::decode(&monitor).context("invalid monitor key hex")?;
            let challenge = hex::decode(&challenge).context("invalid challenge hex")?;
            let algorithm = match update_key.len() {
                16 => KeyWrapAlgorithm::Aes128,
                32 => KeyWrapAlgorithm::Aes256,
                n => bail!("update key must be 16 or 32 octets, got {}", n),
            };
            let blob = encode_session_keys(&control, &monitor, &challenge)?;
            let wrapped = crypto.wrap_key(algorithm, &update_key, &blob)?;
            let change = SessionKeyChange {
                ksq,
                user,
                wrapped_key_data: wrapped,
            };
            println!("{}", hex::encode(change.serialize()?));
        }

        Commands::Decode { variation, data } => {
            let bytes = hex::decode(&data).context("invalid object hex")?;
            let object = AuthObject::deserialize(variation, &bytes)?;
            println!("{:#?}", object);
        }

        Commands::Stats { store } => {
            let mut store = FileStore::new(store);
            let records = store.snapshot()?;
            let entries: Vec<serde_json::Value> = records
                .into_iter()
                .map(|(session, stat, value)| {
                    serde_json::json!({
                        "association": session,
                        "statistic": format!("{:?}", stat),
                        "value": value,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}
