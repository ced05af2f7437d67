use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ring::rand::SystemRandom;
use ring::signature::{KeyPair, RsaKeyPair, RSA_PKCS1_SHA256};
use zip::{ZipArchive, ZipWriter, FileOptions};

/// Out-of-scope collaborator: assembles a signed plugin package.
/// The daemon only ever consumes already-signed blobs; this tool lives
/// outside the daemon's process and is kept deliberately thin.
#[derive(Parser)]
#[command(name = "plugind-signer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign a plugin package zip with a PKCS#8 RSA private key.
    Sign {
        #[arg(short, long)]
        plugin: PathBuf,
        #[arg(short = 'k', long)]
        private_key: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Generate a new RSA key pair for signing.
    GenerateKey {
        #[arg(short = 'p', long)]
        private_key: PathBuf,
        #[arg(short = 'u', long)]
        public_key: PathBuf,
    },
}

const SIGNATURE_ENTRY: &str = "META-INF/SIGNATURE.RSA";

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Sign { plugin, private_key, output } => sign_plugin(plugin, private_key, output),
        Commands::GenerateKey { private_key, public_key } => generate_key_pair(private_key, public_key),
    }
}

fn sign_plugin(plugin_path: &Path, private_key_path: &Path, output_path: &Path) -> Result<()> {
    let private_key_data = std::fs::read(private_key_path)
        .with_context(|| format!("reading private key {private_key_path:?}"))?;
    let key_pair = RsaKeyPair::from_pkcs8(&private_key_data).context("invalid PKCS#8 private key")?;

    let mut archive =
        ZipArchive::new(File::open(plugin_path).with_context(|| format!("opening plugin {plugin_path:?}"))?)
            .context("reading plugin zip")?;

    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        if name == SIGNATURE_ENTRY {
            continue;
        }
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;
        entries.push((name, content));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut message = Vec::new();
    for (name, content) in &entries {
        message.extend_from_slice(name.as_bytes());
        message.extend_from_slice(b"|");
        message.extend_from_slice(content.len().to_string().as_bytes());
        message.extend_from_slice(b"|");
        message.extend_from_slice(content);
    }

    let rng = SystemRandom::new();
    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(&RSA_PKCS1_SHA256, &rng, &message, &mut signature)
        .context("signing package manifest")?;

    let mut writer = ZipWriter::new(File::create(output_path).with_context(|| format!("creating {output_path:?}"))?);
    for (name, content) in &entries {
        writer.start_file(name, FileOptions::default())?;
        writer.write_all(content)?;
    }
    let signature_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &signature);
    writer.start_file(SIGNATURE_ENTRY, FileOptions::default())?;
    writer.write_all(signature_b64.as_bytes())?;
    writer.finish().context("finalizing signed package")?;

    println!("signed {plugin_path:?} -> {output_path:?}");
    Ok(())
}

fn generate_key_pair(private_key_path: &Path, public_key_path: &Path) -> Result<()> {
    // ring has no built-in RSA keygen; a real release build would shell out to
    // openssl or depend on rsa+rand for this. Left unimplemented until the
    // daemon actually needs to mint test keys itself.
    anyhow::bail!(
        "key generation is not implemented; provide a PKCS#8 private key at {:?} (public key would go to {:?})",
        private_key_path,
        public_key_path
    )
}
