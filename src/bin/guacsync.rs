//! Offline tools for working with machine notes. Makes no remote calls.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use guacsync::config::Config;
use guacsync::core::directive::{parse_annotation, USERNAME};
use guacsync::core::machine::{MachineId, MachineRecord, PowerState};
use guacsync::core::plan::SkippedRecord;
use guacsync::core::spec::{build_specs, BuildWarning, DesiredConnectionSpec, MachineContext};
use guacsync::crypto::SecretCodec;
use guacsync::network::{Confidence, MacAddress, MachineLocation};
use guacsync::{logging, sync};
use serde::Serialize;
use std::env;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the configured encryption key.
const KEY_VARIABLE: &str = "GUACSYNC_KEY";

/// Inspect and prepare credential directives in machine notes.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.config/guacsync/config.yaml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Checks that the encryption key is usable
    CheckKey,

    /// Encrypts a secret the way it is stored in notes
    Encrypt { plaintext: String },

    /// Decrypts a secret stored in notes
    Decrypt { token: String },

    /// Prints a notes file with every plaintext secret encrypted
    Migrate { file: PathBuf },

    /// Prints the connections a notes file describes
    Specs {
        file: PathBuf,

        /// Machine name
        #[arg(long)]
        name: String,

        /// Machine ID on its node
        #[arg(long)]
        vmid: u32,

        /// Node that hosts the machine
        #[arg(long)]
        node: String,

        /// The machine's address, if known
        #[arg(long)]
        ip: Option<Ipv4Addr>,

        /// The machine's hardware address, if known
        #[arg(long)]
        mac: Option<MacAddress>,
    },
}

#[derive(Serialize)]
struct SpecsOutput {
    specs: Vec<DesiredConnectionSpec>,
    warnings: Vec<String>,
    skipped: Vec<SkippedRecord>,
}

fn main() -> anyhow::Result<()> {
    logging::init("warn");
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckKey => {
            let codec = codec(&config)?;
            if !codec.has_key() {
                bail!("no encryption key is configured; set encryption_key or {KEY_VARIABLE}");
            }
            println!("The encryption key is usable.");
        }
        Commands::Encrypt { plaintext } => println!("{}", keyed_codec(&config)?.encrypt(&plaintext)?),
        Commands::Decrypt { token } => println!("{}", keyed_codec(&config)?.decrypt(&token)?),
        Commands::Migrate { file } => {
            let text = read(&file)?;
            let migrated = keyed_codec(&config)?
                .migrate_annotation(&parse_annotation(&text))?
                .unwrap_or(text);
            print!("{migrated}");
        }
        Commands::Specs {
            file,
            name,
            vmid,
            node,
            ip,
            mac,
        } => {
            let codec = codec(&config)?;
            let annotation = parse_annotation(&read(&file)?);
            let machine = MachineRecord {
                id: MachineId::new(node, vmid),
                name,
                power: PowerState::Unknown,
                hardware_addresses: mac.iter().map(ToString::to_string).collect(),
            };
            let location = match ip {
                Some(ip) => MachineLocation::found(ip, Confidence::AgentReported, mac),
                None => MachineLocation::unresolved(mac),
            };
            let hostname = sync::controller_hostname(config.sync.hostname.as_deref());
            let context = MachineContext {
                machine: &machine,
                location: &location,
                controller_hostname: &hostname,
                default_template: annotation.default_template.as_deref(),
            };

            let mut output = SpecsOutput {
                specs: Vec::new(),
                warnings: annotation.warnings.iter().map(ToString::to_string).collect(),
                skipped: Vec::new(),
            };
            for record in annotation.records.iter() {
                match build_specs(record, &context, &codec) {
                    Ok(batch) => {
                        output.specs.extend(batch.specs);
                        output.warnings.extend(batch.warnings.iter().map(
                            |BuildWarning { line, message }| format!("line {line}: {message}"),
                        ));
                    }
                    Err(e) => output.skipped.push(SkippedRecord {
                        line: record.span().line,
                        username: record.get(USERNAME).map(str::to_string),
                        reason: e.to_string(),
                    }),
                }
            }
            print!("{}", serde_yaml::to_string(&output)?);
        }
    }
    Ok(())
}

// An explicit path must exist. The default path is optional.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => match Config::default_path() {
            Some(path) if path.exists() => Config::load(path)?,
            _ => Config::default(),
        },
    };
    if let Ok(key) = env::var(KEY_VARIABLE) {
        config.encryption_key = Some(key);
    }
    Ok(config)
}

fn codec(config: &Config) -> anyhow::Result<SecretCodec> {
    SecretCodec::new(config.encryption_key.as_deref()).context("the encryption key is unusable")
}

fn keyed_codec(config: &Config) -> anyhow::Result<SecretCodec> {
    let codec = codec(config)?;
    if !codec.has_key() {
        return Err(anyhow!(
            "this command needs an encryption key; set encryption_key or {KEY_VARIABLE}"
        ));
    }
    Ok(codec)
}

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
