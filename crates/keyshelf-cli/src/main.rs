//! keyshelf CLI: command-line client for the keyshelf server.
//!
//! Everything secret happens here. The unlock key is built and opened
//! locally from the password and the offline secret key, and only the
//! sealed envelope and public key are sent to the server.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod client;
mod secret_key;

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use keyshelf_core::jwk::PublicJwk;
use keyshelf_core::uuk::{decrypt_with, encrypt_to};
use keyshelf_core::{BuildOptions, Capabilities, Credentials, MemberSpec, MemberUpdateRequest, Uuk};

use crate::client::Client;

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

// ── CLI structure ────────────────────────────────────────────────────

/// keyshelf: end-to-end encrypted secret bundles you can share.
#[derive(Parser)]
#[command(
    name = "keyshelf",
    version,
    about = "keyshelf CLI: build unlock keys locally and share secret bundles",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         KEYSHELF_ADDR          Server address (default: http://127.0.0.1:8300)\n  \
         KEYSHELF_ENTITY_ID     Your entity id\n  \
         KEYSHELF_ENTITY_NAME   Your display name\n  \
         KEYSHELF_PASSWORD      Master password\n\n\
         {DIM}Examples:{RESET}\n  \
         keyshelf secret-key generate --output ~/.keyshelf/secret.key\n  \
         keyshelf uuk build --secret-key-file ~/.keyshelf/secret.key --output uuk.json\n  \
         keyshelf register --uuk uuk.json\n  \
         keyshelf bundle share <owner> <bundle> --member alice:read,list"
    ),
)]
struct Cli {
    /// keyshelf server address.
    #[arg(long, env = "KEYSHELF_ADDR", default_value = "http://127.0.0.1:8300", global = true)]
    addr: String,

    /// Your entity id, as issued by the host.
    #[arg(long, env = "KEYSHELF_ENTITY_ID", global = true)]
    entity_id: Option<String>,

    /// Your display name.
    #[arg(long, env = "KEYSHELF_ENTITY_NAME", global = true)]
    entity_name: Option<String>,

    /// Master password.
    #[arg(long, env = "KEYSHELF_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Mount context mixed into key derivation.
    #[arg(long, env = "KEYSHELF_MOUNT", default_value = "pwmanager", global = true)]
    mount: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Offline secret key operations.
    #[command(name = "secret-key")]
    SecretKey {
        #[command(subcommand)]
        action: SecretKeyCommands,
    },
    /// User unlock key operations.
    Uuk {
        #[command(subcommand)]
        action: UukCommands,
    },
    /// Register an unlock key with the server.
    Register {
        /// UUK JSON produced by `uuk build`.
        #[arg(long)]
        uuk: PathBuf,
    },
    /// Check that the password and secret key open your registered key.
    Unlock {
        /// File holding the offline secret key.
        #[arg(long, env = "KEYSHELF_SECRET_KEY_FILE")]
        secret_key_file: PathBuf,
    },
    /// Bundle operations.
    Bundle {
        #[command(subcommand)]
        action: BundleCommands,
    },
    /// Encrypt a payload to a registered user's public key.
    Encrypt {
        /// Display name of the recipient.
        #[arg(long)]
        to: String,
        /// Input file (default: stdin).
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Decrypt a token addressed to you.
    Decrypt {
        /// File holding the offline secret key.
        #[arg(long, env = "KEYSHELF_SECRET_KEY_FILE")]
        secret_key_file: PathBuf,
        /// Input file (default: stdin).
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SecretKeyCommands {
    /// Generate a new offline secret key.
    Generate {
        /// Write the key to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum UukCommands {
    /// Build a new unlock key locally.
    Build {
        /// File holding the offline secret key.
        #[arg(long, env = "KEYSHELF_SECRET_KEY_FILE")]
        secret_key_file: PathBuf,
        /// Write the UUK JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// PBKDF2 iteration count.
        #[arg(long, default_value_t = keyshelf_core::kdf::DEFAULT_ITERATIONS)]
        iterations: u32,
    },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// Create an empty bundle.
    Create,
    /// List owned and shared bundles.
    List,
    /// Replace a bundle's member list.
    Share {
        /// Owner entity id.
        owner: String,
        /// Bundle id.
        bundle_id: String,
        /// Member as `name:caps[:admin]`, e.g. `alice:read,list`. Repeatable.
        #[arg(long = "member")]
        members: Vec<String>,
    },
    /// Accept a bundle shared with you.
    Accept { bundle_id: String },
    /// Decline a bundle shared with you.
    Decline { bundle_id: String },
    /// Delete a bundle you own.
    Delete { owner: String, bundle_id: String },
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(icon: &str, title: &str) {
    println!("{BOLD}{CYAN}{icon} {title}{RESET}");
    println!("{DIM}─────────────────────────────────────────{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key:<20}{RESET} {WHITE}{value}{RESET}");
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

fn print_failures(resp: &Value) {
    if let Some(failures) = resp["failures"].as_array() {
        for f in failures {
            warning(&format!(
                "{}: {} ({})",
                f["entity_id"].as_str().unwrap_or("?"),
                f["reason"].as_str().unwrap_or(""),
                f["kind"].as_str().unwrap_or(""),
            ));
        }
    }
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::new(&cli.addr, cli.entity_id.clone(), cli.entity_name.clone());
    let session = Session {
        password: cli.password,
        mount: cli.mount,
        entity_id: cli.entity_id,
    };

    match cli.command {
        Commands::SecretKey {
            action: SecretKeyCommands::Generate { output },
        } => cmd_secret_key_generate(output.as_deref()),
        Commands::Uuk {
            action:
                UukCommands::Build {
                    secret_key_file,
                    output,
                    iterations,
                },
        } => cmd_uuk_build(&session, &secret_key_file, output.as_deref(), iterations).await,
        Commands::Register { uuk } => cmd_register(&client, &uuk).await,
        Commands::Unlock { secret_key_file } => {
            cmd_unlock(&client, &session, &secret_key_file).await
        }
        Commands::Bundle { action } => cmd_bundle(&client, action).await,
        Commands::Encrypt { to, input } => cmd_encrypt(&client, &to, input.as_deref()).await,
        Commands::Decrypt {
            secret_key_file,
            input,
        } => cmd_decrypt(&client, &session, &secret_key_file, input.as_deref()).await,
    }
}

/// The local inputs to key derivation.
struct Session {
    password: Option<String>,
    mount: String,
    entity_id: Option<String>,
}

impl Session {
    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no password, set KEYSHELF_PASSWORD"))
    }

    fn entity_id(&self) -> Result<&str> {
        self.entity_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no entity id, set KEYSHELF_ENTITY_ID or use --entity-id"))
    }

    fn credentials<'a>(&'a self, secret_key: &'a str) -> Result<Credentials<'a>> {
        Ok(Credentials {
            password: self.password()?.as_bytes(),
            mount: self.mount.as_bytes(),
            secret_key: secret_key.as_bytes(),
            entity_id: self.entity_id()?.as_bytes(),
        })
    }

    /// Open `uuk` on a blocking thread; PBKDF2 is slow on purpose.
    async fn open(&self, uuk: Uuk, secret_key_file: &Path) -> Result<rsa::RsaPrivateKey> {
        let secret = secret_key::read(secret_key_file)?;
        let password = self.password()?.to_owned();
        let mount = self.mount.clone();
        let entity_id = self.entity_id()?.to_owned();
        tokio::task::spawn_blocking(move || {
            let creds = Credentials {
                password: password.as_bytes(),
                mount: mount.as_bytes(),
                secret_key: secret.as_bytes(),
                entity_id: entity_id.as_bytes(),
            };
            uuk.decrypt_enc_pri_key(&creds)
        })
        .await
        .context("unlock task failed")?
        .context("wrong password or secret key")
    }
}

// ── Local key commands ───────────────────────────────────────────────

fn cmd_secret_key_generate(output: Option<&Path>) -> Result<()> {
    let key = secret_key::generate();
    match output {
        Some(path) => {
            secret_key::write(path, &key)?;
            success(&format!("secret key written to {}", path.display()));
            warning("keep this file offline and backed up; it cannot be recovered");
        }
        None => println!("{key}"),
    }
    Ok(())
}

async fn cmd_uuk_build(
    session: &Session,
    secret_key_file: &Path,
    output: Option<&Path>,
    iterations: u32,
) -> Result<()> {
    if iterations == 0 {
        bail!("iterations must be positive");
    }
    let secret = secret_key::read(secret_key_file)?;
    // Fail fast on missing inputs before the slow part.
    session.credentials(&secret)?;

    let password = session.password()?.to_owned();
    let mount = session.mount.clone();
    let entity_id = session.entity_id()?.to_owned();
    let uuk = tokio::task::spawn_blocking(move || {
        let creds = Credentials {
            password: password.as_bytes(),
            mount: mount.as_bytes(),
            secret_key: secret.as_bytes(),
            entity_id: entity_id.as_bytes(),
        };
        let opts = BuildOptions {
            iterations,
            ..BuildOptions::default()
        };
        Uuk::build(&creds, &opts)
    })
    .await
    .context("build task failed")?
    .context("failed to build unlock key")?;

    let json = serde_json::to_string_pretty(&uuk).context("failed to serialize UUK")?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            success(&format!("unlock key {} written to {}", uuk.uuid, path.display()));
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn cmd_register(client: &Client, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let uuk: Uuk = serde_json::from_str(&raw).context("file is not a UUK")?;
    uuk.validate().context("UUK failed validation")?;

    let body = serde_json::to_value(&uuk).context("failed to serialize UUK")?;
    client.post("/v1/register", &body).await?;
    success(&format!("unlock key {} registered", uuk.uuid));
    Ok(())
}

async fn fetch_own_uuk(client: &Client) -> Result<Uuk> {
    let value = client.get("/v1/register").await?;
    serde_json::from_value(value).context("server returned a malformed UUK")
}

async fn cmd_unlock(client: &Client, session: &Session, secret_key_file: &Path) -> Result<()> {
    let uuk = fetch_own_uuk(client).await?;
    let uuid = uuk.uuid.clone();
    session.open(uuk, secret_key_file).await?;
    success(&format!("unlock key {uuid} opened"));
    Ok(())
}

// ── Payload encryption ───────────────────────────────────────────────

fn read_input(input: Option<&Path>) -> Result<Vec<u8>> {
    match input {
        Some(path) => std::fs::read(path).with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read stdin")?;
            Ok(buf)
        }
    }
}

async fn cmd_encrypt(client: &Client, to: &str, input: Option<&Path>) -> Result<()> {
    let resp = client.get(&format!("/v1/users/{to}/pubkey")).await?;
    let recipient: PublicJwk =
        serde_json::from_value(resp["pub_key"].clone()).context("malformed public key")?;
    let payload = read_input(input)?;
    let token = encrypt_to(&recipient, &payload).context("encryption failed")?;
    println!("{token}");
    Ok(())
}

async fn cmd_decrypt(
    client: &Client,
    session: &Session,
    secret_key_file: &Path,
    input: Option<&Path>,
) -> Result<()> {
    let token = String::from_utf8(read_input(input)?).context("token is not UTF-8")?;
    let uuk = fetch_own_uuk(client).await?;
    let key = session.open(uuk, secret_key_file).await?;
    let plaintext = decrypt_with(token.trim(), &key).context("decryption failed")?;
    std::io::stdout()
        .write_all(&plaintext)
        .context("failed to write plaintext")?;
    Ok(())
}

// ── Bundle commands ──────────────────────────────────────────────────

/// Parse `name:caps[:admin]`.
fn parse_member(spec: &str) -> Result<MemberSpec> {
    let mut parts = spec.splitn(3, ':');
    let entity_name = parts.next().unwrap_or_default().trim();
    let caps = parts
        .next()
        .with_context(|| format!("member '{spec}' is missing capabilities, use name:caps"))?;
    let is_admin = match parts.next() {
        None => false,
        Some("admin") => true,
        Some(other) => bail!("unknown member flag '{other}', expected 'admin'"),
    };
    if entity_name.is_empty() {
        bail!("member '{spec}' has no name");
    }
    let capabilities: Capabilities = caps.parse().with_context(|| format!("member '{spec}'"))?;
    Ok(MemberSpec {
        entity_name: entity_name.to_owned(),
        is_admin,
        capabilities,
    })
}

async fn cmd_bundle(client: &Client, action: BundleCommands) -> Result<()> {
    match action {
        BundleCommands::Create => {
            let resp = client.post_no_body("/v1/bundles").await?;
            header("📦", "Bundle created");
            kv_line("id", resp["bundle"]["id"].as_str().unwrap_or(""));
            kv_line("path", resp["path"].as_str().unwrap_or(""));
        }
        BundleCommands::List => {
            let resp = client.get("/v1/bundles").await?;
            header("📦", "Owned bundles");
            for b in resp["bundles"].as_array().into_iter().flatten() {
                let members = b["users"].as_array().map_or(0, Vec::len);
                kv_line(
                    b["id"].as_str().unwrap_or(""),
                    &format!("{members} member(s)"),
                );
            }
            println!();
            header("🤝", "Shared with me");
            for s in resp["shared_bundles"].as_array().into_iter().flatten() {
                let state = if s["has_accepted"].as_bool().unwrap_or(false) {
                    "accepted"
                } else {
                    "pending"
                };
                kv_line(
                    s["id"].as_str().unwrap_or(""),
                    &format!(
                        "{} from {} ({state})",
                        s["capabilities"].as_str().unwrap_or(""),
                        s["owner_entity_id"].as_str().unwrap_or("")
                    ),
                );
            }
        }
        BundleCommands::Share {
            owner,
            bundle_id,
            members,
        } => {
            let request = MemberUpdateRequest {
                users: members
                    .iter()
                    .map(|m| parse_member(m))
                    .collect::<Result<_>>()?,
            };
            let body = serde_json::to_value(&request).context("failed to serialize request")?;
            let resp = client
                .post(&format!("/v1/bundles/{owner}/{bundle_id}/users"), &body)
                .await?;
            header("🔑", "Members updated");
            if let Some(keys) = resp["pubkey"].as_object() {
                for (entity_id, key) in keys {
                    kv_line(entity_id, key["kid"].as_str().unwrap_or(""));
                }
            }
            print_failures(&resp);
        }
        BundleCommands::Accept { bundle_id } => {
            client
                .post_no_body(&format!("/v1/shared/{bundle_id}/accept"))
                .await?;
            success(&format!("accepted bundle {bundle_id}"));
        }
        BundleCommands::Decline { bundle_id } => {
            let resp = client
                .post_no_body(&format!("/v1/shared/{bundle_id}/decline"))
                .await?;
            success(&format!("declined bundle {bundle_id}"));
            print_failures(&resp);
        }
        BundleCommands::Delete { owner, bundle_id } => {
            let resp = client
                .delete(&format!("/v1/bundles/{owner}/{bundle_id}"))
                .await?;
            success(&format!("deleted bundle {bundle_id}"));
            print_failures(&resp);
        }
    }
    Ok(())
}
