use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use persona_vault::config::Config;
use persona_vault::error::{Result, StoreError};
use persona_vault::store::Keystore;

#[derive(Parser)]
#[command(name = "persona-vault")]
#[command(about = "Filesystem-backed persona keystore for encrypted messaging")]
#[command(version)]
struct Cli {
    /// Keystore base directory
    #[arg(long, default_value = ".persona-vault")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List personas and their kex keys
    List,
    /// Import a persona from PEM files
    Import {
        /// Display name for the persona
        #[arg(long, default_value = "")]
        name: String,
        /// Public key PEM file
        #[arg(long)]
        pubkey: PathBuf,
        /// Private key PEM file
        #[arg(long)]
        privkey: Option<PathBuf>,
        /// DH parameters: "new" to generate, or a PEM file path
        #[arg(long)]
        dh_params: Option<String>,
    },
    /// Generate and import a fresh persona (RSA by default)
    NewPersona {
        #[arg(long, default_value = "")]
        name: String,
        /// Generate an EC persona instead of RSA
        #[arg(long)]
        ec: bool,
    },
    /// Generate fresh DH parameters for an RSA persona
    NewDhParams {
        /// Persona id (full or 16-char short form)
        id: String,
    },
    /// Generate an ephemeral kex key for a persona
    NewKex {
        /// Persona id (full or 16-char short form)
        id: String,
        /// Designated peer persona id
        #[arg(long)]
        peer: Option<String>,
    },
}

fn read_pem(path: &PathBuf) -> Result<String> {
    fs::read_to_string(path).map_err(|e| StoreError::io(format!("read {}", path.display()), e))
}

fn run(cli: Cli) -> Result<()> {
    let cfg = Config::at(&cli.store);
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&cfg.base_dir)
        .map_err(|e| StoreError::io(format!("mkdir {}", cfg.base_dir.display()), e))?;

    let mut ks = Keystore::open(&cfg);
    ks.load()?;

    match cli.command {
        Commands::List => {
            for p in ks.personas() {
                println!(
                    "{} {:>3} {:>2} kex  {}",
                    &p.id()[..16],
                    p.type_marker().unwrap_or("?"),
                    p.kex_count(),
                    p.name().unwrap_or("-"),
                );
            }
        }
        Commands::Import {
            name,
            pubkey,
            privkey,
            dh_params,
        } => {
            let pub_pem = read_pem(&pubkey)?;
            let priv_pem = privkey.as_ref().map(read_pem).transpose()?;
            let dh = match dh_params.as_deref() {
                Some("new") => Some("new".to_string()),
                Some(path) => Some(read_pem(&PathBuf::from(path))?),
                None => None,
            };
            let p = ks.add_persona(&name, &pub_pem, priv_pem.as_deref(), dh.as_deref())?;
            println!("imported persona {}", p.id());
        }
        Commands::NewPersona { name, ec } => {
            let pair = if ec {
                ks.generate_ec()?
            } else {
                ks.generate_rsa()?
            };
            eprintln!();
            let dh = if ec { None } else { Some("new") };
            let id = ks
                .add_persona(&name, &pair.public, Some(pair.private.as_str()), dh)?
                .id()
                .to_string();
            eprintln!();
            println!("created persona {id}");
            print!("{}", pair.public);
        }
        Commands::NewDhParams { id } => {
            ks.new_dh_params(&id)?;
            eprintln!();
            println!("new DH parameters installed for {id}");
        }
        Commands::NewKex { id, peer } => {
            let kb = ks.generate_kex(&id, peer.as_deref())?;
            println!("{}", kb.hex());
            print!("{}", kb.public_pem());
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("persona-vault: {e}");
        std::process::exit(1);
    }
}
