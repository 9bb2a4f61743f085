//! fbekeyd - file-based encryption key management daemon
//!
//! Usage:
//!   fbekeyd init-device-key               - Create/restore the device key
//!   fbekeyd create-user <user_id>         - Generate keys for a new user
//!   fbekeyd delete-user <user_id>         - Remove a user's keys everywhere
//!   fbekeyd update-user-auth <user_id>    - Re-bind keys to new credentials
//!   fbekeyd active-user-key <user_id>     - Unlock a user's keys
//!   fbekeyd inactive-user-key <user_id>   - Lock a user's keys
//!   fbekeyd prepare-user-space <user_id>  - Create the key directory skeleton
//!   fbekeyd status                        - Show configuration and capabilities

use clap::{Parser, Subcommand};
use fbekeyd::{
    config::Config,
    huks::{HuksMaster, SoftHuksHdi},
    kernel::{DeviceFbex, DeviceKeyCtrl, Fbex, KernelServices},
    key::{KeyManager, UserAuth},
    Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "fbekeyd")]
#[command(author = "fbekeyd Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-user file-based encryption key management")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/fbekeyd/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or restore the device-global key and install it
    InitDeviceKey,

    /// Generate keys for a new user account
    CreateUser {
        user_id: u32,
    },

    /// Remove a user's keys from kernel, engine, and disk
    DeleteUser {
        user_id: u32,
    },

    /// Re-bind a user's keys to new credentials
    UpdateUserAuth {
        user_id: u32,

        /// Secure uid the new credentials bind to
        #[arg(long, default_value_t = 0)]
        secure_uid: u64,

        /// Read the current secret from a file instead of prompting
        #[arg(long)]
        old_secret_file: Option<PathBuf>,

        /// Read the new secret from a file instead of prompting
        #[arg(long)]
        new_secret_file: Option<PathBuf>,
    },

    /// Restore a user's keys and install them into the kernel
    ActiveUserKey {
        user_id: u32,

        /// Secure uid the stored credentials are bound to
        #[arg(long, default_value_t = 0)]
        secure_uid: u64,

        /// Read the secret from a file instead of prompting
        #[arg(long)]
        secret_file: Option<PathBuf>,
    },

    /// Remove a user's keys from the kernel (on-disk state kept)
    InactiveUserKey {
        user_id: u32,

        /// Defer the deactivation instead of running it immediately
        #[arg(long)]
        deferred: bool,
    },

    /// Create the per-level key directory skeleton for a user
    PrepareUserSpace {
        user_id: u32,
    },

    /// Show configuration and hardware capabilities
    Status,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run_command(cli.command, &cli.config) {
        error!("Command failed: {} (errno {})", e, e.to_errno());
        std::process::exit(1);
    }
}

fn build_manager(config: &Config) -> Result<Arc<KeyManager>> {
    let hdi = Arc::new(SoftHuksHdi::from_root_file(&config.huks.soft_root_key)?);
    let huks = Arc::new(
        HuksMaster::new(hdi)
            .with_retry(config.huks.retry_max, config.huks.retry_interval_ms)
            .with_screen_lock_hook(Box::new(|| {
                info!("auth token expired, requesting screen lock");
            })),
    );
    let kernel = KernelServices::new(
        Arc::new(DeviceKeyCtrl::new()),
        Arc::new(DeviceFbex::probe(&config.fbex.cmd_node)),
    );
    Ok(Arc::new(
        KeyManager::new(
            huks,
            kernel,
            config.storage.base_dir.clone(),
            config.storage.data_mnt.clone(),
        )
        .with_el1_inactive(config.fbex.el1_inactive),
    ))
}

/// Read the user's secret from a file (trailing newline stripped) or
/// prompt for it; an empty secret means the account has no credential
/// (boot-time and fresh-account flows).
fn prompt_auth(prompt: &str, secure_uid: u64, secret_file: Option<&PathBuf>) -> Result<UserAuth> {
    let secret = match secret_file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| {
                fbekeyd::Error::InvalidParam(format!(
                    "failed to read secret file {}: {}",
                    path.display(),
                    e
                ))
            })?
            .trim_end_matches(['\r', '\n'])
            .to_string(),
        None => rpassword::prompt_password(prompt)
            .map_err(|e| fbekeyd::Error::InvalidParam(format!("failed to read secret: {}", e)))?,
    };
    if secret.is_empty() {
        Ok(UserAuth::default())
    } else {
        Ok(UserAuth::with_credentials(secret.as_bytes(), secure_uid))
    }
}

fn run_command(command: Commands, config_path: &PathBuf) -> Result<()> {
    let config = Config::load_or_default(config_path)?;

    match command {
        Commands::InitDeviceKey => {
            let manager = build_manager(&config)?;
            manager.init_global_key()?;
            println!("Device key active");
        }

        Commands::CreateUser { user_id } => {
            let manager = build_manager(&config)?;
            manager.prepare_user_space(user_id)?;
            manager.generate_user_keys(user_id)?;
            println!("Keys generated for user {}", user_id);
        }

        Commands::DeleteUser { user_id } => {
            let manager = build_manager(&config)?;
            manager.delete_user_keys(user_id);
            println!("Keys deleted for user {}", user_id);
        }

        Commands::UpdateUserAuth {
            user_id,
            secure_uid,
            old_secret_file,
            new_secret_file,
        } => {
            let manager = build_manager(&config)?;
            let old_auth = prompt_auth(
                "Current secret (empty if none): ",
                secure_uid,
                old_secret_file.as_ref(),
            )?;
            let new_auth = prompt_auth(
                "New secret (empty to unbind): ",
                secure_uid,
                new_secret_file.as_ref(),
            )?;
            manager.update_user_auth(user_id, &old_auth, &new_auth)?;
            println!("Credentials updated for user {}", user_id);
        }

        Commands::ActiveUserKey {
            user_id,
            secure_uid,
            secret_file,
        } => {
            let manager = build_manager(&config)?;
            let auth = prompt_auth("Secret (empty if none): ", secure_uid, secret_file.as_ref())?;
            manager.active_user_key(user_id, &auth)?;
            println!("Keys active for user {}", user_id);
        }

        Commands::InactiveUserKey { user_id, deferred } => {
            let manager = build_manager(&config)?;
            if deferred {
                manager.defer_inactive_user_key(
                    user_id,
                    Duration::from_millis(config.inactive_delay_ms),
                );
                // Hold the process until the timer fires; the daemon form
                // of this call outlives the timer naturally.
                std::thread::sleep(Duration::from_millis(config.inactive_delay_ms + 100));
            } else {
                manager.inactive_user_key(user_id)?;
            }
            println!("Keys inactive for user {}", user_id);
        }

        Commands::PrepareUserSpace { user_id } => {
            let manager = build_manager(&config)?;
            manager.prepare_user_space(user_id)?;
            println!("Key directories prepared for user {}", user_id);
        }

        Commands::Status => {
            let fbex = DeviceFbex::probe(&config.fbex.cmd_node);
            println!("Key store:       {}", config.storage.base_dir.display());
            println!("Data mount:      {}", config.storage.data_mnt.display());
            println!("HUKS root key:   {}", config.huks.soft_root_key.display());
            println!(
                "FBEX engine:     {}",
                if fbex.is_support() { "present" } else { "absent" }
            );
        }
    }

    Ok(())
}
