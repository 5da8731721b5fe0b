//! Runs the Google consent flow and writes the token file named in the config.

use std::env;
use std::error::Error;

use miramail_core::Config;
use miramail_core::gmail::flow::run_installed_app_flow;
use miramail_core::gmail::oauth::{ClientSecrets, FileTokenStore, TokenStore};
use miramail_core::init_logging;
use tracing::info;

type AnyError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    init_logging(&config.app.env)?;

    let secrets = ClientSecrets::from_file(&config.gmail.credentials_file)?;
    let tokens = run_installed_app_flow(&secrets, &config.gmail.scopes).await?;

    let store = FileTokenStore::new(&config.gmail.token_file);
    store.save_tokens(&tokens).await?;
    info!(
        path = %store.path().display(),
        expires_at = %tokens.expires_at,
        "saved oauth tokens"
    );
    Ok(())
}
