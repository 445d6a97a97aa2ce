/// Lorebound OAuth CLI tool
/// Usage:
///   lorebound-auth login
///   lorebound-auth status
///   lorebound-auth logout
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use lorebound::auth::{AuthorizationTransport, CALLBACK_SOURCE, CallbackMessage};
use lorebound::{AuthError, ConfigStore, KeyringStore, PkceAuthorizer, SyncConfig, TokenStore};

/// Manual paste flow: open the browser, let the user authorize, then paste
/// the `code#state` pair shown on the callback page.
struct PasteTransport {
    origin: String,
}

#[async_trait]
impl AuthorizationTransport for PasteTransport {
    async fn open(&self, url: &str) -> Result<(), AuthError> {
        println!("\n🔐 Lorebound login");
        println!("\n📱 Opening browser...\n");
        println!("   {}\n", url);

        if let Err(e) = opener::open(url) {
            return Err(AuthError::InteractionBlocked(e.to_string()));
        }

        println!("Steps:");
        println!("  1. Log in and click \"Authorize\"");
        println!("  2. Copy the code shown on the callback page (format: code#state)");
        println!("  3. Paste it below\n");
        Ok(())
    }

    async fn await_callback(
        &self,
        trusted_origin: &str,
        timeout: Duration,
    ) -> Result<CallbackMessage, AuthError> {
        let origin = self.origin.clone();
        let input = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(|| {
                use std::io::Write;
                print!("📋 Paste authorization code: ");
                let _ = std::io::stdout().flush();
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|_| line)
            }),
        )
        .await
        .map_err(|_| AuthError::Timeout)?
        .map_err(|e| AuthError::AuthorizationDenied(e.to_string()))?
        .map_err(|e| AuthError::AuthorizationDenied(e.to_string()))?;

        let input = input.trim();
        let Some((code, state)) = input.split_once('#') else {
            return Err(AuthError::AuthorizationDenied(
                "invalid format, expected code#state".to_string(),
            ));
        };

        debug_assert_eq!(origin, trusted_origin);
        Ok(CallbackMessage {
            origin,
            source: CALLBACK_SOURCE.to_string(),
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            error: None,
            error_description: None,
        })
    }

    async fn close(&self) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("");

    let config = SyncConfig::load()?;
    let origin = url::Url::parse(&config.redirect_url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_default();

    let config_store = Arc::new(ConfigStore::fixed(config));
    let tokens = Arc::new(TokenStore::new(Arc::new(KeyringStore::new("lorebound"))));

    match command {
        "login" => {
            let authorizer = PkceAuthorizer::new(
                config_store,
                tokens.clone(),
                Arc::new(PasteTransport { origin }),
            );

            let raw = authorizer.authorize().await?;
            let token = tokens.set(raw)?;

            println!("\n✅ Logged in");
            println!("🔒 Token stored in the system keyring");
            println!("⏰ Expires: {}", token.expires_at);
        }

        "status" => {
            let token = tokens.get();
            let badge = tokens.describe(token.as_ref());
            println!("{}", badge.label);
            if let Some(token) = token {
                if token.is_expired() {
                    println!("⚠️  Token is expired{}", match token.refresh_token {
                        Some(_) => ", will refresh on next sync",
                        None => ", log in again",
                    });
                }
            }
        }

        "logout" => {
            tokens.clear()?;
            println!("✅ Token cleared from the system keyring");
        }

        _ => {
            eprintln!("Usage: lorebound-auth <login|status|logout>");
            std::process::exit(1);
        }
    }

    Ok(())
}
