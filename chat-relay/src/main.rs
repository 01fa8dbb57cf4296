use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    auth,
    cli::{Cli, Command, ServeArgs},
    client,
    config::RelayConfig,
    console::Console,
    relay::Relay,
    store::CredentialStore,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await?,
        Command::Client(args) => client::run(args).await?,
        Command::Hash(args) => println!("{}", auth::password_hash(&args.login, &args.password)),
    }

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = RelayConfig::load_or_default(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let store: Arc<dyn CredentialStore> = Arc::new(config.seeded_store());
    let (relay, handle) = Relay::bind(&config, Arc::clone(&store)).await?;
    let addr = relay.local_addr().context("listener has no local address")?;
    info!("relay listening on {}", addr);

    let console = args
        .console
        .then(|| tokio::spawn(Console::new(store, handle).run()));

    if let Err(err) = relay.run_until_ctrl_c().await {
        warn!("relay exited with error: {err:?}");
        return Err(err.into());
    }

    if let Some(console) = console {
        if !console.is_finished() {
            // A pending stdin read would keep the runtime from shutting down.
            std::process::exit(0);
        }
        if let Ok(Err(err)) = console.await {
            warn!("console exited with error: {err:?}");
        }
    }
    Ok(())
}
