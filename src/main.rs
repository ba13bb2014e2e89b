//! Binary entrypoint: wire up secrets, storage, the model client, and the
//! scheduler loop, then run until interrupted.

use std::sync::Arc;

use tokio::sync::Mutex;

use mailminder::crypto::TokenCipher;
use mailminder::db::Db;
use mailminder::error::EngineError;
use mailminder::llm::ChatClient;
use mailminder::scheduler::{self, SchedulerCommand};
use mailminder::secrets::Secrets;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    let secrets = Secrets::from_env()?;
    let cipher = TokenCipher::new(&secrets.token_key)?;
    let db = Db::open()?;
    let llm = ChatClient::new(&secrets.llm_base_url, &secrets.llm_api_key, &secrets.llm_model)?;

    log::info!("mailminder starting (model {})", secrets.llm_model);

    let (handle, commands) = scheduler::command_channel();

    // The SQLite connection is not Sync, so the scheduler loop runs on the
    // main task; only the signal watcher is spawned.
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("signal handler failed: {}", e);
            return;
        }
        log::info!("shutdown requested");
        shutdown_handle.send(SchedulerCommand::Shutdown).await;
    });

    scheduler::run(
        Arc::new(Mutex::new(db)),
        Arc::new(secrets),
        Arc::new(llm),
        Arc::new(cipher),
        commands,
    )
    .await;
    Ok(())
}
