use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use dcsync_config::load_config;
use dcsync_engine::{
    build_client_factory, run_audit_scheduler, Faults, FernetKeyManager, GenericSyncManager,
    LogFaultReporter,
};
use dcsync_store::{RedbStore, SyncStore};
use tokio::sync::watch;
use tracing::info;

/// Start the engine: rebuild the subcloud registry, then run the audit
/// scheduler and the fernet key manager until interrupted.
pub async fn run(config_path: PathBuf, store_path: PathBuf) -> Result<()> {
    let config = Arc::new(load_config(&config_path)?);
    info!(config = %config_path.display(), store = %store_path.display(), "starting dcsync engine");

    let store: Arc<dyn SyncStore> = Arc::new(RedbStore::open(&store_path)?);
    let factory = Arc::new(build_client_factory(&config)?);
    let faults = Arc::new(Faults::new(Arc::new(LogFaultReporter)));
    let manager = Arc::new(GenericSyncManager::new(
        store.clone(),
        factory.clone(),
        faults,
        config.clone(),
    ));
    manager.init_from_store().await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let audit_task = tokio::spawn(run_audit_scheduler(
        manager.clone(),
        config.audit_interval,
        stop_rx.clone(),
    ));
    let fernet = Arc::new(FernetKeyManager::new(
        store,
        factory.master_clients().platform,
        Some(manager.clone()),
        &config,
    ));
    let fernet_task = tokio::spawn(fernet.run(stop_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    let _ = stop_tx.send(true);
    let _ = audit_task.await;
    let _ = fernet_task.await;
    Ok(())
}

/// Load and validate a configuration file, printing the effective settings.
pub fn validate(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    println!("configuration ok");
    println!("  master dbsync:     {}", config.master.dbsync_url);
    println!("  master identity:   {}", config.master.identity_url);
    println!("  master platform:   {}", config.master.platform_url);
    println!("  audit interval:    {:?}", config.audit_interval);
    println!("  worker sleep:      {:?}", config.worker_sleep);
    println!(
        "  retry backoff:     {:?} .. {:?}",
        config.backoff_initial, config.backoff_max
    );
    println!("  key rotation:      {:?}", config.key_rotation_interval);
    println!("  rotate command:    {}", config.rotate_command.display());
    match &config.hosts_file {
        Some(path) => println!("  hosts file:        {}", path.display()),
        None => println!("  hosts file:        disabled"),
    }
    println!(
        "  exclusions:        {} users, {} roles, {} projects",
        config.exclusions.users.len(),
        config.exclusions.roles.len(),
        config.exclusions.projects.len()
    );
    Ok(())
}
