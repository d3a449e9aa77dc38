use crate::gadgetpatch::adb::{self, AdbBridge, DeviceBridge, NoDevice};
use crate::gadgetpatch::apk::Apktool;
use crate::gadgetpatch::cli::{Cli, Commands, PatchArgs};
use crate::gadgetpatch::config::Config;
use crate::gadgetpatch::gadget::{GadgetResolver, GithubReleases, VersionRequest, installed_frida_version};
use crate::gadgetpatch::pipeline::{Pipeline, PatchSession};
use crate::gadgetpatch::tui::progress::create_spinner;
use adb_client::ADBServer;
use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

pub async fn program(argv: Cli) -> anyhow::Result<()> {
    let config = Config::load(argv.config.as_deref()).context("Failed to load configuration")?;

    match argv.command {
        Commands::Patch(args) => patch(args, &config).await?,

        Commands::UpdateGadgets { version, force } => {
            let resolver = GadgetResolver::from_config(GithubReleases::new(&config.upstream)?, &config);
            let version = resolver.resolve_version(&version).await?;
            info!("Updating gadgets for frida {version}");

            let mut failed = 0;
            for (arch, result) in resolver.update_all(&version, force).await {
                match result {
                    Ok(asset) => info!("{arch:<7} => {}", asset.path.display()),
                    Err(e) => {
                        failed += 1;
                        error!("{arch:<7} => {e}");
                    }
                }
            }

            if failed > 0 {
                anyhow::bail!("{failed} of 4 gadgets could not be updated");
            }
        }

        Commands::Devices => {
            let mut adb_server = ADBServer::default();
            let spinner = create_spinner("Listing devices...");
            let result = adb::list_devices(&mut adb_server);
            spinner.finish_and_clear();
            result?;
        }
    }

    Ok(())
}

fn default_version() -> VersionRequest {
    match installed_frida_version() {
        Some(version) => {
            info!("Defaulting to the installed frida version {version}");
            VersionRequest::Exact(version)
        }
        None => VersionRequest::Latest,
    }
}

async fn patch(args: PatchArgs, config: &Config) -> anyhow::Result<()> {
    let default = if args.version.is_none() && args.gadget.is_none() {
        default_version()
    } else {
        VersionRequest::Latest
    };

    let bridge: Arc<dyn DeviceBridge> = if args.no_device {
        Arc::new(NoDevice)
    } else {
        Arc::new(AdbBridge)
    };

    let session = PatchSession::new(args.into_request(default), config)?;

    let resolver = GadgetResolver::from_config(GithubReleases::new(&config.upstream)?, config);
    let pipeline = Pipeline::new(Apktool::from_config(config), resolver, bridge)
        .with_session_checkpoints(&session.options);

    let abort = pipeline.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current stage");
            abort.store(true, Ordering::SeqCst);
        }
    });

    let outcome = pipeline.run(session).await?;

    if outcome.already_patched {
        info!("The APK already loaded the gadget, it was only rebuilt and re-signed");
    }
    if let Some(dir) = &outcome.work_dir_kept {
        info!("Working directory kept at {}", dir.display());
    }
    info!("Done: {}", outcome.output.display());

    Ok(())
}
