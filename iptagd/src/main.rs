/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};

use iptagd::config::Config;

fn main() -> anyhow::Result<()> {
    let Some(proc_args) =
        iptagd::opts::parse_clap().context("failed to parse command line options")?
    else {
        return Ok(());
    };

    let config = iptagd::config::load(&proc_args.config_file).context(format!(
        "failed to load config file {}",
        proc_args.config_file.display()
    ))?;

    let _log_guard = iptagd::log::setup(&config.log).context("failed to set up logging")?;

    info!(
        "starting iptagd, api {}, monitor {}, log level {}",
        config.listen_addr, config.monitor_addr, config.log.level
    );

    let ret = tokio_run(config);
    match ret {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("{e:?}");
            Err(e)
        }
    }
}

fn tokio_run(config: Config) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    rt.block_on(iptagd::run(Arc::new(config)))
}
