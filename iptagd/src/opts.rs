/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Arg, ArgAction, Command, ValueHint, value_parser};

const GLOBAL_ARG_VERSION: &str = "version";
const GLOBAL_ARG_CONFIG_FILE: &str = "config-file";

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug)]
pub struct ProcArgs {
    pub config_file: PathBuf,
}

fn build_cli_args() -> Command {
    Command::new(crate::build::PKG_NAME)
        .disable_version_flag(true)
        .arg(
            Arg::new(GLOBAL_ARG_VERSION)
                .help("Show version")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .short('V')
                .long(GLOBAL_ARG_VERSION),
        )
        .arg(
            Arg::new(GLOBAL_ARG_CONFIG_FILE)
                .help("Config file path")
                .num_args(1)
                .value_name("CONFIG FILE")
                .value_hint(ValueHint::FilePath)
                .value_parser(value_parser!(PathBuf))
                .default_value(DEFAULT_CONFIG_FILE)
                .short('c')
                .long(GLOBAL_ARG_CONFIG_FILE),
        )
}

pub fn parse_clap() -> anyhow::Result<Option<ProcArgs>> {
    let args = build_cli_args().get_matches();

    if args.get_flag(GLOBAL_ARG_VERSION) {
        crate::build::print_version();
        return Ok(None);
    }

    let config_file = args
        .get_one::<PathBuf>(GLOBAL_ARG_CONFIG_FILE)
        .cloned()
        .ok_or_else(|| anyhow!("no config file given"))?;
    Ok(Some(ProcArgs { config_file }))
}
