// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Arg, ArgMatches, Command};
use streamf::config::LoggerConfig;
use streamf::{Application, Config};

fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

fn config_arg() -> Arg<'static> {
  Arg::new("config")
    .long("config")
    .short('c')
    .help("Path of the JSON configuration")
    .validator(validate_existing_file)
    .takes_value(true)
    .required(true)
}

fn init_logging(logger: &LoggerConfig) -> Result<()> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logger.directive()));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_file(logger.source)
    .with_line_number(logger.source)
    .finish();
  tracing::subscriber::set_global_default(collector).context("Logger init must succeed")
}

fn main() {
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("run")
        .about("Serve every listener and bridge in the configuration until interrupted")
        .arg(config_arg()),
    )
    .subcommand(
      Command::new("check")
        .about("Build the configuration, print what it describes, and exit")
        .arg(config_arg()),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let (mode, args) = match matches.subcommand() {
    Some(subcommand) => subcommand,
    None => unreachable!("subcommand is marked as required"),
  };

  let config = match args.value_of("config").map(Config::load) {
    Some(Ok(config)) => config,
    Some(Err(err)) => {
      eprintln!("{}", err);
      std::process::exit(1);
    }
    None => unreachable!("config is marked as required"),
  };
  if let Err(err) = init_logging(&config.logger) {
    eprintln!("{:#}", err);
    std::process::exit(1);
  }

  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("streamf-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(err) => {
      tracing::error!(?err, "runtime setup failure");
      std::process::exit(1);
    }
  };
  match rt.block_on(main_args_handler(mode, args, config)) {
    Err(err) => {
      tracing::error!(mode, err = %format!("{:#}", err), "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

async fn main_args_handler(mode: &str, _args: &ArgMatches, config: Config) -> Result<()> {
  let app = Arc::new(
    Application::new(&config)
      .await
      .context("Application setup failed")?,
  );
  match mode {
    "check" => {
      let info = app.info().await;
      app.close();
      println!("{}", serde_json::to_string_pretty(&info)?);
      Ok(())
    }
    "run" => {
      let sigint_handler_task = {
        let app = app.clone();
        tokio::task::spawn(async move {
          let _ = tokio::signal::ctrl_c().await;
          tracing::info!("SIGINT detected, initiating graceful shutdown");
          app.close();
        })
      };
      app.serve().await;
      sigint_handler_task.abort();
      Ok(())
    }
    other => anyhow::bail!("unknown subcommand {:?}", other),
  }
}
