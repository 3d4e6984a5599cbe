#[macro_use] extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{from_env, Env};
use nsbox::{
    errors::OciError,
    oci::{parse_bind_mount, parse_securebits_skip_mask, signal_from_name},
    ContainerOptions, Launcher, LauncherPaths,
};
use std::{fs, path::PathBuf};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap_or("warn");
    from_env(Env::default().default_filter_or(log_level)).init();

    let launcher = Launcher::new(LauncherPaths::default());
    match dispatch(&launcher, &matches).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(0xFF);
        }
    }
}

async fn dispatch(launcher: &Launcher, matches: &ArgMatches<'_>) -> Result<i32, OciError> {
    match matches.subcommand() {
        ("run", Some(args)) => {
            let status = launcher
                .run(&container_path(args)?, container_id(args), &container_options(args)?)
                .await?;
            Ok(status.code().unwrap_or(0xFF))
        }
        ("start", Some(args)) => {
            let id = container_id(args);
            let pid = launcher
                .start(
                    &container_path(args)?,
                    id,
                    &container_options(args)?,
                    args.is_present("inplace"),
                )
                .await?;
            log::info!("container {} running as pid {}", id, pid);
            Ok(0)
        }
        ("kill", Some(args)) => {
            let signal = signal_from_name(args.value_of("signal").unwrap_or("TERM"))?;
            launcher.kill(container_id(args), signal)?;
            Ok(0)
        }
        ("destroy", Some(args)) => {
            launcher.destroy(container_id(args)).await?;
            Ok(0)
        }
        (name, _) => {
            log::error!("unknown command {:?}", name);
            Ok(0xFF)
        }
    }
}

fn container_id<'a>(args: &'a ArgMatches<'_>) -> &'a str {
    args.value_of("container_id").unwrap_or_default()
}

/// Absolute, so the state directory's `config.json` link resolves
fn container_path(args: &ArgMatches) -> Result<PathBuf, OciError> {
    let path = match args.value_of("container_path") {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?,
    };
    Ok(fs::canonicalize(path)?)
}

fn container_options(args: &ArgMatches) -> Result<ContainerOptions, OciError> {
    let mut options = ContainerOptions::default();
    for spec in string_values(args, "bind_mount") {
        options.bind_mounts.push(parse_bind_mount(&spec)?);
    }
    options.cgroup_parent = args.value_of("cgroup_parent").map(str::to_string);
    options.alt_syscall_table = args.value_of("alt_syscall").map(str::to_string);
    if let Some(mask) = args.value_of("securebits_skip_mask") {
        options.securebits_skip_mask = parse_securebits_skip_mask(mask)?;
    }
    options.use_current_user = args.is_present("use_current_user");
    options.run_as_init = !args.is_present("dont_run_as_init");
    options.extra_program_args = string_values(args, "extra_args");
    Ok(options)
}

fn string_values<S: AsRef<str>>(matches: &ArgMatches, name: S) -> Vec<String> {
    matches
        .values_of(name)
        .into_iter()
        .map(|values| values.map(|value| value.to_string()))
        .flatten()
        .collect()
}
