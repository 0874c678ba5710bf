//! Job specifications for the bootstrap steps and the engine server itself.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::HostConfig;
use crate::jobs::{JobScope, JobSpec, Panel, Presentation, Reveal};

pub const SERVER_JOB_KIND: &str = "engine-server";
pub const SETUP_JOB_KIND: &str = "engine-setup";
pub const TOOLCHAIN_JOB_KIND: &str = "toolchain-add";
pub const CREDENTIAL_JOB_KIND: &str = "credential-discovery";

pub const WORKSPACE_ENV: &str = "JULIA_PLUTO_VSCODE_WORKSPACE";
pub const CLI_GIT_ENV: &str = "JULIA_PKG_USE_CLI_GIT";
pub const LOAD_PATH_ENV: &str = "JULIA_LOAD_PATH";

/// Platform-specific executable name.
pub fn executable_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

/// Forward slashes are accepted by the engine on every platform and avoid
/// backslash escaping in generated code.
pub fn to_engine_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Split a configured executable into command and arguments. Whitespace
/// separates parts unless inside double quotes; quotes are removed.
pub fn parse_executable(executable: &str) -> (String, Vec<String>) {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_part = false;

    for ch in executable.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_part = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_part {
                    parts.push(std::mem::take(&mut current));
                    has_part = false;
                }
            }
            c => {
                current.push(c);
                has_part = true;
            }
        }
    }
    if has_part {
        parts.push(current);
    }

    let mut parts = parts.into_iter();
    let command = parts.next().unwrap_or_else(|| executable.trim().to_string());
    (command, parts.collect())
}

pub fn server_job_name(port: u16) -> String {
    format!("Engine Server (port {port})")
}

/// Engine entry point: serve on `port` with secrets and browser launch off.
pub fn server_code(port: u16) -> String {
    format!(
        "using Pluto; Pluto.run(port={port}; require_secret_for_open_links=false, \
         require_secret_for_access=false, launch_browser=false)"
    )
}

fn engine_prefix(config: &HostConfig) -> (String, Vec<String>) {
    let (command, base_args) = parse_executable(&config.server.executable);
    let mut args = Vec::new();
    if config.toolchain.enabled {
        args.push(format!("+{}", config.toolchain.channel));
    }
    args.extend(base_args);
    (command, args)
}

fn one_shot_presentation() -> Presentation {
    Presentation {
        reveal: Reveal::Always,
        panel: Panel::Shared,
        echo: true,
    }
}

pub fn toolchain_spec(config: &HostConfig) -> JobSpec {
    let channel = &config.toolchain.channel;
    JobSpec::new(
        TOOLCHAIN_JOB_KIND,
        format!("Install toolchain {channel}"),
        config.toolchain.installer.clone(),
    )
    .args(["add", channel.as_str()])
    .scope(JobScope::Workspace(config.workspace_root()))
    .presentation(one_shot_presentation())
}

pub fn setup_spec(config: &HostConfig) -> JobSpec {
    let (command, mut args) = engine_prefix(config);
    args.push(format!("--project={}", to_engine_path(&config.environment_dir())));
    args.push("-e".to_string());
    args.push(config.environment.setup_code.clone());

    JobSpec::new(SETUP_JOB_KIND, "Instantiate environment", command)
        .args(args)
        .scope(JobScope::Workspace(config.workspace_root()))
        .presentation(one_shot_presentation())
}

pub fn credential_spec(config: &HostConfig) -> Option<JobSpec> {
    let command = config.credentials.command.as_ref()?;
    Some(
        JobSpec::new(CREDENTIAL_JOB_KIND, "Discover credentials", command.clone())
            .args(config.credentials.args.iter().cloned())
            .presentation(Presentation {
                reveal: Reveal::Silent,
                panel: Panel::Shared,
                echo: false,
            })
            .capture_stdout(),
    )
}

pub fn server_env(config: &HostConfig, credentials: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(
        WORKSPACE_ENV.to_string(),
        config.workspace_root().to_string_lossy().into_owned(),
    );
    env.insert(CLI_GIT_ENV.to_string(), "true".to_string());
    if let Some(load_path) = &config.server.environment_path {
        if !load_path.is_empty() {
            env.insert(LOAD_PATH_ENV.to_string(), load_path.clone());
        }
    }
    env.extend(credentials.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

pub fn server_spec(
    config: &HostConfig,
    port: u16,
    credentials: &BTreeMap<String, String>,
) -> JobSpec {
    let (command, mut args) = engine_prefix(config);
    args.push(format!("--project={}", to_engine_path(&config.environment_dir())));
    args.push("-e".to_string());
    args.push(server_code(port));

    JobSpec::new(SERVER_JOB_KIND, server_job_name(port), command)
        .args(args)
        .env(server_env(config, credentials))
        .port(port)
        .scope(JobScope::Workspace(config.workspace_root()))
        .presentation(Presentation {
            reveal: Reveal::Always,
            panel: Panel::Dedicated,
            echo: true,
        })
        .background()
}
