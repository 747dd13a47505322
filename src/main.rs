// weft-cni
// One-shot CNI plugin binary: ADD attaches a container's network namespace
// to the weft overlay fabric, DEL detaches it. The command arrives via
// CNI_COMMAND, the network config as JSON on stdin, and the result or a
// typed error goes to stdout for the calling runtime.

mod cni;
mod config;
mod ipam;
mod net;
mod netinfo;
mod plugin;
mod store;

use cni::{CmdArgs, NetConf, TypedError, VersionReply};
use plugin::Plugin;
use std::io::Read;

#[tokio::main]
async fn main() {
    // Diagnostics go to stderr as structured events; stdout belongs to the
    // protocol.
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let command = std::env::var("CNI_COMMAND").unwrap_or_default();

    if command == "VERSION" {
        match serde_json::to_string(&VersionReply::current()) {
            Ok(reply) => {
                println!("{}", reply);
                return;
            }
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }

    std::process::exit(run(&command).await);
}

async fn run(command: &str) -> i32 {
    let conf = match read_netconf() {
        Ok(conf) => conf,
        Err(e) => return fail(e),
    };

    let args = match CmdArgs::from_env() {
        Ok(args) => args,
        Err(e) => return fail(TypedError::new("loading config", e)),
    };

    let plugin = match Plugin::new() {
        Ok(plugin) => plugin,
        Err(e) => return fail(TypedError::new("initializing netlink", e)),
    };

    match command {
        "ADD" => match plugin.cmd_add(&args, &conf).await {
            Ok(result) => match serde_json::to_string(&result) {
                Ok(payload) => {
                    println!("{}", payload);
                    0
                }
                Err(e) => fail(TypedError::new("printing result", e)),
            },
            Err(e) => fail(e),
        },
        "DEL" => match plugin.cmd_del(&args, &conf).await {
            Ok(()) => 0,
            Err(e) => fail(e),
        },
        other => fail(TypedError::new(
            "loading config",
            format!("unknown CNI_COMMAND: {:?}", other),
        )),
    }
}

fn read_netconf() -> Result<NetConf, TypedError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| TypedError::new("loading config", e))?;
    serde_json::from_str(&input).map_err(|e| TypedError::new("loading config", e))
}

/// Print the error object on stdout for the runtime; the exit code signals
/// failure.
fn fail(err: TypedError) -> i32 {
    match serde_json::to_string(&err) {
        Ok(payload) => println!("{}", payload),
        Err(_) => println!(
            "{{\"code\": 100, \"msg\": \"{}\", \"details\": \"\"}}",
            err.msg
        ),
    }
    1
}
