pub mod config;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    core::{
        cleanup::{AbortSignal, SlaveRegistry},
        matrix::MatrixDriver,
        report::ConsoleReporter,
        rotation::RotationEngine,
        types::{Parity, ProtocolMode},
    },
    protocol::{diagslave::DiagslaveLauncher, modpoll::ModpollClient},
    utils::ports::{enumerate_ports, missing_ports},
};

pub use config::HarnessConfig;

/// Process exit status when every operation passed.
pub const EXIT_PASS: i32 = 0;
/// Process exit status when at least one operation failed.
pub const EXIT_FAIL: i32 = 1;
/// Process exit status after an operator interrupt.
pub const EXIT_ABORTED: i32 = 130;

/// Build the command line interface.
pub fn command() -> Command {
    Command::new("busprobe")
        .about("Round-robin RS-485 / Modbus RTU bus verification")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Load settings from a JSON or TOML file")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Serial port on the bus; repeat for every port, in address order")
                .value_name("PORT")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .help("Baud rate to test; repeat to sweep several (run lowest first)")
                .value_name("BAUD")
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("start-register")
                .long("start-register")
                .help("First holding register of the test range")
                .value_name("ADDR")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("count")
                .long("count")
                .help("Number of registers written and read back")
                .value_name("N")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .help("Master tool response timeout in milliseconds")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .help("Serial parity: none, even, odd")
                .value_name("PARITY")
                .value_parser(|s: &str| s.parse::<Parity>().map_err(|e| e.to_string())),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .help("Modbus framing: rtu, ascii")
                .value_name("MODE")
                .value_parser(|s: &str| s.parse::<ProtocolMode>().map_err(|e| e.to_string())),
        )
        .arg(
            Arg::new("settle-ms")
                .long("settle-ms")
                .help("Delay after starting slaves before the first request")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("stop-timeout-ms")
                .long("stop-timeout-ms")
                .help("How long to wait for a stopped slave to exit")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("tool-dir")
                .long("tool-dir")
                .help("Directory holding modpoll/<arch>/modpoll and diagslave/<arch>/diagslave")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("machine")
                .long("machine")
                .help("Machine name used to pick tool binaries (default: uname -m)")
                .value_name("MACHINE"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Append log records to this file instead of stderr")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dump-config")
                .long("dump-config")
                .help("Print the effective configuration as JSON and exit")
                .action(ArgAction::SetTrue),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}

/// Load the config file (if any) and apply command line overrides on top.
pub fn effective_config(matches: &ArgMatches) -> Result<HarnessConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    };

    if let Some(ports) = matches.get_many::<String>("port") {
        config.ports = ports.cloned().collect();
    }
    if let Some(bauds) = matches.get_many::<u32>("baud") {
        config.baud_rates = bauds.copied().collect();
    }
    if let Some(start) = matches.get_one::<u16>("start-register") {
        config.start_register = *start;
    }
    if let Some(count) = matches.get_one::<u16>("count") {
        config.count = *count;
    }
    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        config.timeout_ms = *timeout;
    }
    if let Some(parity) = matches.get_one::<Parity>("parity") {
        config.parity = *parity;
    }
    if let Some(mode) = matches.get_one::<ProtocolMode>("mode") {
        config.mode = *mode;
    }
    if let Some(settle) = matches.get_one::<u64>("settle-ms") {
        config.settle_ms = *settle;
    }
    if let Some(grace) = matches.get_one::<u64>("stop-timeout-ms") {
        config.stop_timeout_ms = *grace;
    }
    if let Some(dir) = matches.get_one::<PathBuf>("tool-dir") {
        config.tool_dir = dir.clone();
    }
    if let Some(machine) = matches.get_one::<String>("machine") {
        config.machine = Some(machine.clone());
    }

    config.validate()?;
    Ok(config)
}

/// First interrupt asks the engine to wind down; a second one kills every
/// live slave and exits immediately.
pub fn install_interrupt_handler(abort: AbortSignal, registry: SlaveRegistry) -> Result<()> {
    let presses = Arc::new(AtomicUsize::new(0));
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("Interrupted, stopping slaves (press Ctrl-C again to force)...");
            abort.trigger();
        } else {
            registry.kill_all();
            std::process::exit(EXIT_ABORTED);
        }
    })
    .context("installing Ctrl-C handler")
}

/// Execute the action selected on the command line and return the process
/// exit status.
pub async fn run(matches: &ArgMatches) -> Result<i32> {
    if matches.get_flag("list-ports") {
        for (name, kind) in enumerate_ports()? {
            println!("{name}\t{kind}");
        }
        return Ok(EXIT_PASS);
    }

    let config = effective_config(matches)?;
    if matches.get_flag("dump-config") {
        println!("{}", config.to_json()?);
        return Ok(EXIT_PASS);
    }

    let missing = missing_ports(&config.ports);
    if !missing.is_empty() {
        log::warn!("Ports not present on this host: {missing:?}");
    }

    let tools = config.tool_paths();
    log::info!(
        "Using master tool {} and slave tool {}",
        tools.master.display(),
        tools.slave.display()
    );

    let abort = AbortSignal::new();
    let registry = SlaveRegistry::new();
    install_interrupt_handler(abort.clone(), registry.clone())?;

    let engine = RotationEngine::new(
        Arc::new(DiagslaveLauncher::new(tools.slave, registry)),
        Arc::new(ModpollClient::new(tools.master)),
        Arc::new(ConsoleReporter),
        config.rotation_settings(),
        abort,
    );
    let outcome = MatrixDriver::new(engine)
        .run(&config.ports, &config.baud_sweep())
        .await;

    let summary = &outcome.summary;
    Ok(if summary.aborted {
        EXIT_ABORTED
    } else if summary.all_passed() {
        EXIT_PASS
    } else {
        EXIT_FAIL
    })
}
