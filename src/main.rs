#![deny(clippy::unwrap_used)]

use chrono::{DateTime, Local, Utc};
use clap::{arg, command, value_parser, ArgAction, ArgMatches};
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::pin;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::warn;

use scpictrl::negotiate::{any_line, negotiate, starts_with, NegotiationConfig, DEFAULT_SETTLE_DELAY};
use scpictrl::proto::framing::{DataBits, FramingConfig, Parity, StopBits};
use scpictrl::proto::response::Response;
use scpictrl::{ProtoError, Result, Session, SessionConfig, DEFAULT_CANDIDATE_BAUDRATES, DEFAULT_TTY};

#[tokio::main]
async fn main() {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(
                -p --device <PORT> "Port for USB adapter"
            )
            .default_value(DEFAULT_TTY)
            .required(false)
            .value_parser(value_parser!(PathBuf)),
        )
        .arg(arg!(
            -d --debug ... "Turn debugging information on"
        ))
        .arg(
            arg!(
                -b --baudrate <BAUDRATE> "Candidate baudrate, repeat to try several"
            )
            .required(false)
            .action(ArgAction::Append)
            .value_parser(value_parser!(u32)),
        )
        .arg(
            arg!(--parity <PARITY> "Parity (none, even, odd)")
                .default_value("none")
                .value_parser(value_parser!(Parity)),
        )
        .arg(
            arg!(--"stop-bits" <BITS> "Stop bits (1, 2)")
                .default_value("1")
                .value_parser(value_parser!(StopBits)),
        )
        .arg(
            arg!(--"data-bits" <BITS> "Byte size (7, 8)")
                .default_value("8")
                .value_parser(value_parser!(DataBits)),
        )
        .arg(
            arg!(--"timeout-ms" <MS> "Read and write timeout")
                .default_value("1000")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            arg!(--"settle-ms" <MS> "Delay after opening the port before probing")
                .default_value(DEFAULT_SETTLE_DELAY.as_millis().to_string())
                .value_parser(value_parser!(u64)),
        )
        .arg(arg!(--expect <PREFIX> "Expected start of the *IDN? reply, e.g. \"FLUKE, 8808A\"").required(false))
        .subcommand(clap::Command::new("ports").about("List serial ports"))
        .subcommand(clap::Command::new("ident").about("Device identification"))
        .subcommand(
            clap::Command::new("query")
                .about("Send commands one at a time and print the replies")
                .arg(arg!(<commands> ... "Commands, e.g. VAL1?")),
        )
        .subcommand(
            clap::Command::new("poll")
                .about("Repeat queries periodically")
                .arg(arg!(<commands> ... "Commands, e.g. VAL1? VAL2?"))
                .arg(
                    arg!(-i --interval <SECONDS> "Time between rounds")
                        .default_value("1")
                        .value_parser(parse_interval),
                )
                .arg(
                    arg!(-n --count <ROUNDS> "Stop after this many rounds")
                        .required(false)
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            clap::Command::new("monitor")
                .about("Print every line the device sends")
                .arg(
                    arg!(-s --send <COMMAND> "Command to send, repeat for a sequence")
                        .required(false)
                        .action(ArgAction::Append),
                )
                .arg(
                    arg!(--"gap-ms" <MS> "Pause after each sent command")
                        .default_value("3000")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    init_logging(matches.get_count("debug"));

    let port = matches
        .get_one::<PathBuf>("device")
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| DEFAULT_TTY.to_string());

    if let Err(e) = handle_args(&matches, &port).await {
        match e {
            ProtoError::LinkUnavailable { source, .. } => {
                if source.kind() == tokio_serial::ErrorKind::NoDevice
                    || matches!(source.kind(), tokio_serial::ErrorKind::Io(ErrorKind::NotFound))
                {
                    eprintln!("{}: File not found", port);
                } else {
                    eprintln!("{}: Port unavailable: {}", port, source);
                }
            }
            ProtoError::Serial(err) => {
                eprintln!("I/O Error: {} [device: {}]", err, port);
            }
            ProtoError::Io(err) => {
                if err.kind() == ErrorKind::NotFound {
                    eprintln!("{}: File not found", port);
                } else {
                    eprintln!("I/O Error: {} [device: {}]", err, port);
                }
            }
            ProtoError::NegotiationExhausted {
                attempted,
                last_failure,
                ..
            } => {
                eprintln!("No answer from device at {:?} baud ({})", attempted, last_failure);
                eprintln!("Check the cable and the interface settings of the device.");
            }
            ProtoError::ResponseTimeout { command, elapsed } => {
                eprintln!("Device did not answer {:?} within {:?}, aborting!", command, elapsed);
            }
            other => {
                eprintln!("{}", other);
            }
        }
        exit(-1);
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

fn negotiation_config(matches: &ArgMatches) -> NegotiationConfig {
    let timeout = Duration::from_millis(*matches.get_one::<u64>("timeout-ms").unwrap_or(&1000));
    let framing = FramingConfig {
        parity: matches.get_one::<Parity>("parity").copied().unwrap_or_default(),
        stop_bits: matches.get_one::<StopBits>("stop-bits").copied().unwrap_or_default(),
        data_bits: matches.get_one::<DataBits>("data-bits").copied().unwrap_or_default(),
        read_timeout: timeout,
        write_timeout: timeout,
        ..FramingConfig::default()
    };
    let candidates = matches
        .get_many::<u32>("baudrate")
        .map(|rates| rates.copied().collect())
        .unwrap_or_else(|| DEFAULT_CANDIDATE_BAUDRATES.to_vec());
    let validator = match matches.get_one::<String>("expect") {
        Some(prefix) => starts_with(prefix.clone()),
        None => any_line(),
    };
    let settle_delay = matches
        .get_one::<u64>("settle-ms")
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or(DEFAULT_SETTLE_DELAY);

    NegotiationConfig {
        candidates,
        validator,
        settle_delay,
        framing,
        ..NegotiationConfig::default()
    }
}

fn pretty_ts(ts: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = (*ts).into();
    local.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn print_response(response: &Response) {
    match &response.command {
        Some(command) => println!("{}\t{}\t{}", pretty_ts(&response.received_at), command.text, response.text),
        None => println!("{}\t{}", pretty_ts(&response.received_at), response.text),
    }
}

fn list_ports() -> Result<()> {
    let ports = tokio_serial::available_ports()?;
    if ports.is_empty() {
        eprintln!("No serial ports found");
    }
    for p in ports {
        match &p.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => println!(
                "{}\tUSB {:04x}:{:04x} {}",
                p.port_name,
                usb.vid,
                usb.pid,
                usb.product.as_deref().unwrap_or_default()
            ),
            _ => println!("{}", p.port_name),
        }
    }
    Ok(())
}

async fn handle_args(matches: &ArgMatches, port: &str) -> Result<()> {
    let negotiation = negotiation_config(matches);

    match matches.subcommand() {
        Some(("ports", _)) => list_ports()?,
        // Device ID
        Some(("ident", _)) => {
            let result = negotiate(port, &negotiation).await?;
            eprintln!("Connected to: {} ({})\n", port, result.framing);
            match result.ident() {
                Ok(ident) => {
                    println!("Manufacturer: {}", ident.manufacturer);
                    println!("Model: {}", ident.model);
                    println!("Serial: {}", ident.serial);
                    println!("Firmware: {}", ident.firmware);
                }
                Err(_) => println!("Identification: {}", result.identification),
            }
        }
        // One shot queries
        Some(("query", args)) => {
            let session = Session::open(port, &negotiation, SessionConfig::default()).await?;
            eprintln!("Connected to: {} ({})\n", port, session.framing());
            let commands: Vec<&String> = args.get_many::<String>("commands").into_iter().flatten().collect();
            let result = session.query_all(commands).await;
            session.close().await;
            for response in result? {
                println!("{}", response.text);
            }
        }
        // Periodic queries
        Some(("poll", args)) => {
            let session = Session::open(port, &negotiation, SessionConfig::default()).await?;
            eprintln!("Connected to: {} ({})\n", port, session.framing());
            let commands: Vec<String> = args
                .get_many::<String>("commands")
                .into_iter()
                .flatten()
                .cloned()
                .collect();
            let interval = args
                .get_one::<Duration>("interval")
                .copied()
                .unwrap_or(Duration::from_secs(1));
            let rounds = args.get_one::<u64>("count").copied();
            let result = poll(&session, &commands, interval, rounds).await;
            session.close().await;
            result?;
        }
        // Streamed output
        Some(("monitor", args)) => {
            let session = Arc::new(Session::open(port, &negotiation, SessionConfig::streaming()).await?);
            eprintln!("Connected to: {} ({})\n", port, session.framing());
            let commands: Vec<String> = args.get_many::<String>("send").into_iter().flatten().cloned().collect();
            let gap = Duration::from_millis(args.get_one::<u64>("gap-ms").copied().unwrap_or(3000));
            let result = monitor(session.clone(), commands, gap).await;
            session.close().await;
            result?;
        }
        _ => {
            unreachable!("subcommand is required")
        }
    }

    Ok(())
}

async fn poll(session: &Session, commands: &[String], interval: Duration, rounds: Option<u64>) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut done = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
        for command in commands {
            match session.send_command(command).await {
                Ok(response) => print_response(&response),
                // Skip this reading, the next round asks again.
                Err(ProtoError::ResponseTimeout { command, elapsed }) => {
                    eprintln!("No reply to {} within {:?}", command, elapsed)
                }
                Err(ProtoError::MalformedLine { raw, .. }) => eprintln!("Malformed reply: {:?}", raw),
                Err(e) => return Err(e),
            }
        }
        done += 1;
        if rounds.map(|n| done >= n).unwrap_or(false) {
            return Ok(());
        }
    }
}

async fn monitor(session: Arc<Session>, commands: Vec<String>, gap: Duration) -> Result<()> {
    let mut sender = {
        let session = session.clone();
        tokio::spawn(async move {
            for command in commands {
                session.send_line(&command).await?;
                eprintln!("Command sent: {}", command);
                tokio::time::sleep(gap).await;
            }
            Ok::<(), ProtoError>(())
        })
    };
    let mut sending = true;

    let feed = session.subscribe()?;
    let mut feed = pin!(feed);
    let result = loop {
        tokio::select! {
            item = feed.next() => match item {
                Some(Ok(response)) => print_response(&response),
                Some(Err(ProtoError::MalformedLine { raw, .. })) => eprintln!("Malformed line: {:?}", raw),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
            sent = &mut sender, if sending => match sent {
                Ok(Ok(())) => sending = false,
                Ok(Err(e)) => break Err(e),
                Err(e) => {
                    warn!(error = %e, "sender task failed");
                    sending = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };
    sender.abort();
    result
}

fn parse_interval(value: &str) -> std::result::Result<Duration, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{}", e))?;
    if seconds.is_nan() || seconds < 0.01 {
        return Err(format!("{} is not an interval of at least 0.01 s", value));
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string())
}
