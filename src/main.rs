use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use mbus_master::constants::MBUS_CONTROL_INFO_RESP_VARIABLE;
use mbus_master::logging::{init_logger, is_verbose, log_error, log_info, log_warn, set_verbose};
use mbus_master::mbus::frame::frame_dump;
use mbus_master::mbus::serial::{MIN_BAUDRATE, STANDARD_BAUDRATES};
use mbus_master::payload::{id_to_manufacturer, parse_variable_data};
use mbus_master::util::hex::encode_hex_upper;
use mbus_master::{AddressSource, MBusFrame, MBusMaster, SerialConfig, SerialTransport};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "mbus-master", version)]
#[command(about = "Interactive wired M-Bus master: scan, probe and address devices")]
struct Cli {
    /// Trace every frame sent and received
    #[arg(short, long)]
    debug: bool,

    /// Serial line speed
    #[arg(short, long, default_value_t = 2400)]
    baudrate: u32,

    /// Read commands from FILE instead of the terminal
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Print scan and probe results as JSON
    #[arg(short, long)]
    json: bool,

    /// Serial device of the M-Bus level converter
    device: String,
}

struct CommandSpec {
    name: &'static str,
    usage: &'static str,
    help: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "address",
        usage: "address <MASK|ADDR> <NEW_ADDR>",
        help: "Set the primary address of a device",
    },
    CommandSpec {
        name: "baud",
        usage: "baud <RATE>",
        help: "Change the serial line speed",
    },
    CommandSpec {
        name: "rate",
        usage: "rate <RATE>",
        help: "Alias of baud",
    },
    CommandSpec {
        name: "parity",
        usage: "parity",
        help: "Toggle between even and no parity",
    },
    CommandSpec {
        name: "request",
        usage: "request <ADDR|MASK> [ID]",
        help: "Request data, optionally print a single record",
    },
    CommandSpec {
        name: "probe",
        usage: "probe [MASK]",
        help: "Find devices by secondary address",
    },
    CommandSpec {
        name: "scan",
        usage: "scan",
        help: "Find devices by primary address",
    },
    CommandSpec {
        name: "debug",
        usage: "debug",
        help: "Toggle frame tracing",
    },
    CommandSpec {
        name: "help",
        usage: "help [CMD]",
        help: "List commands or show the usage of one",
    },
    CommandSpec {
        name: "quit",
        usage: "quit",
        help: "Exit",
    },
];

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Address { source: AddressSource, new_primary: u8 },
    Baud(u32),
    Parity,
    Request { source: AddressSource, record: Option<usize> },
    Probe(Option<String>),
    Scan,
    Debug,
    Help(Option<&'static CommandSpec>),
    Quit,
}

impl PartialEq for CommandSpec {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for CommandSpec {}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Resolves an exact name or a unique prefix.
fn lookup(word: &str) -> Result<&'static CommandSpec> {
    let word = word.to_ascii_lowercase();
    if let Some(spec) = COMMANDS.iter().find(|c| c.name == word) {
        return Ok(spec);
    }

    let candidates: Vec<&CommandSpec> = COMMANDS.iter().filter(|c| c.name.starts_with(&word)).collect();
    match candidates.as_slice() {
        [spec] => Ok(*spec),
        [] => bail!("unknown command '{word}', try 'help'"),
        many => bail!(
            "ambiguous command '{word}': {}",
            many.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
        ),
    }
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let spec = lookup(first)?;

    let usage = || anyhow!("usage: {}", spec.usage);
    let command = match (spec.name, args.as_slice()) {
        ("address", [source, new_primary]) => Command::Address {
            source: AddressSource::parse(source)?,
            new_primary: new_primary
                .parse()
                .with_context(|| format!("invalid primary address '{new_primary}'"))?,
        },
        ("baud" | "rate", [rate]) => Command::Baud(
            rate.parse()
                .with_context(|| format!("invalid baud rate '{rate}'"))?,
        ),
        ("parity", []) => Command::Parity,
        ("request", [source]) => Command::Request {
            source: AddressSource::parse(source)?,
            record: None,
        },
        ("request", [source, id]) => Command::Request {
            source: AddressSource::parse(source)?,
            record: Some(
                id.parse()
                    .with_context(|| format!("invalid record id '{id}'"))?,
            ),
        },
        ("probe", []) => Command::Probe(None),
        ("probe", [mask]) => Command::Probe(Some((*mask).to_string())),
        ("scan", []) => Command::Scan,
        ("debug", []) => Command::Debug,
        ("help", []) => Command::Help(None),
        ("help", [name]) => Command::Help(Some(lookup(name)?)),
        ("quit", []) => Command::Quit,
        _ => return Err(usage()),
    };

    Ok(Some(command))
}

/// Token of the operation currently running, if any. Shared with the
/// Ctrl-C handler.
type ActiveOperation = Arc<Mutex<Option<CancellationToken>>>;

struct Shell {
    master: MBusMaster<SerialTransport>,
    active: ActiveOperation,
    json: bool,
}

fn begin_operation(active: &ActiveOperation) -> CancellationToken {
    let token = CancellationToken::new();
    *active.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
    token
}

fn end_operation(active: &ActiveOperation) {
    *active.lock().unwrap_or_else(PoisonError::into_inner) = None;
}

impl Shell {
    /// Runs one command. Returns `false` when the shell should exit.
    async fn execute(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Address {
                source,
                new_primary,
            } => {
                self.master.reassign(&source, new_primary).await?;
                println!("Set primary address of device [{source}] to {new_primary}");
            }
            Command::Baud(rate) => self.master.transport_mut().set_baudrate(rate)?,
            Command::Parity => {
                let parity = self.master.transport_mut().toggle_parity()?;
                println!("Parity {parity:?}");
            }
            Command::Request { source, record } => {
                let reply = self.master.request(&source).await?;
                print_reply(&reply, record)?;
            }
            Command::Probe(mask) => {
                let cancel = begin_operation(&self.active);
                let result = self.master.probe(mask.as_deref(), &cancel).await;
                end_operation(&self.active);
                let registry = result?;

                if self.json {
                    println!("{}", serde_json::to_string_pretty(registry.devices())?);
                } else if registry.is_empty() {
                    println!("No devices found");
                } else {
                    for device in registry.iter() {
                        match device.primary_address() {
                            Some(primary) => {
                                println!("{}  primary {primary}", device.secondary_address())
                            }
                            None => println!("{}", device.secondary_address()),
                        }
                    }
                }
            }
            Command::Scan => {
                let cancel = begin_operation(&self.active);
                let result = self.master.scan(&cancel).await;
                end_operation(&self.active);
                let report = result?;

                if self.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    let found: Vec<String> = report.found().map(|a| a.to_string()).collect();
                    let collisions: Vec<String> =
                        report.collisions().map(|a| a.to_string()).collect();
                    println!("Found devices at: {}", found.join(" "));
                    if !collisions.is_empty() {
                        println!("Collisions at: {}", collisions.join(" "));
                    }
                    if report.cancelled {
                        println!("Scan cancelled after {} addresses", report.scanned);
                    }
                }
            }
            Command::Debug => {
                let verbose = !is_verbose();
                set_verbose(verbose);
                println!("Frame tracing {}", if verbose { "on" } else { "off" });
            }
            Command::Help(None) => {
                for spec in COMMANDS {
                    println!("  {:<32} {}", spec.usage, spec.help);
                }
            }
            Command::Help(Some(spec)) => println!("usage: {}\n  {}", spec.usage, spec.help),
            Command::Quit => return Ok(false),
        }

        Ok(true)
    }
}

fn print_reply(reply: &MBusFrame, record: Option<usize>) -> Result<()> {
    if reply.control_information != MBUS_CONTROL_INFO_RESP_VARIABLE {
        println!("{}", frame_dump(reply));
        return Ok(());
    }

    let (header, records) = parse_variable_data(&reply.data)?;

    if let Some(id) = record {
        let value = records
            .get(id)
            .ok_or_else(|| anyhow!("record {id} not present, device sent {}", records.len()))?
            .value_u32()
            .ok_or_else(|| anyhow!("record {id} is not an integer record"))?;
        println!("Record ID {id} = {value}");
        return Ok(());
    }

    println!("Identification  : {}", header.identification());
    println!(
        "Manufacturer    : {} (0x{:04X})",
        id_to_manufacturer(header.manufacturer_id()),
        header.manufacturer_id()
    );
    println!("Version         : 0x{:02X}", header.version());
    println!("Medium          : 0x{:02X}", header.medium());
    println!("Access number   : {}", header.access_number);
    println!("Status          : 0x{:02X}", header.status);
    for (i, r) in records.iter().enumerate() {
        let value = r
            .value_u32()
            .map(|v| v.to_string())
            .unwrap_or_else(|| encode_hex_upper(&r.data));
        println!("Record {i:<3} DIF 0x{:02X} VIF 0x{:02X}  {value}", r.dif, r.vif);
    }

    Ok(())
}

/// Where shell commands come from.
enum LineSource {
    /// Terminal lines, read on a plain thread so a pending read never holds
    /// up runtime shutdown.
    Terminal(mpsc::Receiver<io::Result<String>>),
    File(Lines<BufReader<tokio::fs::File>>),
}

impl LineSource {
    fn terminal() -> Self {
        let (tx, rx) = mpsc::channel(1);
        std::thread::spawn(move || {
            for line in io::stdin().lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        LineSource::Terminal(rx)
    }

    async fn file(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(LineSource::File(BufReader::new(file).lines()))
    }

    /// `None` at end of input.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        match self {
            LineSource::Terminal(rx) => rx.recv().await.transpose(),
            LineSource::File(lines) => lines.next_line().await,
        }
    }
}

/// Ctrl-C cancels the running operation, or quits when idle.
fn spawn_interrupt_handler(active: ActiveOperation, shutdown: CancellationToken) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            let running = active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match running {
                Some(token) => {
                    log_warn("interrupted, cancelling");
                    token.cancel();
                }
                None => {
                    shutdown.cancel();
                    break;
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.debug);

    if cli.baudrate < MIN_BAUDRATE {
        bail!("baud rate {} too low, minimum is {MIN_BAUDRATE}", cli.baudrate);
    }
    if !STANDARD_BAUDRATES.contains(&cli.baudrate) {
        warn!(
            "baud rate {} not recommended by M-Bus standard",
            cli.baudrate
        );
    }

    let config = SerialConfig {
        baudrate: cli.baudrate,
        ..SerialConfig::default()
    };
    let transport = SerialTransport::connect_with_config(&cli.device, config)
        .await
        .with_context(|| format!("failed to open {}", cli.device))?;

    let active: ActiveOperation = Arc::new(Mutex::new(None));
    let shutdown = CancellationToken::new();
    spawn_interrupt_handler(active.clone(), shutdown.clone());

    let interactive = cli.file.is_none();
    let mut lines = match &cli.file {
        Some(path) => LineSource::file(path).await?,
        None => LineSource::terminal(),
    };

    let mut shell = Shell {
        master: MBusMaster::new(transport),
        active,
        json: cli.json,
    };
    log_info(&format!("M-Bus master on {}, type 'help' for commands", cli.device));

    let mut stdout = tokio::io::stdout();
    loop {
        if interactive {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;
        }

        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };

        match shell.execute(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => log_error(&format!("{e:#}")),
        }
    }

    info!("bye");
    Ok(())
}
