mod args;

use std::io::{self, Write};
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use args::Cli;
use clap::Parser;
use hcitap::{
    CancelHandle, Dispatcher, FramingError, HciError, HciPacket, MockTransport, Session,
};
use log::{error, info, warn, LevelFilter};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_sigint as usize;
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGINT, &sa, ptr::null_mut());
    }
}

/// Forward Ctrl-C to the dispatcher. The handler itself may only touch the atomic.
fn spawn_interrupt_watcher(cancel: CancelHandle) {
    let spawned = thread::Builder::new()
        .name("hcitap-sigint".into())
        .spawn(move || {
            while !cancel.is_cancelled() {
                if INTERRUPTED.load(Ordering::SeqCst) {
                    info!("Interrupted, stopping capture");
                    cancel.cancel();
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        });
    if let Err(err) = spawned {
        warn!("Ctrl-C will not stop the capture cleanly: {}", err);
    }
}

/// Process exit status for an error that ended the capture
fn exit_code(err: &HciError, fatal_framing: bool) -> i32 {
    match err {
        HciError::Framing(FramingError::OversizedPayload { .. }) => 2,
        HciError::Framing(e) if e.is_recoverable() && fatal_framing => 2,
        HciError::Framing(e) if e.is_recoverable() => 0,
        _ => 1,
    }
}

fn format_packet(packet: &HciPacket) -> String {
    format!(
        "{} {}",
        packet.packet_type().name(),
        hex::encode(packet.to_bytes())
    )
}

fn start(cli: &Cli) -> Result<Dispatcher, HciError> {
    let config = cli.session_config();
    match &cli.mock {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|err| HciError::Io(err.into()))?;
            let transport = MockTransport::from_hex_lines(&text).map_err(|err| {
                HciError::Io(io::Error::new(io::ErrorKind::InvalidData, err).into())
            })?;
            info!("Replaying {}", path.display());
            Dispatcher::start(Session::with_transport(transport, config)?)
        }
        None => Dispatcher::start(Session::open(&config)?),
    }
}

/// Print packets until the stream ends. Returns the exit status.
fn capture(dispatcher: &mut Dispatcher, fatal_framing: bool) -> i32 {
    let Some(stream) = dispatcher.stream() else {
        return 1;
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();

    for item in stream {
        match item {
            Ok(packet) => {
                log::debug!("{}", packet);
                if writeln!(out, "{}", format_packet(&packet)).is_err() {
                    // Output closed, e.g. piped into `head`
                    dispatcher.cancel();
                    return 0;
                }
            }
            Err(err) if !err.is_terminal() => {
                if fatal_framing {
                    error!("{}", err);
                    dispatcher.cancel();
                    return exit_code(&err, fatal_framing);
                }
                warn!("{}", err);
            }
            Err(err) => {
                error!("{}", err);
                return exit_code(&err, fatal_framing);
            }
        }
    }
    0
}

fn main() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .try_init();
    let cli = Cli::parse();

    // Before the filter is taken over, so Ctrl-C can never skip its restore
    install_sigint_handler();

    let mut dispatcher = match start(&cli) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            error!("Failed to start capture: {}", err);
            process::exit(1);
        }
    };

    spawn_interrupt_watcher(dispatcher.cancel_handle());

    let code = capture(&mut dispatcher, cli.fatal_framing);
    let report = dispatcher.shutdown();
    if report.filter_restored {
        info!("HCI filter restored");
    } else {
        warn!("HCI filter was not restored");
    }

    process::exit(code);
}
