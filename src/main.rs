use clap::Parser;
use log::{error, info};
use rssi_logger::app::{self, Exit, Options, RunError};
use rssi_logger::power::Suspender;
use rssi_logger::scanner;
use rssi_logger::time_source::{SntpTimeSource, TimeSource};
use std::panic::{self, PanicHookInfo};
use std::pin::pin;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr at info level, or debug with `--verbose`. `RUST_LOG` wins.
fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();
}

/// Completes on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            error!("cannot listen for SIGTERM: {e}");
            None
        }
    };
    let terminated = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
        _ = terminated => {}
    }
}

/// Open the radio and run scan cycles until interrupted.
///
/// A suspend returns here if it was interrupted, which is a clean stop, or if
/// restarting the process failed.
///
/// # Errors
/// Returns `RunError` if the options are inconsistent, the Bluetooth adapter
/// cannot be opened, or a suspend cannot be carried out.
async fn run(options: Options) -> Result<(), RunError> {
    options.validate()?;

    let suspender = Suspender::new(options.resume_marker.clone());
    let reset_cause = suspender.detect_reset_cause();

    let mut sntp = options.ntp_server.as_deref().map(SntpTimeSource::new);
    let time_source = sntp.as_mut().map(|s| s as &mut dyn TimeSource);

    let mut radio = scanner::open(options.backend).await?;
    info!("using {} backend", options.backend);

    // One listener for the whole process: the cycle and the suspend both stop on it.
    let mut shutdown = pin!(shutdown_signal());

    let exit = app::run(
        options,
        radio.as_mut(),
        reset_cause,
        time_source,
        shutdown.as_mut(),
    )
    .await;

    // Release the adapter before sleeping so nothing stays registered.
    drop(radio);

    match exit {
        Exit::Stopped => Ok(()),
        Exit::Suspend(duration) => {
            suspender.suspend(duration, shutdown).await?;
            info!("stopped while suspended");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    match run(options).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
