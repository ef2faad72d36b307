//! Scan cycle controller.
//!
//! This module is decoupled from the radio, the network and process exit
//! codes so the whole cycle can be driven deterministically in tests with a
//! scripted scan provider and paused time.
//!
//! One cycle is: scan for the configured duration while folding observations
//! into the [`SignalAggregator`], flush one record per heard device to the
//! log, save the clock, reset the aggregator, then sleep. A preserving sleep
//! keeps all state and loops; a suspending sleep hands control back to the
//! caller, which restarts the process after the interval.

use crate::advertising::{Advertisement, MAX_LEGACY_PAYLOAD, parse_local_name};
use crate::aggregator::SignalAggregator;
use crate::clock::{self, Rtc};
use crate::duration::parse_duration;
use crate::output::LogWriter;
use crate::power::{ResetCause, SuspendError};
use crate::record::SignalRecord;
use crate::scanner::{Backend, Observation, ScanError, ScanParams, ScanProvider};
use crate::time_source::TimeSource;
use crate::whitelist::{self, ConfigurationWarning, Whitelist, WhitelistMode};
use clap::Parser;
use log::{Level, debug, error, info, log_enabled, warn};
use std::future::Future;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::pin::{Pin, pin};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Manufacturer data bytes given as hex on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexBytes(pub Vec<u8>);

/// Parse a hex string such as `01020304` into bytes.
pub fn parse_hex_bytes(src: &str) -> Result<HexBytes, String> {
    let src = src.trim();
    if src.len() % 2 != 0 {
        return Err(format!("odd number of hex digits: {src}"));
    }
    (0..src.len())
        .step_by(2)
        .map(|i| {
            src.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex: {src}"))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(HexBytes)
}

/// Parse a 16-bit service UUID such as `180D` or `0x180D`.
pub fn parse_uuid16(src: &str) -> Result<u16, String> {
    let src = src.trim();
    let digits = src
        .strip_prefix("0x")
        .or_else(|| src.strip_prefix("0X"))
        .unwrap_or(src);
    u16::from_str_radix(digits, 16).map_err(|_| format!("invalid 16-bit UUID: {src}"))
}

/// Deploy-time configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Local name to advertise while scanning.
    #[arg(long, default_value = "CHR000001")]
    pub device_name: String,

    /// Track every device instead of only whitelisted address prefixes.
    #[arg(long = "no-whitelist")]
    pub no_whitelist: bool,

    /// Extra address prefix to track, merged with the whitelist file.
    /// Format: --prefix E4:B3:23
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefixes: Vec<String>,

    /// File with one address or address prefix per line.
    #[arg(long, default_value = "whitelist.txt")]
    pub whitelist_file: PathBuf,

    /// Append-only record log.
    #[arg(long, default_value = "bt_strongest_signals.txt")]
    pub log_file: PathBuf,

    /// File holding the last saved clock value in epoch seconds.
    #[arg(long, default_value = "rtc_time.txt")]
    pub clock_file: PathBuf,

    /// Marker file written before a suspend.
    #[arg(long, default_value = ".rssi-logger-suspended")]
    pub resume_marker: PathBuf,

    /// Length of each scan window.
    /// Accepts duration with suffix: 5000ms, 5s, 10000us.
    #[arg(long, default_value = "5000ms", value_parser = parse_duration)]
    pub scan_duration: Duration,

    /// Radio scan interval.
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub scan_interval: Duration,

    /// Radio scan window, at most the scan interval.
    #[arg(long, default_value = "50ms", value_parser = parse_duration)]
    pub scan_window: Duration,

    /// Time between the end of one scan window and the start of the next.
    #[arg(long, default_value = "55s", value_parser = parse_duration)]
    pub inter_scan: Duration,

    /// Suspend between scans instead of waiting; only the clock survives.
    #[arg(long)]
    pub suspend: bool,

    /// SNTP server used to set the clock at power-on, as host or host:port.
    #[arg(long, value_name = "HOST")]
    pub ntp_server: Option<String>,

    /// Give up on time sync after this long.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub ntp_timeout: Duration,

    /// 16-bit service UUID to advertise (hex).
    #[arg(
        long = "service-uuid",
        value_name = "UUID",
        value_parser = parse_uuid16,
        default_values = ["180D", "181C"]
    )]
    pub service_uuids: Vec<u16>,

    /// Manufacturer data to advertise (hex, company ID first, little-endian).
    #[arg(long, value_parser = parse_hex_bytes, default_value = "01020304")]
    pub manufacturer_data: HexBytes,

    /// Advertising interval.
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub advertise_interval: Duration,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Verbose output, log every record and strongest-signal update
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn whitelist_mode(&self) -> WhitelistMode {
        WhitelistMode::from(!self.no_whitelist)
    }

    pub fn sleep_mode(&self) -> SleepMode {
        if self.suspend {
            SleepMode::Suspending
        } else {
            SleepMode::Preserving
        }
    }

    pub fn scan_params(&self) -> ScanParams {
        ScanParams {
            duration: self.scan_duration,
            interval: self.scan_interval,
            window: self.scan_window,
        }
    }

    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            name: self.device_name.clone(),
            service_uuids: self.service_uuids.clone(),
            manufacturer_data: self.manufacturer_data.0.clone(),
        }
    }

    /// Reject combinations no radio can run.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.scan_window > self.scan_interval {
            return Err(RunError::InvalidOptions(format!(
                "scan window {:?} is longer than scan interval {:?}",
                self.scan_window, self.scan_interval
            )));
        }
        if self.scan_duration.is_zero() {
            return Err(RunError::InvalidOptions("scan duration is zero".into()));
        }
        let payload = self.advertisement().payload().len();
        if payload > MAX_LEGACY_PAYLOAD {
            return Err(RunError::InvalidOptions(format!(
                "advertising payload is {payload} bytes, at most {MAX_LEGACY_PAYLOAD} fit"
            )));
        }
        Ok(())
    }
}

/// Errors that stop the process. Nothing inside a running cycle is fatal.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("{0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Suspend(#[from] SuspendError),
}

/// How to spend the time between scan windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepMode {
    /// Wait in-process; all state is kept.
    Preserving,
    /// Save the clock and suspend; all other state is lost.
    Suspending,
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Scanning,
    Flushing,
    Sleeping,
    Stopped,
}

/// Why the controller returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Interrupted; the radio is idle.
    Stopped,
    /// A suspending sleep of this length is due. The clock was saved at the
    /// end of the last window and the radio is idle.
    Suspend(Duration),
}

/// State rebuilt from durable storage at every start.
#[derive(Debug, Clone)]
pub struct Session {
    pub reset_cause: ResetCause,
    pub whitelist: Whitelist,
    pub rtc: Rtc,
}

/// Load the whitelist and clock, and on power-on try to sync the clock.
///
/// Never fails: every problem degrades to an empty whitelist or the best
/// clock value available, and is logged.
pub async fn startup(
    options: &Options,
    reset_cause: ResetCause,
    time_source: Option<&mut dyn TimeSource>,
) -> Session {
    let whitelist = load_whitelist(options);

    let mut rtc = Rtc::default();
    clock::restore(&mut rtc, &options.clock_file);

    // The clock was saved before the suspend and did not run during it.
    if let ResetCause::SuspendResume { slept } = reset_cause {
        rtc.advance(slept);
        info!("resumed after {slept:?} suspended, clock now {}", rtc.now());
    }

    match (reset_cause, time_source) {
        (ResetCause::PowerOn, Some(source)) => {
            match clock::set_from_time_source(&mut rtc, source, options.ntp_timeout).await {
                Ok(now) => {
                    info!("clock synchronised: {now}");
                    if let Err(e) = clock::save(&rtc, &options.clock_file) {
                        warn!("cannot save clock: {e}");
                    }
                }
                Err(e) => warn!("time sync failed: {e}, keeping {}", rtc.now()),
            }
        }
        (ResetCause::PowerOn, None) => debug!("no time source configured"),
        (ResetCause::SuspendResume { .. }, _) => debug!("skipping time sync on resume"),
    }

    Session {
        reset_cause,
        whitelist,
        rtc,
    }
}

fn load_whitelist(options: &Options) -> Whitelist {
    if options.whitelist_mode() == WhitelistMode::Disabled {
        info!("whitelist disabled, tracking all devices");
        return Whitelist::default();
    }

    let (mut whitelist, warning) = whitelist::load(&options.whitelist_file);
    whitelist.extend(&options.prefixes);

    if let Some(unreadable @ ConfigurationWarning::Unreadable(_)) = &warning {
        warn!("{unreadable}");
    }
    if whitelist.is_empty() {
        warn!("{}", ConfigurationWarning::Empty);
    } else {
        info!("tracking {} whitelist entries", whitelist.len());
    }
    whitelist
}

/// Drives the scan, flush and sleep cycle against one scan provider.
pub struct Controller<'a> {
    options: Options,
    scanner: &'a mut dyn ScanProvider,
    whitelist: Whitelist,
    mode: WhitelistMode,
    rtc: Rtc,
    aggregator: SignalAggregator,
    log: LogWriter,
    state: CycleState,
    windows: u64,
}

impl<'a> Controller<'a> {
    pub fn new(options: Options, scanner: &'a mut dyn ScanProvider, session: Session) -> Self {
        let mode = options.whitelist_mode();
        let aggregator = SignalAggregator::new(&session.whitelist, mode);
        let log = LogWriter::new(options.log_file.clone());
        debug!(
            "starting cycles after {:?} with clock at {}",
            session.reset_cause,
            session.rtc.now()
        );
        Self {
            options,
            scanner,
            whitelist: session.whitelist,
            mode,
            rtc: session.rtc,
            aggregator,
            log,
            state: CycleState::Idle,
            windows: 0,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn rtc(&self) -> &Rtc {
        &self.rtc
    }

    /// Run cycles until `shutdown` completes or a suspending sleep is due.
    pub async fn run<F>(&mut self, shutdown: F) -> Exit
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = pin!(shutdown);
        self.start_advertising().await;

        loop {
            if self.scan_window(&mut shutdown).await.is_break() {
                return self.stop().await;
            }

            self.flush();
            self.save_clock();

            self.state = CycleState::Sleeping;
            self.aggregator.reset(&self.whitelist, self.mode);

            match self.options.sleep_mode() {
                SleepMode::Suspending => return self.prepare_suspend().await,
                SleepMode::Preserving => {
                    debug!("idling for {:?}", self.options.inter_scan);
                    tokio::select! {
                        biased;
                        _ = shutdown.as_mut() => return self.stop().await,
                        _ = tokio::time::sleep(self.options.inter_scan) => {}
                    }
                }
            }
        }
    }

    async fn start_advertising(&mut self) {
        let advertisement = self.options.advertisement();
        match self
            .scanner
            .begin_advertise(self.options.advertise_interval, &advertisement)
            .await
        {
            Ok(()) => info!("broadcasting as '{}'", advertisement.name),
            Err(e) => warn!("cannot advertise: {e}"),
        }
    }

    /// Scan for one window. Breaks if `shutdown` fired.
    async fn scan_window<F>(&mut self, shutdown: &mut Pin<&mut F>) -> ControlFlow<()>
    where
        F: Future<Output = ()>,
    {
        self.state = CycleState::Scanning;
        self.windows += 1;
        let params = self.options.scan_params();
        info!("scan window {} for {:?}", self.windows, params.duration);

        let mut events = match self.scanner.begin_scan(params).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!("cannot start scan: {e}");
                None
            }
        };

        // The window is wall-clock time; the radio may close the channel early.
        let window = tokio::time::sleep(params.duration);
        let mut window = pin!(window);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => {
                    self.end_scan(events).await;
                    return ControlFlow::Break(());
                }
                _ = &mut window => break,
                observation = next_observation(&mut events) => match observation {
                    Some(observation) => self.on_observation(observation),
                    None => events = None,
                },
            }
        }

        self.end_scan(events).await;
        ControlFlow::Continue(())
    }

    fn on_observation(&mut self, observation: Observation) {
        let changed = self.aggregator.observe(
            observation.address,
            observation.rssi,
            &self.whitelist,
            self.mode,
        );
        if changed && log_enabled!(Level::Debug) {
            debug!(
                "{} now strongest at {} dBm ({})",
                observation.address,
                observation.rssi,
                parse_local_name(&observation.adv_data).unwrap_or_default()
            );
        }
    }

    /// Deregister the sink and stop the radio before anything reads the table.
    async fn end_scan(&mut self, events: Option<mpsc::Receiver<Observation>>) {
        drop(events);
        if let Err(e) = self.scanner.stop_scan().await {
            warn!("cannot stop scan: {e}");
        }
    }

    /// Append one record per heard device. Returns the number written.
    fn flush(&mut self) -> usize {
        self.state = CycleState::Flushing;
        let entries = self.aggregator.drain();
        let mut written = 0;

        for (mac, rssi) in entries {
            let record = SignalRecord {
                mac,
                rssi,
                timestamp: self.rtc.now(),
            };
            match self.log.append(&record) {
                Ok(()) => {
                    written += 1;
                    debug!("logged {mac},{rssi}");
                }
                Err(e) => error!("dropping record for {mac}: {e}"),
            }
        }

        info!(
            "window {}: logged {} device(s) to {}",
            self.windows,
            written,
            self.log.path().display()
        );
        written
    }

    fn save_clock(&self) {
        if let Err(e) = clock::save(&self.rtc, &self.options.clock_file) {
            error!("cannot save clock: {e}");
        }
    }

    async fn quiesce_radio(&mut self) {
        if let Err(e) = self.scanner.stop_scan().await {
            warn!("cannot stop scan: {e}");
        }
        if let Err(e) = self.scanner.stop_advertise().await {
            warn!("cannot stop advertising: {e}");
        }
    }

    async fn prepare_suspend(&mut self) -> Exit {
        self.quiesce_radio().await;
        Exit::Suspend(self.options.inter_scan)
    }

    async fn stop(&mut self) -> Exit {
        info!("stopping scanning and logging");
        self.quiesce_radio().await;
        self.save_clock();
        self.state = CycleState::Stopped;
        Exit::Stopped
    }
}

async fn next_observation(events: &mut Option<mpsc::Receiver<Observation>>) -> Option<Observation> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Load state, then run the controller until interrupted or suspended.
pub async fn run<F>(
    options: Options,
    scanner: &mut dyn ScanProvider,
    reset_cause: ResetCause,
    time_source: Option<&mut dyn TimeSource>,
    shutdown: F,
) -> Exit
where
    F: Future<Output = ()>,
{
    let session = startup(&options, reset_cause, time_source).await;
    Controller::new(options, scanner, session).run(shutdown).await
}
