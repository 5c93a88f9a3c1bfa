//! Bring-up harness: attach controllers described by option strings, start
//! the shared card-detect worker and report what the slots negotiate.
//!
//! Each command-line argument is one controller option string, e.g.
//!
//! ```text
//! sdmmc_manager "verbose=3,hc=sdhci,addr=0xFE340000,irq=35,bw=8,emmc"
//! ```
//!
//! The register window named by `addr=` must already be mapped by the
//! platform (identity-mapped on the boards this runs on).

use std::process::ExitCode;
use std::time::Duration;

use log::{error, info, warn, Level, LevelFilter, Metadata, Record};

use sdmmc_hal::SdhciHost;
use sdmmc_protocol::sdmmc::event::CardDetectPoller;
use sdmmc_protocol::sdmmc::registry::SdmmcRegistry;
use sdmmc_protocol::sdmmc::{CardEvent, SdmmcConfig};
use sdmmc_protocol::sdmmc_traits::SdmmcHardware;

/// Severity-gated stderr sink behind the `log` facade.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: sdmmc_manager <options>[ <options>...]");
        eprintln!("  options: verbose=N,priority=N,hc=FAMILY,vid=N,did=N,idx=N,addr=N,");
        eprintln!("           irq=N,dma=N,clk=N,bw=N,timing=T,~bmstr,~ac12,~ac23,");
        eprintln!("           pm=IDLE:SLEEP,bs=STR,emmc");
        return ExitCode::FAILURE;
    }

    let configs: Vec<SdmmcConfig> = match args.iter().map(|a| SdmmcConfig::parse(a)).collect() {
        Ok(configs) => configs,
        Err(e) => {
            eprintln!("bad option string: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    let max_verbose = configs.iter().map(|c| c.verbose).max().unwrap_or(0);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(match max_verbose {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 | 4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    let registry = SdmmcRegistry::new();

    for (slot, config) in configs.into_iter().enumerate() {
        let Some(base) = config.base_addr else {
            error!(target: "sdmmc", "slot {}: addr= is required", slot);
            return ExitCode::FAILURE;
        };
        let family = config.host_family.as_deref().unwrap_or("sdhci");
        let hardware: Box<dyn SdmmcHardware + Send> = match family {
            // Poll card detect when no interrupt line was provided.
            "sdhci" => Box::new(SdhciHost::new(base, config.irq.is_none())),
            other => {
                error!(target: "sdmmc", "slot {}: unknown host family {}", slot, other);
                return ExitCode::FAILURE;
            }
        };

        match registry.attach(config, hardware) {
            Ok(controller) => {
                controller.set_card_hook(Box::new(move |event| match event {
                    CardEvent::Inserted => info!(target: "sdmmc", "slot {}: card inserted", slot),
                    CardEvent::Removed => info!(target: "sdmmc", "slot {}: card removed", slot),
                }));
            }
            Err(e) => {
                error!(target: "sdmmc", "slot {}: attach failed: {:?}", slot, e);
                return ExitCode::FAILURE;
            }
        }
    }

    let poller = CardDetectPoller::spawn(registry.clone(), Duration::from_millis(500));

    // Seed the non-removable/already-inserted slots.
    for controller in registry.controllers() {
        match controller.poll_card_detect() {
            Ok(present) => controller.card_event(present),
            Err(e) => warn!(target: "sdmmc", "card detect: {:?}", e),
        }
    }

    info!(target: "sdmmc", "{} controller(s) attached", registry.len());

    // Report negotiated state once bring-up settles, then keep serving
    // detect events until killed.
    std::thread::sleep(Duration::from_secs(2));
    for (slot, controller) in registry.controllers().iter().enumerate() {
        match (controller.card_state(), controller.card_sectors()) {
            (Some(state), Some(sectors)) => info!(
                target: "sdmmc",
                "slot {}: {:?} x{} lanes, {} MiB",
                slot,
                state.timing,
                state.bus_width.lanes(),
                sectors / 2048
            ),
            _ => info!(target: "sdmmc", "slot {}: no card", slot),
        }
    }

    // The poller owns the detect loop; keep it alive for the process
    // lifetime.
    let _poller = poller;
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
