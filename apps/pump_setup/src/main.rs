use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use commissioning::{cancellation, CommissioningSession, DeviceIdentity, NextSetupStep};
use pump_sim::{PumpMemory, SimulatedPump};
use shared::domain::{PumpModel, RegionCode, RemoteId};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::load_settings;

/// Commission a pump against the built-in pump simulator.
#[derive(Parser, Debug)]
#[command(name = "pump_setup", version)]
struct Args {
    /// Six-digit serial number from the back of the pump.
    #[arg(long)]
    pump_id: Option<String>,
    /// Region code from the pump label (NA, CA or WW).
    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    exchange_timeout_ms: Option<u64>,
    /// Model number the simulated pump reports.
    #[arg(long, default_value = "522")]
    sim_model: String,
    /// Region code the simulated pump is built for; defaults to --region.
    #[arg(long)]
    sim_region: Option<String>,
    #[arg(long)]
    sim_other_devices_enabled: bool,
    #[arg(long)]
    sim_other_device_id: Vec<String>,
    /// Pre-populate remote control slot 0 on the simulated pump.
    #[arg(long)]
    sim_remote_configured: bool,
    #[arg(long, default_value_t = 0)]
    sim_latency_ms: u64,
    /// Keep the simulated pump from reporting its clock time zone.
    #[arg(long)]
    sim_silent: bool,
    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(v) = &args.pump_id {
        settings.pump_id = Some(v.clone());
    }
    if let Some(v) = &args.region {
        settings.region_code = v.clone();
    }
    if let Some(v) = &args.color {
        settings.pump_color = v.clone();
    }
    if let Some(v) = args.exchange_timeout_ms {
        settings.exchange_timeout_ms = v;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&settings.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let region = settings.region()?;
    let pump_id = settings
        .pump_id
        .as_deref()
        .map(str::trim)
        .context("pump id is required (--pump-id, PUMP_ID or pump_setup.toml)")?;
    let identity = DeviceIdentity::new(pump_id, region.region()).context("invalid pump id")?;
    let options = settings.session_options()?;

    let pump = SimulatedPump::with_latency(
        simulated_memory(&args, region)?,
        Duration::from_millis(args.sim_latency_ms),
    );
    pump.set_reports_identity(!args.sim_silent);

    let (cancel, signal) = cancellation();
    let session = CommissioningSession::new(identity, options).with_cancellation(signal);
    pump.attach(session.notifier()).await;
    info!(session_id = %session.session_id(), "pump_setup: starting commissioning");

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("pump_setup: interrupt received, cancelling after current exchange");
            cancel.cancel();
        }
    });

    let outcome = session.run(pump.as_ref()).await;
    let result = match outcome.result {
        Ok(result) => result,
        Err(err) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome.device_state)?);
            }
            return Err(err).context("pump commissioning failed");
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let state = &result.manager_state;
    println!(
        "Commissioned pump {} (model {}, {}, {})",
        state.pump_id,
        state.pump_model,
        state.pump_region,
        state.pump_color.as_str()
    );
    println!(
        "Max basal {:.2} U/hr, max bolus {:.2} U, {} basal entries",
        result.settings.max_basal_units_per_hour,
        result.settings.max_bolus_units,
        result.settings.basal_schedule.entries.len()
    );
    match result.next_step() {
        NextSetupStep::ConfigureCompanion => {
            println!("Next: enable MySentry and pair a companion device on the pump")
        }
        NextSetupStep::Finish => println!("Next: finish setup"),
    }
    Ok(())
}

fn simulated_memory(args: &Args, region: RegionCode) -> Result<PumpMemory> {
    let model: PumpModel = args
        .sim_model
        .parse()
        .with_context(|| format!("invalid simulated model '{}'", args.sim_model))?;
    let sim_region = match &args.sim_region {
        Some(code) => code
            .parse::<RegionCode>()
            .with_context(|| format!("invalid simulated region '{code}'"))?,
        None => region,
    };

    let mut memory = PumpMemory::new(model, sim_region.region());
    memory.other_devices_enabled = args.sim_other_devices_enabled;
    memory.other_device_ids = args.sim_other_device_id.clone();
    if args.sim_remote_configured {
        memory.remote_ids[0] = Some(RemoteId([1, 2, 3, 4, 5, 6]));
    }
    Ok(memory)
}
