use std::process::ExitCode;

use simkernel::{
    ActorSpec, HostId, KernelResult, SimConfig, SimulationBuilder, StaticPlatform,
};
use tracing_subscriber::EnvFilter;

const TASKS: u32 = 12;
const WORKERS: u32 = 3;
const STOP: u32 = u32::MAX;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    println!("═══════════════════════════════════════════════════════");
    println!("  simkernel — Deterministic Cooperative Execution");
    println!("  Master/worker demo: serial vs parallel contexts");
    println!("═══════════════════════════════════════════════════════");
    println!();

    // Extra run configured through SIMKERNEL_CONTEXTS and SIMKERNEL_WORKERS.
    let from_env = match SimConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("  ✗ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut hashes = Vec::new();
    for (label, config) in [
        ("serial", SimConfig::serial()),
        ("threads", SimConfig::threads()),
        ("parallel", SimConfig::parallel(4)),
        ("env", from_env),
    ] {
        match run_master_worker(label, config) {
            Ok(hash) => hashes.push((label, hash)),
            Err(e) => {
                eprintln!("  ✗ {} run failed: {}", label, e);
                return ExitCode::FAILURE;
            }
        }
    }

    // ── Verify ────────────────────────────────────────────────
    println!("  Verification:");
    for (label, hash) in &hashes {
        println!("    {:<9} log hash: {:016x}", label, hash);
    }
    let reference = hashes[0].1;
    if hashes.iter().all(|(_, h)| *h == reference) {
        println!("    ✓ Logs are IDENTICAL — every factory produced the same run.");
        ExitCode::SUCCESS
    } else {
        println!("    ✗ MISMATCH — determinism violation detected!");
        ExitCode::FAILURE
    }
}

fn run_master_worker(label: &str, config: SimConfig) -> KernelResult<u64> {
    let master = HostId::new(0);
    let mut builder = SimulationBuilder::new(StaticPlatform::uniform(WORKERS + 1, 1e9, 1.25e8, 5e-5))
        .config(config)
        .with_logging()
        .actor("master", master, |me| {
            let mut sends = Vec::new();
            for task in 1..=TASKS {
                sends.push(me.put_async("tasks", task, 1e6)?);
            }
            let mut total = 0u64;
            for _ in 0..TASKS {
                total += u64::from(me.get::<u32>("results")?);
            }
            me.wait_all(&mut sends)?;
            for _ in 0..WORKERS {
                me.put("tasks", STOP, 8.0)?;
            }
            tracing::info!(total, "all results collected");
            Ok(())
        })
        .spec(
            ActorSpec::new("heartbeat", master, |me| loop {
                me.sleep_for(0.5)?;
                tracing::debug!(now = %me.now(), "heartbeat");
            })
            .daemon(),
        );
    for w in 1..=WORKERS {
        builder = builder.actor(&format!("worker-{}", w), HostId::new(w), |me| loop {
            let task: u32 = me.get("tasks")?;
            if task == STOP {
                return Ok(());
            }
            me.execute(f64::from(task) * 2.5e8)?;
            me.put("results", task * task, 4e3)?;
        });
    }

    let (sim, report) = builder.run()?;
    let hash = sim.change_log().map_or(0, |log| log.log_hash());
    println!("  {:<9} [{}] {}", label, sim.factory_name(), report);
    Ok(hash)
}
