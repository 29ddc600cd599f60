//! Demo node: runs the engine against in-memory stores.
//!
//! Configuration comes from `OUTPOST_*` variables, plus:
//! - `OUTPOST_LOG_FORMAT` (`json`, `pretty`, `compact`; default `json`)
//! - `OUTPOST_DEMO_RECORDS` records scheduled at startup (default 20)
//! - `OUTPOST_DEMO_RUN_SECS` how long to run before shutting down (default 5)

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;

use outpost_engine::{HandlerError, HandlerRegistry, OutboxComponents, OutboxConfig, OutboxRuntime};
use outpost_observability::LogFormat;

fn main() -> anyhow::Result<()> {
    let format = match std::env::var("OUTPOST_LOG_FORMAT") {
        Ok(value) => value
            .parse::<LogFormat>()
            .map_err(anyhow::Error::msg)
            .context("OUTPOST_LOG_FORMAT")?,
        Err(_) => LogFormat::Json,
    };
    outpost_observability::init_with(format);

    let config = OutboxConfig::from_env().context("loading outbox configuration")?;
    let demo_records = env_u64("OUTPOST_DEMO_RECORDS", 20)?;
    let run_for = Duration::from_secs(env_u64("OUTPOST_DEMO_RUN_SECS", 5)?);

    let components = OutboxComponents::in_memory(Arc::new(demo_handlers()));
    let runtime = OutboxRuntime::start(components, config).context("starting outbox runtime")?;

    for n in 0..demo_records {
        let customer = format!("customer-{}", n % 4);
        let outbox = runtime.outbox();
        outbox.schedule_with_key(&customer, serde_json::json!({ "customer": customer, "n": n }), "audit.log")?;
        outbox.schedule_with_key(
            &customer,
            serde_json::json!({ "customer": customer, "amount_cents": 100 * (n + 1), "n": n }),
            "payments.charge",
        )?;
    }
    tracing::info!(
        instance_id = %runtime.instance_id(),
        records = demo_records * 2,
        run_secs = run_for.as_secs(),
        "demo records scheduled"
    );

    thread::sleep(run_for);

    let stats = runtime.outbox().stats()?;
    let scheduler = runtime.scheduler_stats();
    let failed = runtime.outbox().failed_records(10)?;
    let report = runtime.shutdown();

    tracing::info!(
        outbox = %serde_json::to_string(&stats)?,
        scheduler = %serde_json::to_string(&scheduler)?,
        drained = report.drained,
        "demo finished"
    );
    for record in &failed {
        tracing::warn!(
            record_id = %record.id(),
            key = %record.key(),
            reason = record.failure_reason().unwrap_or_default(),
            "record left FAILED"
        );
    }
    Ok(())
}

fn demo_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("audit.log", |payload, meta| {
            tracing::info!(key = %meta.key, payload = %payload, "audit entry");
            Ok(())
        })
        .register("payments.charge", |payload, meta| {
            // every fifth charge is declined by the fake gateway
            if payload["n"].as_u64().is_some_and(|n| n % 5 == 4) {
                return Err(HandlerError::new("declined", "card declined by gateway"));
            }
            tracing::info!(key = %meta.key, amount_cents = %payload["amount_cents"], "charge captured");
            Ok(())
        })
        .register_fallback("payments.charge", |payload, meta, failure| {
            tracing::warn!(
                key = %meta.key,
                failure_count = failure.failure_count,
                error = %failure.last_error,
                payload = %payload,
                "charge parked for manual review"
            );
            Ok(())
        });
    handlers
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a non-negative integer, got {value:?}")),
        Err(_) => Ok(default),
    }
}
