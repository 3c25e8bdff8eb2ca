use std::{sync::Arc, time::Duration};

use chrono::Utc;
use fridge_common::{compose_frame, FrameInput, OutputCommand};
use fridge_supervisor::{launcher, ota::UpdateOutcome, DispatchTable, Fault, Launcher, ProcessCtx};
use tracing::{debug, info, warn};

use crate::{app::AppState, telemetry, web};

pub const SENSOR_COOLING: &str = "sensor.cooling";
pub const DISPLAY_REFRESH: &str = "display.refresh";
pub const NET_MONITOR: &str = "net.monitor";
pub const TIME_SYNC: &str = "time.sync";
pub const OTA_WORKER: &str = "ota.worker";
pub const WEB_SERVER: &str = "web.server";
pub const TELEMETRY_PUBLISH: &str = "telemetry.publish";

const DISPLAY_PERIOD: Duration = Duration::from_millis(200);
const TIME_SYNC_RETRY: Duration = Duration::from_secs(60);
const FIRST_OTA_CHECK: Duration = Duration::from_secs(60);

/// Launchers for every restartable process, configuration captured once here.
pub fn dispatch_table(app: &Arc<AppState>) -> DispatchTable {
    let mut table = DispatchTable::new()
        .with(SENSOR_COOLING, with_app(app, cooling_loop))
        .with(DISPLAY_REFRESH, with_app(app, display_loop))
        .with(NET_MONITOR, with_app(app, net_monitor_loop))
        .with(TIME_SYNC, with_app(app, time_sync_loop))
        .with(WEB_SERVER, with_app(app, web::serve));
    if app.updater.is_some() {
        table.insert(OTA_WORKER, with_app(app, ota_worker_loop));
    }
    if !app.config.network.mqtt_host.is_empty() {
        table.insert(TELEMETRY_PUBLISH, with_app(app, telemetry::publish_loop));
    }
    table
}

fn with_app<F, Fut>(app: &Arc<AppState>, process: F) -> Launcher
where
    F: Fn(ProcessCtx, Arc<AppState>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let app = app.clone();
    launcher(move |ctx| process(ctx, app.clone()))
}

fn transient(process: &str, detail: impl ToString) -> Fault {
    Fault::TransientIo {
        process: process.to_string(),
        detail: detail.to_string(),
    }
}

async fn apply_outputs(app: &AppState, commands: Vec<OutputCommand>) {
    for command in commands {
        debug!("output {command:?}");
        app.board.apply(command);
    }
}

pub async fn cooling_loop(ctx: ProcessCtx, app: Arc<AppState>) -> anyhow::Result<()> {
    let conversion = Duration::from_millis(app.config.cooling.conversion_wait_ms);
    let pause = Duration::from_millis(app.config.cooling.read_interval_ms);

    let reset = app.cooling.lock().await.reset();
    apply_outputs(&app, reset).await;

    loop {
        ctx.feed();
        match app.board.start_conversion() {
            Ok(()) => {
                if !ctx.sleep(conversion).await {
                    return Ok(());
                }
                match app.board.read_temperature() {
                    Ok(temp) => {
                        let boost = app.board.boost_pressed() || app.take_boost_request();
                        let commands = app.cooling.lock().await.update(temp, boost);
                        apply_outputs(&app, commands).await;
                        app.history
                            .lock()
                            .await
                            .record(Utc::now().timestamp(), temp);
                    }
                    Err(err) => warn!("{}", transient(ctx.name(), err)),
                }
            }
            Err(err) => warn!("{}", transient(ctx.name(), err)),
        }

        match app.board.read_power() {
            Ok(reading) => *app.power.lock().await = Some(reading),
            Err(err) => debug!("{}", transient(ctx.name(), err)),
        }

        if !ctx.sleep(pause).await {
            return Ok(());
        }
    }
}

pub async fn display_loop(ctx: ProcessCtx, app: Arc<AppState>) -> anyhow::Result<()> {
    let mut tick = 0_u64;
    loop {
        ctx.feed();
        let cooling = app.cooling.lock().await.status();
        let history = app.history.lock().await.status();
        let power = *app.power.lock().await;
        let (tasks_running, tasks_total) = ctx.registry().running_count();

        let frame = compose_frame(&FrameInput {
            local_time: app.local_time(),
            cooling: &cooling,
            history,
            power,
            tasks_running,
            tasks_total,
            tick,
        });
        app.board.render(&frame);
        tick = tick.wrapping_add(1);

        if !ctx.sleep(DISPLAY_PERIOD).await {
            return Ok(());
        }
    }
}

pub async fn net_monitor_loop(ctx: ProcessCtx, app: Arc<AppState>) -> anyhow::Result<()> {
    let period = Duration::from_secs(app.config.network.check_interval_secs);
    loop {
        ctx.feed();
        if !app.device.link_up() {
            warn!("{}", transient(ctx.name(), "network link down"));
            app.device.reconnect();
        }
        if !ctx.sleep(period).await {
            return Ok(());
        }
    }
}

/// Feeds once per sync period; its staleness threshold is scaled to match.
pub async fn time_sync_loop(ctx: ProcessCtx, app: Arc<AppState>) -> anyhow::Result<()> {
    let period = Duration::from_millis(app.config.time_sync_interval_ms());
    loop {
        let wait = match app.board.sync_clock() {
            Ok(()) => {
                let now = Utc::now().timestamp();
                app.note_time_sync(now);
                info!("clock synced, epoch {now}");
                period
            }
            Err(err) => {
                warn!("{}", transient(ctx.name(), err));
                TIME_SYNC_RETRY.min(period)
            }
        };
        ctx.feed();
        if !ctx.sleep(wait).await {
            return Ok(());
        }
    }
}

/// Runs an update check per period or whenever one is requested over the web.
pub async fn ota_worker_loop(ctx: ProcessCtx, app: Arc<AppState>) -> anyhow::Result<()> {
    let Some(updater) = app.updater.clone() else {
        return Ok(());
    };
    let period = Duration::from_secs(app.config.ota.check_interval_secs);
    let mut wait = FIRST_OTA_CHECK.min(period);
    loop {
        ctx.feed();
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = app.ota_requests.notified() => info!("update check requested"),
            _ = tokio::time::sleep(wait) => {}
        }
        wait = period;

        match updater.ota_check().await {
            Ok(UpdateOutcome::UpToDate(version)) => debug!("firmware {version} is current"),
            Ok(UpdateOutcome::Applied { to, .. }) => info!("firmware {to} applied"),
            Err(err) => warn!("update check failed: {err}"),
        }
    }
}
