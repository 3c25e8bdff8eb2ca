use std::{sync::Arc, time::Duration};

use fridge_common::{TOPIC_CONTROLLER_STATE, TOPIC_CONTROLLER_STATUS};
use fridge_supervisor::ProcessCtx;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use tracing::{info, warn};

use crate::app::AppState;

const PUBLISH_PERIOD: Duration = Duration::from_secs(10);
const POLL_BACKOFF: Duration = Duration::from_secs(2);

fn mqtt_options(app: &AppState) -> MqttOptions {
    let network = &app.config.network;
    let mut options = MqttOptions::new(
        "fridge-controller",
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        TOPIC_CONTROLLER_STATUS,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    options
}

/// Publishes the retained status snapshot so the last state before a reset stays visible.
pub async fn publish_loop(ctx: ProcessCtx, app: Arc<AppState>) -> anyhow::Result<()> {
    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options(&app), 16);
    let mut interval = tokio::time::interval(PUBLISH_PERIOD);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                let _ = mqtt.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(err) = mqtt
                        .publish(TOPIC_CONTROLLER_STATUS, QoS::AtLeastOnce, true, "online")
                        .await
                    {
                        warn!("controller status publish failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    if !ctx.sleep(POLL_BACKOFF).await {
                        return Ok(());
                    }
                }
            },
            _ = interval.tick() => {
                ctx.feed();
                let payload = app.state_payload(ctx.supervisor()).await;
                match serde_json::to_vec(&payload) {
                    Ok(body) => {
                        if let Err(err) = mqtt
                            .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                            .await
                        {
                            warn!("controller state publish failed: {err}");
                        }
                    }
                    Err(err) => warn!("controller state serialization failed: {err}"),
                }
            }
        }
    }
}
