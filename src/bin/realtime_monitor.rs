//! Realtime Monitor
//!
//! Connects to the gateway, subscribes to the topics given on the command
//! line and logs every envelope and lifecycle event until Ctrl+C.
//!
//! ```text
//! realtime-monitor [--preset development|production|testing] tag:T1 device:D4 alerts
//! ```

use anyhow::{bail, Context, Result};
use gateway_realtime::bin_common::{
    interruptible_sleep, load_config_from_env, parse_args, parse_topic_arg, BinaryRunner,
    ConfigType, RunConfig,
};
use gateway_realtime::logging::init_tracing;
use gateway_realtime::settings::{Preset, RealtimeSettings};
use gateway_realtime::store::LiveStore;
use livelink::{listener_fn, ClientEvent, EnvelopeKind, ListenerRef, Received, RealtimeClient};
use tracing::{error, info, warn};

struct MonitorApp {
    run_config: RunConfig,
    client: RealtimeClient,
    store: LiveStore,
    on_envelope: ListenerRef<Received>,
    on_status: ListenerRef<ClientEvent>,
}

impl MonitorApp {
    fn new(settings: &RealtimeSettings, topic_args: &[String]) -> Result<Self> {
        let client = settings.build_client()?;
        for arg in topic_args {
            match parse_topic_arg(arg) {
                Some(descriptor) => {
                    client.subscribe(descriptor);
                }
                None => bail!("unrecognised subscription '{}' (expected tag:<id>, tags:<id>,<id>, device:<id>, devices or alerts)", arg),
            }
        }

        let on_envelope = listener_fn(|received: &Received| {
            info!(epoch = received.epoch, "{:?}", received.envelope);
        });
        let on_status = listener_fn(|event: &ClientEvent| match event {
            ClientEvent::GaveUp { attempts } => error!("Gave up after {} attempts", attempts),
            ClientEvent::HeartbeatTimeout { seq } => warn!("Heartbeat timeout (seq {})", seq),
            other => info!("{:?}", other),
        });

        Ok(Self {
            run_config: RunConfig::new("Realtime Monitor"),
            client,
            store: LiveStore::new(),
            on_envelope,
            on_status,
        })
    }

    fn report(&self) {
        let metrics = self.client.metrics();
        info!(
            "Status: {} | sent {} | received {} | parse errors {} | reconnects {} | tags {} | devices {} | alerts {}",
            metrics.connection_state,
            metrics.frames_sent,
            metrics.frames_received,
            metrics.parse_errors,
            metrics.reconnect_count,
            self.store.tag_count(),
            self.store.device_count(),
            self.store.alert_count()
        );
    }
}

impl BinaryRunner for MonitorApp {
    async fn run(&mut self) -> Result<()> {
        for kind in EnvelopeKind::ALL {
            self.client.on(kind, &self.on_envelope);
        }
        self.client.on_status(&self.on_status);
        self.store.attach(&self.client);

        info!(
            "Connecting to {} with {} subscription(s)",
            self.client.url(),
            self.client.subscriptions().len()
        );
        if let Err(e) = self.client.connect().await {
            warn!("Initial connection failed, retrying in the background: {}", e);
        }

        let interval = self
            .run_config
            .status_interval()
            .unwrap_or(std::time::Duration::from_secs(60));
        while interruptible_sleep(interval).await {
            self.report();
        }

        self.store.detach(&self.client);
        self.client.disconnect();
        Ok(())
    }

    fn config(&self) -> &RunConfig {
        &self.run_config
    }

    fn stats(&self) -> Option<String> {
        let metrics = self.client.metrics();
        Some(format!(
            "Frames received: {} | Reconnects: {} | Listener failures: {}",
            metrics.frames_received, metrics.reconnect_count, metrics.listener_failures
        ))
    }
}

fn split_args(args: Vec<String>) -> Result<(Option<Preset>, Vec<String>)> {
    let mut preset = None;
    let mut topics = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--preset" {
            let value = iter.next().context("--preset needs a value")?;
            preset = Some(value.parse()?);
        } else {
            topics.push(arg);
        }
    }
    Ok((preset, topics))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let (preset, topics) = split_args(parse_args())?;
    let settings = match preset {
        Some(preset) => {
            let mut settings = RealtimeSettings::preset(preset);
            settings.apply_env_overrides()?;
            settings.validate()?;
            settings
        }
        None => RealtimeSettings::load_or_default(
            load_config_from_env(ConfigType::Realtime),
            Preset::Development,
        )?,
    };

    init_tracing(&settings.log_level);
    settings.log();

    let mut app = MonitorApp::new(&settings, &topics)?;
    app.execute().await
}
