use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use gateway_core::alert::AlertEngine;
use gateway_core::credential::InMemoryCredentialStore;
use gateway_core::manager::ConnectionManager;
use gateway_core::model::DataPoint;
use gateway_core::polling::{PollTarget, PollingEngine};
use gateway_core::rbs::RingBufferStore;
use gateway_core::virtual_server::VirtualModbusServer;

pub mod config;

use config::Workspace;

pub fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let _ = LogTracer::builder().init();
    let file_appender = tracing_appender::rolling::daily("logs", "gateway");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .with_level(true)
        .with_writer(std::io::stdout)
        .with_filter(LevelFilter::INFO);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        // 移除输出内容中的 颜色或其它格式相关转义字符
        .with_ansi(false)
        .with_writer(non_blocking)
        // 日志等级过滤
        .with_filter(LevelFilter::INFO);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let collector = Registry::default()
        .with(ErrorLayer::default())
        .with(env_filter)
        .with(file_layer)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(collector).expect("Tracing collect error");
    guard
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "网关工作区配置文件")]
    config: String,
}

/// The wiring that turns a loaded `Workspace` into a running process: CM
/// owns the connections, PE polls the ones that need polling, BE/AE run on
/// top of CM's event stream, and RBS persists every point CM emits.
pub struct Gateway {
    pub cm: Arc<ConnectionManager>,
    pub rbs: Arc<RingBufferStore>,
    pub pe: Arc<PollingEngine>,
    pub ae: Arc<AlertEngine>,
    bridges: Vec<gateway_core::bridge::RunningBridge>,
    virtual_server: Option<VirtualModbusServer>,
}

#[async_trait::async_trait]
impl PollTarget for Gateway {
    async fn poll_once(&self, connection_id: uuid::Uuid) -> Vec<DataPoint> {
        match self.cm.read(connection_id, None).await {
            Ok(results) => results
                .into_iter()
                .map(|r| gateway_core::polling::datapoint_from_read(r.tag_id, r.value, r.quality, r.timestamp))
                .collect(),
            Err(err) => {
                warn!(connection = %connection_id, error = %err, "poll read failed");
                Vec::new()
            }
        }
    }

    async fn publish(&self, connection_id: uuid::Uuid, points: Vec<DataPoint>) {
        if let Err(err) = self.rbs.insert_batch(points.clone()).await {
            warn!(connection = %connection_id, error = %err, "failed to persist polled points");
        }
        self.cm.publish_data(connection_id, points);
    }
}

impl Gateway {
    /// Builds every connection/tag/bridge/alert rule in `workspace`,
    /// connects the ones marked `autoConnect`, and starts their pollers.
    pub async fn bootstrap(workspace: Workspace) -> anyhow::Result<Arc<Self>> {
        let default_env = workspace
            .environments
            .iter()
            .find(|e| e.is_default)
            .or_else(|| workspace.environments.first())
            .cloned()
            .unwrap_or_default();
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let cm = Arc::new(ConnectionManager::new(credentials, default_env));

        let rbs = Arc::new(match &workspace.rbs_path {
            Some(path) => RingBufferStore::open(path).await?,
            None => RingBufferStore::open_in_memory().await?,
        });

        let mut poll_plan = Vec::new();
        for def in &workspace.connections {
            cm.create(def.connection.clone()).await?;
            for tag in &def.tags {
                cm.add_tag(tag.clone())?;
            }
            if def.auto_connect {
                poll_plan.push((def.connection.id, def.poll_interval_ms));
            }
        }

        let ae = Arc::new(AlertEngine::new());
        for rule in workspace.alert_rules {
            ae.add_rule(rule).await;
        }
        let _ = gateway_core::alert::spawn_driver(Arc::clone(&ae), Arc::clone(&cm));

        let pe = Arc::new(PollingEngine::new());

        let virtual_server = match workspace.virtual_server {
            Some(vs) => match VirtualModbusServer::start(&vs.host, vs.port, vs.blocks).await {
                Ok(server) => {
                    info!(addr = %server.local_addr(), "virtual modbus server listening");
                    Some(server)
                }
                Err(err) => {
                    error!(error = %err, "failed to start virtual modbus server");
                    None
                }
            },
            None => None,
        };

        let bridges: Vec<gateway_core::bridge::RunningBridge> =
            workspace.bridges.into_iter().map(|bridge| gateway_core::bridge::start(bridge, Arc::clone(&cm))).collect();

        let gateway = Arc::new(Self { cm, rbs, pe, ae, bridges, virtual_server });

        for (connection_id, _) in &poll_plan {
            if let Err(err) = gateway.cm.connect(*connection_id).await {
                warn!(connection = %connection_id, error = %err, "initial connect failed, will retry via adapter backoff");
            }
        }
        for (connection_id, interval_ms) in poll_plan {
            gateway.pe.start(connection_id, interval_ms, Arc::clone(&gateway) as Arc<dyn PollTarget>).await;
        }

        Ok(gateway)
    }

    pub async fn shutdown(&self) {
        self.pe.stop_all().await;
    }
}

pub async fn cmd() {
    let args = Args::parse();
    match Workspace::load(&args.config).await {
        Ok(workspace) => match Gateway::bootstrap(workspace).await {
            Ok(_gateway) => {
                info!("gateway running");
                std::future::pending::<()>().await;
            }
            Err(err) => error!("{}", err),
        },
        Err(err) => error!("{}", err),
    }
}
