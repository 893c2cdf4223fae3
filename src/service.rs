use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use buffer_server::{
    transport::TcpTransport,
    BufferServerSubscriber,
    BytesCodec,
    ReadGate,
    Reservoir,
    Sink,
};
use bytes::Bytes;
use tokio::{signal, sync::watch, task::JoinHandle};
use tracing::{debug, error, info};

use crate::config::ServerConfig;

/// Sink that logs every tuple it receives.
pub struct LoggingSink {
    name: String,
    count: usize,
}

impl LoggingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            count: 0,
        }
    }
}

impl Sink<Bytes> for LoggingSink {
    fn put(&mut self, tuple: Bytes) {
        self.count += 1;
        debug!(sink = %self.name, seq = self.count, bytes = tuple.len(), "tuple received");
    }

    fn count(&mut self, reset: bool) -> usize {
        let count = self.count;
        if reset {
            self.count = 0;
        }
        count
    }
}

pub struct SubscriberService {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
}

impl SubscriberService {
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        Self {
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Streams tuples from the buffer server at `addr` into a logging sink
    /// until the stream ends or a shutdown signal arrives. Returns the number
    /// of tuples delivered.
    pub async fn run(&self, addr: &str, sink: &str) -> Result<usize> {
        let gate = ReadGate::new();
        let subscriber = BufferServerSubscriber::new(
            &format!("subscriber/{}", sink),
            self.config.subscriber.backlog_capacity,
            BytesCodec,
            Arc::new(gate.clone()),
        )?;
        let reservoir = subscriber.acquire_reservoir(sink, self.config.subscriber.default_capacity)?;
        reservoir.attach_sink(Box::new(LoggingSink::new(sink)));

        let mut transport = TcpTransport::connect(addr, gate, self.config.subscriber.max_frame_bytes)
            .await
            .with_context(|| format!("subscribing to {}", addr))?;

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });
        let sweeper = self.spawn_sweeper(reservoir.clone());

        let mut shutdown_rx = self.shutdown_rx.clone();
        let result = tokio::select! {
            result = transport.pump(&subscriber) => result.map(|_| ()),
            _ = shutdown_rx.changed() => {
                info!("shutdown requested, closing buffer server stream");
                Ok(())
            }
        };

        let _ = self.shutdown_tx.send(());
        if let Err(err) = sweeper.await {
            error!("sweeper task failed: {:?}", err);
        }
        while !reservoir.is_empty() {
            if reservoir.sweep() == 0 {
                break;
            }
        }
        let delivered = reservoir
            .detach_sink()
            .map(|mut sink| sink.count(false))
            .unwrap_or_default();
        info!(sink = reservoir.name(), delivered, "sink closed");
        subscriber.teardown();
        result.map(|_| delivered)
    }

    fn spawn_sweeper(&self, reservoir: Arc<Reservoir<Bytes>>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = Duration::from_millis(self.config.subscriber.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reservoir.sweep();
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        })
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down subscriber");
}
