// =============================================================================
// Runner — compose connector, processor and sink fanout for one exchange
// =============================================================================
//
// `run()` drives the pipeline into the registered sinks until cancelled;
// `stream()` additionally hands every emission to the caller as a lazy
// sequence. A cancelled runner is spent and has to be rebuilt.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::candle::Candle;
use crate::connector::WsConnector;
use crate::exchange::{candle_api, ws_adapter, Exchange};
use crate::input::{RunnerConfig, StreamInput};
use crate::processor::CandleProcessor;
use crate::sink::{Sink, SinkFanout};
use crate::warmup;

/// Cooperative cancellation handle for a running pipeline.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Runner {
    exchange: Exchange,
    input: StreamInput,
    config: RunnerConfig,
    fanout: SinkFanout,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runner {
    pub fn new(exchange: Exchange, input: StreamInput, config: RunnerConfig) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            exchange,
            input,
            config,
            fanout: SinkFanout::new(),
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    pub fn register_sink(&mut self, sink: Arc<dyn Sink>) {
        self.fanout.add(sink);
    }

    /// Fluent variant of [`Runner::register_sink`].
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.fanout.add(sink);
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Drive the pipeline and deliver to registered sinks until cancelled.
    /// Surfaces only configuration errors and fatal access errors; anything
    /// transient is retried inside the connector.
    pub async fn run(self) -> Result<()> {
        self.drive(None).await
    }

    /// Same pipeline, but also yield every emission to the caller. The
    /// stream ends when the runner is cancelled (or the receiver dropped);
    /// it is not restartable.
    pub fn stream(self) -> mpsc::Receiver<Candle> {
        let (tap_tx, tap_rx) = mpsc::channel(1024);
        let source = self.exchange;
        tokio::spawn(async move {
            if let Err(e) = self.drive(Some(tap_tx)).await {
                error!(exchange = %source, error = %e, "runner stopped with error");
            }
        });
        tap_rx
    }

    async fn drive(self, tap: Option<mpsc::Sender<Candle>>) -> Result<()> {
        // Configuration problems abort here, before any connection opens.
        self.input.validate()?;
        let mut processor = CandleProcessor::new(&self.input, &self.config)?;

        info!(
            exchange = %self.exchange,
            symbols = ?self.input.symbols,
            timeframe = %self.input.timeframe,
            aggregates = ?processor.targets(),
            market = self.config.market_type.as_str(),
            "runner starting"
        );

        self.fanout.connect_all().await;

        if self.config.active_warmup {
            let api = candle_api(self.exchange, self.config.market_type);
            let loaded = warmup::load(api.as_ref(), &self.input, processor.largest_target())
                .await
                .context("warmup fetch failed")?;
            for (symbol, candles) in loaded {
                let emissions = processor.seed(&symbol, candles);
                self.fanout.emit_bulk(&emissions).await;
                if !self.send_tap(&tap, emissions).await {
                    return self.finish().await;
                }
            }
        }

        let ws = ws_adapter(self.exchange, self.config.market_type);
        let (tx, mut rx) = mpsc::channel::<Candle>(1024);
        let connector = WsConnector::new(ws, self.input.clone());
        let connector_task = tokio::spawn(connector.run(tx, self.shutdown_rx.clone()));

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = rx.recv() => match received {
                    Some(candle) => {
                        let emissions = processor.process(candle);
                        for emitted in &emissions {
                            self.fanout.emit(emitted).await;
                        }
                        if !self.send_tap(&tap, emissions).await {
                            break;
                        }
                    }
                    None => {
                        warn!(exchange = %self.exchange, "connector channel closed");
                        break;
                    }
                }
            }
        }

        // Best-effort drain of whatever the connector already queued.
        while let Ok(candle) = rx.try_recv() {
            let emissions = processor.process(candle);
            for emitted in &emissions {
                self.fanout.emit(emitted).await;
            }
            let _ = self.send_tap(&tap, emissions).await;
        }
        drop(rx);

        let result = self.finish().await;
        let _ = connector_task.await;
        result
    }

    /// Forward emissions to the stream consumer. A dropped receiver counts
    /// as cancellation; returns `false` once that happens.
    async fn send_tap(&self, tap: &Option<mpsc::Sender<Candle>>, emissions: Vec<Candle>) -> bool {
        let Some(tap) = tap else { return true };
        for candle in emissions {
            if tap.send(candle).await.is_err() {
                let _ = self.shutdown_tx.send(true);
                return false;
            }
        }
        true
    }

    async fn finish(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.fanout.close_all().await;
        info!(exchange = %self.exchange, "runner stopped");
        Ok(())
    }
}

/// Interleave the streams of several runners. Candles arrive in whatever
/// order the exchanges produce them; per-source ordering is preserved
/// because each runner forwards sequentially.
pub fn merge_streams(runners: Vec<Runner>) -> mpsc::Receiver<Candle> {
    let (tx, rx) = mpsc::channel(1024);
    for runner in runners {
        let tx = tx.clone();
        let mut stream = runner.stream();
        tokio::spawn(async move {
            while let Some(candle) = stream.recv().await {
                if tx.send(candle).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::input::StreamKind;
    use crate::timeframe::Timeframe;

    #[tokio::test]
    async fn aggregation_without_warmup_fails_before_connecting() {
        let input = StreamInput::new(StreamKind::Kline, vec!["BTCUSDT".into()], Timeframe::M1)
            .with_aggregates(vec![Timeframe::M5]);
        let config = RunnerConfig {
            active_warmup: false,
            ..RunnerConfig::default()
        };
        let runner = Runner::new(Exchange::Binance, input, config);
        let err = runner.run().await.unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().expect("config error");
        assert!(matches!(config_err, ConfigError::WarmupRequired));
    }

    #[tokio::test]
    async fn empty_symbols_fail_before_connecting() {
        let input = StreamInput::new(StreamKind::Kline, vec![], Timeframe::M1);
        let runner = Runner::new(Exchange::Kraken, input, RunnerConfig::default());
        assert!(runner.run().await.is_err());
    }
}
