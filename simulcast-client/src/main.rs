//! Simulcast viewer - reference client
//!
//! Follows one broadcast from the command line with a simulated player,
//! logging what a real embedding application would render. Useful for
//! watching the convergence behavior against a running server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use simulcast_client::clock::{ClockCalibrator, HttpTimeSource};
use simulcast_client::controller::SyncController;
use simulcast_client::delivery::DeliveryAdapter;
use simulcast_client::player::{PlaybackSource, Player, PlayerPair};
use simulcast_common::model::BroadcastSchedule;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the reference viewer
#[derive(Parser, Debug)]
#[command(name = "simulcast-client")]
#[command(about = "Simulated-live broadcast viewer")]
#[command(version)]
struct Args {
    /// Base URL of the simulcast server
    #[arg(short, long, env = "SIMULCAST_SERVER", default_value = "http://127.0.0.1:5850")]
    server: String,

    /// Slug of the broadcast to follow
    slug: String,
}

/// Player that advances position against the monotonic clock and logs
/// every command it receives
#[derive(Default)]
struct SimulatedPlayer {
    name: &'static str,
    loaded: Option<String>,
    /// Anchor for position: (instant, position at that instant)
    playing_from: Option<(Instant, f64)>,
    position: f64,
}

impl SimulatedPlayer {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn current_position(&self) -> f64 {
        match self.playing_from {
            Some((since, base)) => base + since.elapsed().as_secs_f64(),
            None => self.position,
        }
    }
}

#[async_trait]
impl Player for SimulatedPlayer {
    async fn load(&mut self, source: &PlaybackSource) -> simulcast_common::Result<()> {
        info!("[{}] load {}", self.name, source.media_id);
        self.loaded = Some(source.media_id.clone());
        self.playing_from = None;
        self.position = 0.0;
        Ok(())
    }

    async fn play(&mut self) -> simulcast_common::Result<()> {
        info!("[{}] play {:?} @ {:.1}s", self.name, self.loaded, self.position);
        self.playing_from = Some((Instant::now(), self.position));
        Ok(())
    }

    async fn pause(&mut self) -> simulcast_common::Result<()> {
        self.position = self.current_position();
        self.playing_from = None;
        info!("[{}] pause @ {:.1}s", self.name, self.position);
        Ok(())
    }

    async fn seek(&mut self, position_secs: f64) -> simulcast_common::Result<()> {
        info!("[{}] seek -> {:.1}s", self.name, position_secs);
        self.position = position_secs;
        if let Some(anchor) = &mut self.playing_from {
            *anchor = (Instant::now(), position_secs);
        }
        Ok(())
    }

    async fn position_secs(&self) -> simulcast_common::Result<f64> {
        Ok(self.current_position())
    }

    async fn is_paused(&self) -> simulcast_common::Result<bool> {
        Ok(self.playing_from.is_none())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simulcast_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let schedule: BroadcastSchedule = reqwest::Client::new()
        .get(format!("{}/broadcasts/{}", args.server, args.slug))
        .send()
        .await
        .context("Failed to reach server")?
        .error_for_status()
        .context("Broadcast not available")?
        .json()
        .await
        .context("Invalid schedule response")?;
    info!(
        "Following '{}': {} items, {} loops",
        schedule.slug,
        schedule.items.len(),
        schedule.clamped_loop_count()
    );

    let calibrator = ClockCalibrator::new(Arc::new(HttpTimeSource::new(args.server.clone())));
    let delivery = DeliveryAdapter::new(args.server.clone(), args.slug.clone()).start();

    let pair = PlayerPair::new(
        Box::new(SimulatedPlayer::new("A")),
        Box::new(SimulatedPlayer::new("B")),
    );
    let controller = SyncController::new(schedule.clone(), pair, None, delivery.stopped());

    let cancel = CancellationToken::new();
    let clock_task = tokio::spawn(Arc::clone(&calibrator).run(schedule));
    let controller_task = tokio::spawn(controller.run(Arc::clone(&calibrator), cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = controller_task => info!("Broadcast finished"),
    }
    cancel.cancel();
    calibrator.stop();
    delivery.stop();
    let _ = clock_task.await;
    Ok(())
}
