//! farebid-replay binary.
//!
//! Reads `farebid.toml` (or the path given with `--config`), opens a SQLite
//! store, replays a JSON-lines script of client actions through the
//! dispatcher, and prints every fan-out delivery as one JSON line on stdout.
//! Rejected steps are printed too and do not stop the replay.
//!
//! ```
//! cargo run -p farebid-replay -- demos/negotiation.jsonl
//! ```

mod script;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use farebid_core::{
  driver::DriverCandidate,
  event::Envelope,
  geo::Coordinate,
  negotiation::ProposalRef,
  ride::{Actor, NewRide},
  route::{Geocoder, StraightLineRouter},
};
use farebid_dispatch::{
  DeliveryError, DispatchSettings, Dispatcher, EventSink, FanoutRouter,
};
use farebid_store_sqlite::SqliteStore;
use serde::Deserialize;
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::script::{Labels, Step};

#[derive(Parser)]
#[command(author, version, about = "Replay client actions through the Farebid dispatcher")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "farebid.toml")]
  config: PathBuf,

  /// JSON-lines script to replay.
  script: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ReplayConfig {
  /// SQLite file to use; in-memory when unset.
  store_path:        Option<PathBuf>,
  average_speed_kmh: f64,
  dispatch:          DispatchSettings,
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      store_path:        None,
      average_speed_kmh: StraightLineRouter::default().average_speed_kmh,
      dispatch:          DispatchSettings::default(),
    }
  }
}

/// Stands in for a maps provider: the "address" is the coordinate itself.
struct CoordinateGeocoder;

impl Geocoder for CoordinateGeocoder {
  async fn reverse_geocode(&self, at: Coordinate) -> farebid_core::Result<String> {
    Ok(format!("{:.5}, {:.5}", at.latitude, at.longitude))
  }
}

/// Prints each delivery as a JSON line addressed to `name`.
struct StdoutSink {
  name: String,
}

impl EventSink for StdoutSink {
  fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
    let line = json!({ "to": self.name, "group": envelope.group, "event": envelope.event });
    println!("{line}");
    Ok(())
  }
}

type ReplayDispatcher = Dispatcher<SqliteStore, CoordinateGeocoder, StraightLineRouter>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing. Logs go to stderr so stdout stays machine-readable.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("FAREBID").separator("__"))
    .build()
    .context("failed to read config file")?;

  let replay_cfg: ReplayConfig = settings
    .try_deserialize()
    .context("failed to deserialise ReplayConfig")?;

  let store = match &replay_cfg.store_path {
    Some(path) => SqliteStore::open(path)
      .await
      .with_context(|| format!("failed to open store at {path:?}"))?,
    None => SqliteStore::open_in_memory()
      .await
      .context("failed to open in-memory store")?,
  };

  let dispatcher = Dispatcher::new(
    store,
    CoordinateGeocoder,
    StraightLineRouter { average_speed_kmh: replay_cfg.average_speed_kmh },
    Arc::new(FanoutRouter::new()),
    replay_cfg.dispatch,
  )
  .context("invalid dispatch settings")?;

  let source = tokio::fs::read_to_string(&cli.script)
    .await
    .with_context(|| format!("failed to read script {:?}", cli.script))?;
  let steps = script::parse(&source)?;
  tracing::info!(steps = steps.len(), "replaying script");

  let mut labels = Labels::default();
  let mut rejected = 0;
  for (n, step) in steps.into_iter().enumerate() {
    if let Err(e) = run_step(&dispatcher, &mut labels, step).await {
      rejected += 1;
      let line = json!({ "step": n + 1, "error": e.to_string(), "kind": format!("{:?}", e.kind()) });
      println!("{line}");
    }
  }

  tracing::info!(rejected, "replay finished");
  Ok(())
}

async fn run_step(
  d:      &ReplayDispatcher,
  labels: &mut Labels,
  step:   Step,
) -> farebid_dispatch::Result<()> {
  match step {
    Step::Driver { driver, at, rating } => {
      let id = labels.id(&driver);
      d.register_driver(DriverCandidate::new(id, at, rating)).await?;
      connect(d, id, driver, true);
    }
    Step::Connect { user, driver } => {
      let id = labels.id(&user);
      connect(d, id, user, driver);
    }
    Step::Disconnect { user } => d.router().disconnect(labels.id(&user)),
    Step::Heartbeat { driver, at } => d.driver_heartbeat(labels.id(&driver), at).await?,
    Step::Availability { driver, available } => {
      d.set_driver_availability(labels.id(&driver), available).await?;
    }
    Step::Request { rider, ride, pickup, destination, fare } => {
      let input = NewRide {
        pickup,
        destination,
        pickup_address: None,
        destination_address: None,
        proposed_fare: fare,
      };
      let created = d.request_ride(labels.id(&rider), input).await?;
      labels.bind(&ride, created.ride_id);
    }
    Step::Rematch { ride } => {
      d.rematch(labels.id(&ride)).await?;
    }
    Step::Propose { rider, ride, amount } => {
      d.submit_initial_proposal(labels.id(&rider), labels.id(&ride), amount).await?;
    }
    Step::Bid { driver, ride, amount, message } => {
      d.submit_bid(labels.id(&driver), labels.id(&ride), amount, message).await?;
    }
    Step::Counter { rider, ride, amount, message } => {
      d.submit_counter_offer(labels.id(&rider), labels.id(&ride), amount, message)
        .await?;
    }
    Step::AcceptBid { rider, ride, index } => {
      let actor = Actor::Rider(labels.id(&rider));
      d.accept_proposal(actor, labels.id(&ride), ProposalRef::Driver(index)).await?;
    }
    Step::AcceptOffer { driver, ride, index } => {
      let actor = Actor::Driver(labels.id(&driver));
      d.accept_proposal(actor, labels.id(&ride), ProposalRef::Passenger(index)).await?;
    }
    Step::Accept { driver, ride } => {
      d.accept_ride(labels.id(&driver), labels.id(&ride)).await?;
    }
    Step::Decline { driver, ride } => d.decline_ride(labels.id(&driver), labels.id(&ride)).await?,
    Step::Start { driver, ride } => {
      d.start_ride(labels.id(&driver), labels.id(&ride)).await?;
    }
    Step::Complete { driver, ride } => {
      d.complete_ride(labels.id(&driver), labels.id(&ride)).await?;
    }
    Step::Cancel { rider, ride } => {
      d.cancel_ride(labels.id(&rider), labels.id(&ride)).await?;
    }
    Step::Ping { driver, ride, at } => {
      d.location_ping(labels.id(&driver), labels.id(&ride), at).await?;
    }
    Step::Say { user, ride, text } => {
      d.send_message(labels.id(&user), labels.id(&ride), &text).await?;
    }
    Step::Read { user, ride } => {
      let (reader, ride_id) = (labels.id(&user), labels.id(&ride));
      let messages = d.messages_for(reader, ride_id).await?;
      let marked = d.mark_messages_read(reader, ride_id).await?;
      let lines: Vec<_> = messages
        .iter()
        .map(|m| json!({ "from": labels.name(m.sender_id), "text": m.body }))
        .collect();
      println!("{}", json!({ "reader": user, "messages": lines, "marked_read": marked }));
    }
    Step::Expire { after_secs } => {
      let expired = d
        .expire_notifications(Utc::now() + chrono::Duration::seconds(after_secs))
        .await?;
      println!("{}", json!({ "expired": expired }));
    }
    Step::Show { ride } => {
      let id = labels.id(&ride);
      let snapshot = d.get_ride(id).await?;
      println!("{}", json!({ "ride": labels.name(id), "state": snapshot }));
    }
  }
  Ok(())
}

fn connect(d: &ReplayDispatcher, id: uuid::Uuid, name: String, is_driver: bool) {
  d.router().connect(id, Arc::new(StdoutSink { name }), is_driver);
}
