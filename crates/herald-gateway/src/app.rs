use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use herald_channel::ChannelPair;
use herald_core::{config::HeraldConfig, DeliverySink, PublicationStore};
use herald_scheduler::{ReaperLoop, SchedulerLoop};
use herald_store::SqliteStore;
use herald_worker::{DeliveryWorker, Dispatcher};
use tower_http::trace::TraceLayer;

use crate::supervisor::Supervisor;

/// Shared state passed as `Arc<AppState>` to every handler.
pub struct AppState {
    pub config: HeraldConfig,
    pub store: Arc<SqliteStore>,
}

impl AppState {
    pub fn new(config: HeraldConfig, store: Arc<SqliteStore>) -> Self {
        Self { config, store }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/platforms", post(crate::http::platforms::create_platform))
        .route(
            "/posts",
            get(crate::http::posts::list_posts).post(crate::http::posts::create_post),
        )
        .route(
            "/destinations/{id}",
            get(crate::http::destinations::get_destination),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the scheduler, reaper and dispatcher under a fresh [`Supervisor`].
pub fn start_pipeline(
    config: &HeraldConfig,
    store: Arc<dyn PublicationStore>,
    channel: ChannelPair,
    sink: Arc<dyn DeliverySink>,
) -> Supervisor {
    let mut supervisor = Supervisor::new(config.shutdown.timeout());

    let scheduler = SchedulerLoop::new(store.clone(), channel.producer, &config.scheduler)
        .with_send_timeout(config.channel.send_timeout());
    let reaper = ReaperLoop::from_config(store.clone(), &config.reaper, &config.retry);
    let worker = DeliveryWorker::new(store, sink, config.worker.delay(), config.retry.policy());
    let dispatcher = Dispatcher::new(worker, config.worker.max_concurrent, supervisor.tracker());
    let consumer = channel.consumer;

    supervisor.spawn("scheduler", |cancel| scheduler.run(cancel));
    supervisor.spawn("reaper", |cancel| reaper.run(cancel));
    supervisor.spawn("dispatcher", move |cancel| dispatcher.run(consumer, cancel));
    supervisor
}
