use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use basegrid_engine::{
    occupied_cells, rotate, Catalog, Definition, InstanceId, LayoutDb, LayoutRecord,
    PlacedInstance, Planner, Rejection, RestoreReport, Rotation, Shape, Verdict,
};
use basegrid_protocol::{decode_share_code, encode_share_code};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tower_http::cors::{AllowOrigin, CorsLayer};


pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    /// Catalog file to load instead of the built-in building table.
    pub catalog_path: Option<PathBuf>,
    /// Quiet period after the last layout change before it is written out.
    pub debounce: Duration,
}

impl ServerConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            catalog_path: None,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Writes the layout to the local store, skipping writes that would not change it.
pub struct Persister {
    db: LayoutDb,
    last_hash: std::sync::Mutex<Option<[u8; 32]>>,
}

impl Persister {
    pub fn new(db: LayoutDb) -> Self {
        Self {
            db,
            last_hash: std::sync::Mutex::new(None),
        }
    }

    pub fn db(&self) -> &LayoutDb {
        &self.db
    }

    /// Returns `false` when the records match the last write.
    pub async fn write(&self, records: Vec<LayoutRecord>) -> anyhow::Result<bool> {
        let hash: [u8; 32] = Sha256::digest(serde_json::to_vec(&records)?).into();
        {
            let last = self.last_hash.lock().unwrap_or_else(|e| e.into_inner());
            if *last == Some(hash) {
                return Ok(false);
            }
        }
        let db = self.db.clone();
        let count = records.len();
        tokio::task::spawn_blocking(move || {
            if records.is_empty() {
                db.clear_layout().map(|_| ())
            } else {
                db.save_layout(&records).map(|_| ())
            }
        })
        .await??;
        *self.last_hash.lock().unwrap_or_else(|e| e.into_inner()) = Some(hash);
        tracing::info!(instances = count, "layout saved");
        Ok(true)
    }

    /// Treat `records` as already written (used after restoring from the store).
    fn remember(&self, records: &[LayoutRecord]) {
        if let Ok(json) = serde_json::to_vec(records) {
            *self.last_hash.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Sha256::digest(json).into());
        }
    }
}

pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub planner: Mutex<Planner>,
    pub persister: Persister,
    revision: watch::Sender<u64>,
}

impl AppState {
    pub fn new(catalog: Catalog, db: LayoutDb) -> Self {
        Self {
            catalog: Arc::new(catalog),
            planner: Mutex::new(Planner::new()),
            persister: Persister::new(db),
            revision: watch::channel(0).0,
        }
    }

    /// Load the catalog, open the local store and restore the last saved layout.
    pub async fn open(config: &ServerConfig) -> anyhow::Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => Catalog::load(path)?,
            None => Catalog::builtin()?,
        };
        let db = LayoutDb::new(config.db_path.clone());
        let loader = db.clone();
        let saved = tokio::task::spawn_blocking(move || loader.load_layout()).await??;

        let state = Self::new(catalog, db);
        if let Some(records) = saved {
            let report = state.planner.lock().await.restore(&records, &state.catalog);
            tracing::info!(
                placed = report.placed.len(),
                skipped = report.skipped.len(),
                "layout restored"
            );
            if report.skipped.is_empty() {
                state.persister.remember(&records);
            } else {
                // Drop the rejected records from the store right away.
                state.flush().await?;
            }
        }
        Ok(state)
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn layout_changed(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Resolve a definition by name. A moving instance whose definition is not in the
    /// catalog (a placeholder from a restored layout) resolves to its own definition.
    fn resolve(
        &self,
        planner: &Planner,
        name: &str,
        moving: Option<InstanceId>,
    ) -> Result<Arc<Definition>, (StatusCode, String)> {
        if let Some(def) = self.catalog.get(name) {
            return Ok(Arc::clone(def));
        }
        moving
            .and_then(|id| planner.instance(id))
            .filter(|inst| inst.definition.name == name)
            .map(|inst| Arc::clone(&inst.definition))
            .ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    format!("unknown definition: {name}"),
                )
            })
    }

    pub async fn flush(&self) -> anyhow::Result<bool> {
        let records = self.planner.lock().await.records();
        self.persister.write(records).await
    }
}

/// Background writer started by [`spawn_persistence`].
pub struct PersistenceTask {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl PersistenceTask {
    /// Stop waiting for new changes and wait for a write already in progress.
    /// Changes still inside the debounce window are left for the caller to flush.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.stop.send(true);
        self.handle.await?;
        Ok(())
    }
}

/// Write the layout once no change has arrived for `debounce`.
pub fn spawn_persistence(state: Arc<AppState>, debounce: Duration) -> PersistenceTask {
    let mut rx = state.subscribe();
    let (stop, mut stopped) = watch::channel(false);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = stopped.changed() => break,
            }
            let settled = loop {
                tokio::select! {
                    quiet = tokio::time::timeout(debounce, rx.changed()) => match quiet {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) | Err(_) => break true,
                    },
                    _ = stopped.changed() => break false,
                }
            };
            if !settled {
                break;
            }
            if let Err(e) = state.flush().await {
                tracing::error!(error = %e, "layout save failed");
            }
        }
    });
    PersistenceTask { stop, handle }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/catalog", get(catalog))
        .route("/api/layout", get(layout))
        .route("/api/layout/check", post(check))
        .route("/api/layout/place", post(place))
        .route("/api/layout/remove", post(remove))
        .route("/api/layout/clear", post(clear))
        .route("/api/layout/preview", post(preview))
        .route("/api/shape/rotate", post(rotate_shape))
        .route("/api/share", get(share_code).post(load_share_code))
        .with_state(state)
        // Local security: allow only loopback + Tailscale by default.
        .layer(middleware::from_fn(ip_allowlist))
        // Never use `Access-Control-Allow-Origin: *` here; any website open in the
        // browser could then read and rewrite the local layout.
        .layer(local_only_cors())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct CategoryView {
    category: String,
    definitions: Vec<Definition>,
}

async fn catalog(State(state): State<Arc<AppState>>) -> Json<Vec<CategoryView>> {
    let groups = state
        .catalog
        .by_category()
        .into_iter()
        .map(|(category, defs)| CategoryView {
            category,
            definitions: defs.iter().map(|d| Definition::clone(d)).collect(),
        })
        .collect();
    Json(groups)
}

#[derive(Debug, Serialize)]
struct InstanceView {
    #[serde(flatten)]
    instance: PlacedInstance,
    cells: Vec<usize>,
}

#[derive(Debug, Serialize)]
struct LayoutView {
    instances: Vec<InstanceView>,
    occupied: Vec<bool>,
    share_code: String,
    revision: u64,
}

fn layout_view(planner: &Planner, revision: u64) -> LayoutView {
    LayoutView {
        instances: planner
            .instances()
            .iter()
            .map(|inst| InstanceView {
                cells: inst.cells(),
                instance: inst.clone(),
            })
            .collect(),
        occupied: planner.occupancy().as_slice().to_vec(),
        share_code: encode_share_code(&planner.records()),
        revision,
    }
}

async fn layout(State(state): State<Arc<AppState>>) -> Json<LayoutView> {
    let planner = state.planner.lock().await;
    Json(layout_view(&planner, state.revision()))
}

#[derive(Debug, Deserialize)]
struct PlacementInput {
    name: String,
    row: i32,
    col: i32,
    #[serde(default)]
    rotation: Rotation,
    /// Set when an already placed instance is being dragged.
    #[serde(default)]
    moving: Option<InstanceId>,
}

async fn check(
    State(state): State<Arc<AppState>>,
    Json(input): Json<PlacementInput>,
) -> ApiResult<Verdict> {
    let planner = state.planner.lock().await;
    let def = state.resolve(&planner, &input.name, input.moving)?;
    Ok(Json(planner.can_place(
        input.row,
        input.col,
        &def,
        input.rotation,
        input.moving,
    )))
}

#[derive(Debug, Serialize, Deserialize)]
struct PlaceOutput {
    placed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    instance_id: Option<InstanceId>,
}

async fn place(
    State(state): State<Arc<AppState>>,
    Json(input): Json<PlacementInput>,
) -> ApiResult<PlaceOutput> {
    let mut planner = state.planner.lock().await;
    let def = state.resolve(&planner, &input.name, input.moving)?;
    let out = match planner.place(input.row, input.col, def, input.rotation, input.moving) {
        Ok(id) => {
            state.layout_changed();
            PlaceOutput {
                placed: true,
                reason: None,
                instance_id: Some(id),
            }
        }
        Err(reason) => PlaceOutput {
            placed: false,
            reason: Some(reason),
            instance_id: None,
        },
    };
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct RemoveInput {
    instance_id: InstanceId,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoveOutput {
    removed: bool,
}

async fn remove(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RemoveInput>,
) -> Json<RemoveOutput> {
    let removed = state.planner.lock().await.remove(input.instance_id).is_some();
    if removed {
        state.layout_changed();
    }
    Json(RemoveOutput { removed })
}

async fn clear(State(state): State<Arc<AppState>>) -> Json<LayoutView> {
    let mut planner = state.planner.lock().await;
    planner.clear();
    state.layout_changed();
    tracing::info!("layout cleared");
    Json(layout_view(&planner, state.revision()))
}

#[derive(Debug, Serialize)]
struct PreviewOutput {
    cells: Vec<i32>,
    verdict: Verdict,
}

async fn preview(
    State(state): State<Arc<AppState>>,
    Json(input): Json<PlacementInput>,
) -> ApiResult<PreviewOutput> {
    let planner = state.planner.lock().await;
    let def = state.resolve(&planner, &input.name, input.moving)?;
    Ok(Json(PreviewOutput {
        cells: occupied_cells(input.row, input.col, &def, input.rotation),
        verdict: planner.can_place(input.row, input.col, &def, input.rotation, input.moving),
    }))
}

#[derive(Debug, Deserialize)]
struct RotateInput {
    shape: Shape,
    #[serde(default)]
    turns: u32,
}

async fn rotate_shape(Json(input): Json<RotateInput>) -> Json<Shape> {
    Json(rotate(&input.shape, input.turns))
}

#[derive(Debug, Serialize, Deserialize)]
struct ShareCode {
    code: String,
}

async fn share_code(State(state): State<Arc<AppState>>) -> Json<ShareCode> {
    let records = state.planner.lock().await.records();
    Json(ShareCode {
        code: encode_share_code(&records),
    })
}

#[derive(Debug, Serialize)]
struct ShareLoadOutput {
    report: RestoreReport,
    layout: LayoutView,
}

async fn load_share_code(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ShareCode>,
) -> ApiResult<ShareLoadOutput> {
    let records =
        decode_share_code(&input.code).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let mut planner = state.planner.lock().await;
    let report = planner.restore(&records, &state.catalog);
    state.layout_changed();
    tracing::info!(
        placed = report.placed.len(),
        skipped = report.skipped.len(),
        "layout loaded from share code"
    );
    Ok(Json(ShareLoadOutput {
        report,
        layout: layout_view(&planner, state.revision()),
    }))
}

pub async fn serve(addr: SocketAddr, config: ServerConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    config: ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState::open(&config).await?);
    let persistence = spawn_persistence(Arc::clone(&state), config.debounce);
    let app = build_router(Arc::clone(&state));
    let addr = listener.local_addr()?;
    tracing::info!(%addr, db = %config.db_path.display(), "planner listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    persistence.shutdown().await?;
    // Pending changes still inside the debounce window.
    state.flush().await?;
    Ok(addr)
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

async fn ip_allowlist(
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let ip = peer.ip();
    if is_allowed_peer_ip(ip) {
        return next.run(req).await;
    }
    tracing::warn!(%ip, "rejected non-local peer");
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn is_allowed_peer_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    // Tailscale CGNAT range (100.64.0.0/10).
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            // 100.64.0.0 - 100.127.255.255
            o[0] == 100 && (64..=127).contains(&o[1])
        }
        IpAddr::V6(_v6) => false,
    }
}

fn local_only_cors() -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _req| {
            is_allowed_local_origin(origin)
        }))
}

fn is_allowed_local_origin(origin: &axum::http::HeaderValue) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // Origin is just scheme://host[:port]
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}
