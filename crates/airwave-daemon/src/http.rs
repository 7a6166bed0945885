use airwave_proto::bus::MessageBus;
use airwave_proto::protocol::{Action, Context, PlaybackState, Reply, Response};
use airwave_proto::station::StationView;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    bus: MessageBus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiState {
    status: PlaybackState,
    last: Option<StationView>,
    volume: u8,
    favorites: Vec<String>,
    stations: Vec<StationView>,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

pub fn router(bus: MessageBus) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play/:name", get(play_station).post(play_station))
        .route("/api/playpause", get(play_pause).post(play_pause))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/next", get(next_station).post(next_station))
        .route("/api/prev", get(prev_station).post(prev_station))
        .route("/api/volume/:volume", get(set_volume).post(set_volume))
        .route("/api/volume", get(get_volume))
        .route("/api/like/:name", post(like))
        .route("/api/dislike/:name", post(dislike))
        .route("/api/export", get(export_data))
        .route("/api/import", post(import_data))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { bus })
}

pub fn start_server(bind_address: String, port: u16, bus: MessageBus) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(bus);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

/// Ask the coordinator; no listener means the daemon is not ready.
async fn request(state: &HttpState, action: Action) -> Result<Response, StatusCode> {
    match state
        .bus
        .send(Context::Options, Context::Background, action)
        .await
    {
        Reply::Delivered(response) => Ok(response),
        Reply::Undeliverable => {
            warn!("HTTP API: coordinator unavailable");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Map a command response onto a status code, keeping the body.
async fn command(state: &HttpState, action: Action) -> (StatusCode, Json<Response>) {
    match request(state, action).await {
        Ok(response) => {
            let status = match response {
                Response::Ignored => StatusCode::NOT_FOUND,
                Response::Rejected(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::OK,
            };
            (status, Json(response))
        }
        Err(status) => (status, Json(Response::Ignored)),
    }
}

fn unexpected(response: Response) -> StatusCode {
    error!("HTTP API: unexpected response {:?}", response);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn get_state(State(state): State<HttpState>) -> Result<Json<ApiState>, StatusCode> {
    let status = match request(&state, Action::GetStatus).await? {
        Response::Status(s) => s,
        other => return Err(unexpected(other)),
    };
    let last = match request(&state, Action::GetLastStation).await? {
        Response::Station(s) => s,
        other => return Err(unexpected(other)),
    };
    let volume = match request(&state, Action::GetVolume).await? {
        Response::Volume(v) => v,
        other => return Err(unexpected(other)),
    };
    let favorites = match request(&state, Action::GetFavorites).await? {
        Response::Names(names) => names,
        other => return Err(unexpected(other)),
    };
    let stations = match request(&state, Action::GetStations).await? {
        Response::Stations(list) => list,
        other => return Err(unexpected(other)),
    };

    Ok(Json(ApiState {
        status,
        last,
        volume,
        favorites,
        stations,
    }))
}

async fn play_station(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    info!("HTTP API: Play station {}", name);
    command(&state, Action::Play(name)).await
}

async fn play_pause(State(state): State<HttpState>) -> impl IntoResponse {
    info!("HTTP API: Play/pause");
    command(&state, Action::PlayPause).await
}

async fn stop(State(state): State<HttpState>) -> impl IntoResponse {
    info!("HTTP API: Stop");
    command(&state, Action::Stop).await
}

async fn next_station(State(state): State<HttpState>) -> impl IntoResponse {
    info!("HTTP API: Next station");
    command(&state, Action::Next).await
}

async fn prev_station(State(state): State<HttpState>) -> impl IntoResponse {
    info!("HTTP API: Previous station");
    command(&state, Action::Prev).await
}

async fn set_volume(
    State(state): State<HttpState>,
    Path(volume): Path<i64>,
) -> impl IntoResponse {
    info!("HTTP API: Set volume to {}%", volume);
    command(&state, Action::SetVolume(volume)).await
}

async fn get_volume(State(state): State<HttpState>) -> Result<Json<VolumeStatus>, StatusCode> {
    match request(&state, Action::GetVolume).await? {
        Response::Volume(volume) => Ok(Json(VolumeStatus { volume })),
        other => Err(unexpected(other)),
    }
}

async fn like(State(state): State<HttpState>, Path(name): Path<String>) -> impl IntoResponse {
    command(&state, Action::Like(name)).await
}

async fn dislike(State(state): State<HttpState>, Path(name): Path<String>) -> impl IntoResponse {
    command(&state, Action::Dislike(name)).await
}

async fn export_data(State(state): State<HttpState>) -> Result<impl IntoResponse, StatusCode> {
    match request(&state, Action::ExportData).await? {
        Response::Exported(snapshot) => {
            Ok(([(header::CONTENT_TYPE, "application/json")], snapshot))
        }
        Response::Rejected(reason) => {
            warn!("HTTP API: export failed: {}", reason);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        other => Err(unexpected(other)),
    }
}

async fn import_data(State(state): State<HttpState>, body: String) -> StatusCode {
    match request(&state, Action::ImportData(body)).await {
        Ok(Response::Flag(true)) => StatusCode::OK,
        Ok(Response::Flag(false)) => StatusCode::UNPROCESSABLE_ENTITY,
        Ok(other) => unexpected(other),
        Err(status) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airwave_proto::bus::Handler;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const SNAPSHOT: &str = r#"{"stations":{}}"#;

    struct FakeBackground;

    #[async_trait]
    impl Handler for FakeBackground {
        async fn handle(&mut self, from: Context, action: Action) -> Response {
            assert_eq!(from, Context::Options);
            match action {
                Action::GetStatus => Response::Status(PlaybackState::Playing),
                Action::GetLastStation => Response::Station(None),
                Action::GetVolume => Response::Volume(42),
                Action::GetFavorites => Response::Names(vec!["fip".into()]),
                Action::GetStations => Response::Stations(Vec::new()),
                Action::Play(name) if name == "fip" => Response::Ack,
                Action::Play(_) => Response::Ignored,
                Action::SetVolume(v) => Response::Volume(v.clamp(0, 100) as u8),
                Action::ExportData => Response::Exported(SNAPSHOT.into()),
                Action::ImportData(s) => Response::Flag(s == SNAPSHOT),
                _ => Response::Ack,
            }
        }
    }

    async fn app() -> Router {
        let bus = MessageBus::new();
        bus.on_message(Context::Background, FakeBackground).await;
        router(bus)
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_state_aggregates_coordinator_answers() {
        let (status, body) = call(app().await, "GET", "/api/state", "").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "playing");
        assert_eq!(json["volume"], 42);
        assert_eq!(json["favorites"], serde_json::json!(["fip"]));
        assert!(json["last"].is_null());
    }

    #[tokio::test]
    async fn test_play_maps_unknown_station_to_404() {
        let (status, _) = call(app().await, "POST", "/api/play/fip", "").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app().await, "GET", "/api/play/ghost", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_volume_goes_through_the_coordinator() {
        let (status, body) = call(app().await, "POST", "/api/volume/150", "").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json, serde_json::json!({"type": "volume", "data": 100}));

        let (status, body) = call(app().await, "GET", "/api/volume", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"volume":42}"#);
    }

    #[tokio::test]
    async fn test_export_and_import() {
        let (status, body) = call(app().await, "GET", "/api/export", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, SNAPSHOT);

        let (status, _) = call(app().await, "POST", "/api/import", SNAPSHOT).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app().await, "POST", "/api/import", "garbage").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_missing_coordinator_is_503() {
        let app = router(MessageBus::new());
        let (status, _) = call(app.clone(), "POST", "/api/stop", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = call(app, "GET", "/api/state", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
