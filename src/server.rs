use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::assembler::Diagnostic;
use crate::ccp::TPA_START;
use crate::config::Config;
use crate::metrics::{self, init_metrics, record_api_request, Timer};
use crate::session::{
    lock_session, CpuState, RunReport, Session, SessionError, SessionManager, SessionMode,
    SessionSummary,
};

/// Largest memory window one request may read
pub const MAX_MEMORY_READ: usize = 4096;
const DEFAULT_MEMORY_READ: usize = 256;
const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::Memory(_)) => StatusCode::BAD_REQUEST,
            ApiError::Session(SessionError::Disk(_)) | ApiError::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// Requests

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub input: String,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub program: Vec<u8>,
    pub address: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub start_address: Option<u16>,
    pub max_cycles: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryQuery {
    pub address: u16,
    pub length: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AssembleRequest {
    pub source: String,
    pub address: Option<u16>,
}

// Responses

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub output: String,
    pub cpu: CpuState,
    pub mode: SessionMode,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub cpu: CpuState,
    pub report: Option<RunReport>,
    pub mode: SessionMode,
}

impl ExecutionResult {
    fn new(session: &mut Session, report: Option<RunReport>) -> Self {
        ExecutionResult {
            output: session.take_output(),
            cpu: session.state(),
            report,
            mode: session.mode(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StepResult {
    pub cycles: u32,
    pub cpu: CpuState,
}

#[derive(Debug, Serialize)]
pub struct MemoryData {
    pub address: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct AssembleResult {
    pub origin: u16,
    pub bytes: Vec<u8>,
    pub symbols: BTreeMap<String, u16>,
    pub diagnostics: Vec<Diagnostic>,
    pub loaded: bool,
}

pub struct AppState {
    pub sessions: Arc<SessionManager>,
    /// Cycle budget for run requests that do not name one
    pub max_cycles: u64,
    /// No request runs for more than this many cycles
    pub max_cycles_ceiling: u64,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>, max_cycles: u64, max_cycles_ceiling: u64) -> Self {
        AppState {
            sessions,
            max_cycles,
            max_cycles_ceiling,
        }
    }

    /// Cycle budget for one request, capped at the ceiling.
    pub fn cycle_budget(&self, requested: Option<u64>) -> u64 {
        requested.unwrap_or(self.max_cycles).min(self.max_cycles_ceiling)
    }
}

type State = Arc<AppState>;

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    init_metrics();

    let sessions = Arc::new(SessionManager::from_config(&config));
    let state = Arc::new(AppState::new(
        sessions.clone(),
        config.max_cycles,
        config.max_cycles_ceiling,
    ));
    let _sweeper = spawn_sweeper(sessions, config.sweep_interval());

    let addr = config.socket_addr();
    info!("8080 CP/M emulation server starting on http://{}", addr);
    info!("  POST   /api/emulator/session               - Create session");
    info!("  GET    /api/emulator/sessions              - List sessions");
    info!("  GET    /api/emulator/session/:id           - Output and CPU state");
    info!("  POST   /api/emulator/session/:id/input     - Queue console input");
    info!("  POST   /api/emulator/session/:id/command   - Run a CCP command");
    info!("  POST   /api/emulator/session/:id/load      - Load a program");
    info!("  POST   /api/emulator/session/:id/run       - Run");
    info!("  POST   /api/emulator/session/:id/step      - Single step");
    info!("  POST   /api/emulator/session/:id/reset     - Reset");
    info!("  GET    /api/emulator/session/:id/memory    - Read memory");
    info!("  POST   /api/emulator/session/:id/assemble  - Assemble and load");
    info!("  DELETE /api/emulator/session/:id           - Delete session");
    info!("  GET    /metrics                            - Prometheus metrics");

    warp::serve(routes(state)).run(addr).await;
    Ok(())
}

/// Periodically drop idle sessions.
pub fn spawn_sweeper(sessions: Arc<SessionManager>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = sessions.sweep_expired(Utc::now());
            if removed > 0 {
                info!("expired {} idle session(s), {} active", removed, sessions.len());
            }
        }
    })
}

pub fn routes(state: State) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST", "DELETE"]);

    let create_session = warp::path!("api" / "emulator" / "session")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(create_session_handler);

    let list_sessions = warp::path!("api" / "emulator" / "sessions")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(list_sessions_handler);

    let get_session = warp::path!("api" / "emulator" / "session" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_session_handler);

    let send_input = warp::path!("api" / "emulator" / "session" / String / "input")
        .and(warp::post())
        .and(json_body::<InputRequest>())
        .and(with_state(state.clone()))
        .and_then(input_handler);

    let run_command = warp::path!("api" / "emulator" / "session" / String / "command")
        .and(warp::post())
        .and(json_body::<CommandRequest>())
        .and(with_state(state.clone()))
        .and_then(command_handler);

    let load_program = warp::path!("api" / "emulator" / "session" / String / "load")
        .and(warp::post())
        .and(json_body::<LoadRequest>())
        .and(with_state(state.clone()))
        .and_then(load_program_handler);

    let run = warp::path!("api" / "emulator" / "session" / String / "run")
        .and(warp::post())
        .and(json_body::<RunRequest>())
        .and(with_state(state.clone()))
        .and_then(run_handler);

    let step = warp::path!("api" / "emulator" / "session" / String / "step")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(step_handler);

    let reset = warp::path!("api" / "emulator" / "session" / String / "reset")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(reset_handler);

    let read_memory = warp::path!("api" / "emulator" / "session" / String / "memory")
        .and(warp::get())
        .and(warp::query::<MemoryQuery>())
        .and(with_state(state.clone()))
        .and_then(read_memory_handler);

    let assemble = warp::path!("api" / "emulator" / "session" / String / "assemble")
        .and(warp::post())
        .and(json_body::<AssembleRequest>())
        .and(with_state(state.clone()))
        .and_then(assemble_handler);

    let delete_session = warp::path!("api" / "emulator" / "session" / String)
        .and(warp::delete())
        .and(with_state(state))
        .and_then(delete_session_handler);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(metrics_handler);

    create_session
        .or(list_sessions)
        .or(get_session)
        .or(send_input)
        .or(run_command)
        .or(load_program)
        .or(run)
        .or(step)
        .or(reset)
        .or(read_memory)
        .or(assemble)
        .or(delete_session)
        .or(metrics)
        .with(cors)
}

fn with_state(state: State) -> impl Filter<Extract = (State,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// Build the envelope for `result` and record the request.
fn respond<T: Serialize>(
    method: &str,
    endpoint: &str,
    timer: Timer,
    result: Result<T, ApiError>,
) -> warp::reply::WithStatus<warp::reply::Json> {
    let (status, reply) = match result {
        Ok(data) => (StatusCode::OK, warp::reply::json(&ApiResponse::success(data))),
        Err(err) => {
            let status = err.status();
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!("{} {} failed: {}", method, endpoint, err);
            }
            (status, warp::reply::json(&ApiResponse::<()>::error(err.to_string())))
        }
    };
    record_api_request(method, endpoint, status.as_u16(), timer.elapsed());
    warp::reply::with_status(reply, status)
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

/// Run `f` against one session on the blocking pool.
async fn with_session<T, F>(state: &AppState, id: &str, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&mut Session) -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    let session = state.sessions.get(id)?;
    blocking(move || {
        let mut session = lock_session(&session);
        f(&mut session)
    })
    .await
}

async fn create_session_handler(state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let sessions = state.sessions.clone();
    let result = blocking(move || sessions.create())
        .await
        .map(|session_id| CreatedSession { session_id });
    Ok(respond("POST", "/session", timer, result))
}

async fn list_sessions_handler(state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let result: Result<Vec<SessionSummary>, ApiError> = Ok(state.sessions.list());
    Ok(respond("GET", "/sessions", timer, result))
}

async fn get_session_handler(id: String, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let result = with_session(&state, &id, |session| {
        Ok(SessionView {
            session_id: session.id().to_string(),
            output: session.take_output(),
            cpu: session.state(),
            mode: session.mode(),
        })
    })
    .await;
    Ok(respond("GET", "/session/:id", timer, result))
}

async fn input_handler(id: String, request: InputRequest, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let max_cycles = state.cycle_budget(None);
    let result = with_session(&state, &id, move |session| {
        let report = session.input_line(&request.input, max_cycles);
        Ok(ExecutionResult::new(session, report))
    })
    .await;
    Ok(respond("POST", "/session/:id/input", timer, result))
}

async fn command_handler(id: String, request: CommandRequest, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let max_cycles = state.cycle_budget(None);
    let result = with_session(&state, &id, move |session| {
        let report = session.execute_command(&request.command, max_cycles);
        Ok(ExecutionResult::new(session, report))
    })
    .await;

    // EXIT ends the session once its goodbye has been collected
    if matches!(&result, Ok(executed) if executed.mode == SessionMode::Exited) {
        if let Err(err) = state.sessions.remove(&id) {
            warn!("could not drop exited session {}: {}", id, err);
        }
    }
    Ok(respond("POST", "/session/:id/command", timer, result))
}

async fn load_program_handler(id: String, request: LoadRequest, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let result = with_session(&state, &id, move |session| {
        let address = request.address.unwrap_or(TPA_START);
        session.load(address, &request.program)?;
        Ok(format!("Loaded {} bytes at {:04X}H", request.program.len(), address))
    })
    .await;
    Ok(respond("POST", "/session/:id/load", timer, result))
}

async fn run_handler(id: String, request: RunRequest, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let max_cycles = state.cycle_budget(request.max_cycles);
    let result = with_session(&state, &id, move |session| {
        let report = session.run(request.start_address, max_cycles);
        Ok(ExecutionResult::new(session, Some(report)))
    })
    .await;
    Ok(respond("POST", "/session/:id/run", timer, result))
}

async fn step_handler(id: String, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let result = with_session(&state, &id, |session| {
        let cycles = session.step();
        Ok(StepResult {
            cycles,
            cpu: session.state(),
        })
    })
    .await;
    Ok(respond("POST", "/session/:id/step", timer, result))
}

async fn reset_handler(id: String, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let result = with_session(&state, &id, |session| {
        session.reset();
        Ok(session.state())
    })
    .await;
    Ok(respond("POST", "/session/:id/reset", timer, result))
}

async fn read_memory_handler(id: String, query: MemoryQuery, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let length = query.length.unwrap_or(DEFAULT_MEMORY_READ).min(MAX_MEMORY_READ);
    let result = with_session(&state, &id, move |session| {
        Ok(MemoryData {
            address: query.address,
            data: session.dump(query.address, length)?,
        })
    })
    .await;
    Ok(respond("GET", "/session/:id/memory", timer, result))
}

async fn assemble_handler(id: String, request: AssembleRequest, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let result = with_session(&state, &id, move |session| {
        let assembly = session.assemble(&request.source, request.address.unwrap_or(TPA_START))?;
        let loaded = assembly.is_ok();
        Ok(AssembleResult {
            origin: assembly.origin,
            bytes: assembly.bytes,
            symbols: assembly.symbols,
            diagnostics: assembly.diagnostics,
            loaded,
        })
    })
    .await;
    Ok(respond("POST", "/session/:id/assemble", timer, result))
}

async fn delete_session_handler(id: String, state: State) -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    let result = state
        .sessions
        .remove(&id)
        .map(|()| format!("Session {} deleted", id))
        .map_err(ApiError::from);
    Ok(respond("DELETE", "/session/:id", timer, result))
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    let timer = Timer::new();
    match metrics::render() {
        Ok(metrics_text) => {
            record_api_request("GET", "/metrics", 200, timer.elapsed());
            Ok(warp::reply::with_status(
                warp::reply::with_header(metrics_text, "content-type", "text/plain; version=0.0.4"),
                StatusCode::OK,
            ))
        }
        Err(err) => {
            error!("failed to encode metrics: {}", err);
            record_api_request("GET", "/metrics", 500, timer.elapsed());
            Ok(warp::reply::with_status(
                warp::reply::with_header("Error encoding metrics".to_string(), "content-type", "text/plain"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::{json, Value};

    fn state() -> State {
        let sessions = Arc::new(SessionManager::new(2, None, Duration::seconds(60)));
        Arc::new(AppState::new(sessions, 100_000, 1_000_000))
    }

    async fn call(state: &State, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = warp::test::request().method(method).path(path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.reply(&routes(state.clone())).await;
        let status = response.status();
        let value = serde_json::from_slice(response.body()).unwrap_or(Value::Null);
        (status, value)
    }

    async fn create(state: &State) -> String {
        let (status, body) = call(state, "POST", "/api/emulator/session", None).await;
        assert_eq!(status, StatusCode::OK);
        body["data"]["sessionId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let state = state();
        let id = create(&state).await;

        let (status, body) = call(&state, "GET", &format!("/api/emulator/session/{}", id), None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["sessionId"], id.as_str());
        assert_eq!(body["data"]["output"], "A>");
        assert_eq!(body["data"]["cpu"]["halted"], false);
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let state = state();
        let (status, body) = call(&state, "GET", "/api/emulator/session/nope", None).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "session nope not found");
    }

    #[tokio::test]
    async fn test_assemble_and_run() {
        let state = state();
        let id = create(&state).await;
        let base = format!("/api/emulator/session/{}", id);

        let (_, body) = call(
            &state,
            "POST",
            &format!("{}/assemble", base),
            Some(json!({ "source": "MVI A,5\nMVI B,3\nADD B\nHLT", "address": 256 })),
        )
        .await;
        assert_eq!(body["data"]["loaded"], true);
        assert_eq!(body["data"]["bytes"], json!([0x3E, 5, 0x06, 3, 0x80, 0x76]));

        let (status, body) = call(
            &state,
            "POST",
            &format!("{}/run", base),
            Some(json!({ "startAddress": 256, "maxCycles": 1000 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["cpu"]["a"], 8);
        assert_eq!(body["data"]["report"]["cycles"], 25);
        assert_eq!(body["data"]["report"]["outcome"], "halted");
    }

    #[tokio::test]
    async fn test_assemble_reports_diagnostics() {
        let state = state();
        let id = create(&state).await;

        let (_, body) = call(
            &state,
            "POST",
            &format!("/api/emulator/session/{}/assemble", id),
            Some(json!({ "source": "FOO A\nNOP" })),
        )
        .await;

        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["loaded"], false);
        assert_eq!(body["data"]["diagnostics"][0]["line"], 1);
    }

    #[tokio::test]
    async fn test_run_budget_is_capped() {
        let sessions = Arc::new(SessionManager::new(1, None, Duration::seconds(60)));
        let state = Arc::new(AppState::new(sessions, 100, 1_000));
        let id = create(&state).await;
        let base = format!("/api/emulator/session/{}", id);

        // JMP 0100H forever
        call(&state, "POST", &format!("{}/load", base), Some(json!({ "program": [0xC3, 0x00, 0x01] }))).await;
        let (status, body) = call(
            &state,
            "POST",
            &format!("{}/run", base),
            Some(json!({ "startAddress": 256, "maxCycles": u64::MAX })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["report"]["outcome"], "cycleLimit");
        assert_eq!(body["data"]["report"]["cycles"], 1_000);

        let (_, body) = call(&state, "POST", &format!("{}/run", base), Some(json!({}))).await;
        assert_eq!(body["data"]["report"]["cycles"], 100);
    }

    #[tokio::test]
    async fn test_input_resumes_waiting_program() {
        let state = state();
        let id = create(&state).await;
        let base = format!("/api/emulator/session/{}", id);

        // Read a character, halt
        call(&state, "POST", &format!("{}/load", base), Some(json!({ "program": [0x0E, 0x01, 0xCD, 0x05, 0x00, 0x76] }))).await;
        let (_, body) = call(&state, "POST", &format!("{}/run", base), Some(json!({ "startAddress": 256 }))).await;
        assert_eq!(body["data"]["report"]["outcome"], "awaitingInput");
        assert_eq!(body["data"]["cpu"]["awaitingInput"], true);

        let (_, body) = call(&state, "POST", &format!("{}/input", base), Some(json!({ "input": "k" }))).await;

        assert_eq!(body["data"]["report"]["outcome"], "halted");
        assert_eq!(body["data"]["cpu"]["a"], u8::from(b'k'));
    }

    #[tokio::test]
    async fn test_command_endpoint() {
        let state = state();
        let id = create(&state).await;

        let (_, body) = call(
            &state,
            "POST",
            &format!("/api/emulator/session/{}/command", id),
            Some(json!({ "command": "dir" })),
        )
        .await;

        // The greeting prompt is still queued ahead of the command output
        assert_eq!(body["data"]["output"], "A>NO FILE\r\nA>");
        assert_eq!(body["data"]["report"], Value::Null);
    }

    #[tokio::test]
    async fn test_memory_read_is_clamped() {
        let state = state();
        let id = create(&state).await;

        let (status, body) = call(
            &state,
            "GET",
            &format!("/api/emulator/session/{}/memory?address=0&length=9000", id),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = body["data"]["data"].as_array().unwrap();
        assert_eq!(data.len(), MAX_MEMORY_READ);
        assert_eq!(data[0], 0x76);
        assert_eq!(data[5], 0xC9);
    }

    #[tokio::test]
    async fn test_memory_read_past_end_is_rejected() {
        let state = state();
        let id = create(&state).await;

        let (status, body) = call(
            &state,
            "GET",
            &format!("/api/emulator/session/{}/memory?address=65535&length=2", id),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_step_reset_and_delete() {
        let state = state();
        let id = create(&state).await;
        let base = format!("/api/emulator/session/{}", id);

        call(&state, "POST", &format!("{}/load", base), Some(json!({ "program": [0x3E, 0x42], "address": 0 }))).await;
        let (_, body) = call(&state, "POST", &format!("{}/step", base), None).await;
        assert_eq!(body["data"]["cycles"], 7);
        assert_eq!(body["data"]["cpu"]["a"], 0x42);

        let (_, body) = call(&state, "POST", &format!("{}/reset", base), None).await;
        assert_eq!(body["data"]["a"], 0);
        assert_eq!(body["data"]["pc"], 0);

        let (status, _) = call(&state, "DELETE", &base, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "GET", &base, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_editor_through_input_then_exit() {
        let state = state();
        let id = create(&state).await;
        let base = format!("/api/emulator/session/{}", id);

        let (_, body) = call(&state, "POST", &format!("{}/command", base), Some(json!({ "command": "ED NOTE.TXT" }))).await;
        assert_eq!(body["data"]["mode"], "editor");

        for line in ["I", "hello", "", "S", "Q"] {
            let (status, _) = call(&state, "POST", &format!("{}/input", base), Some(json!({ "input": line }))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, body) = call(&state, "POST", &format!("{}/command", base), Some(json!({ "command": "TYPE NOTE.TXT" }))).await;
        assert_eq!(body["data"]["mode"], "ccp");
        assert_eq!(body["data"]["output"], "hello\r\nA>");

        let (_, body) = call(&state, "POST", &format!("{}/command", base), Some(json!({ "command": "EXIT" }))).await;
        assert_eq!(body["data"]["output"], "GOODBYE\r\n");
        assert_eq!(body["data"]["mode"], "exited");

        let (status, _) = call(&state, "GET", &base, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        init_metrics();
        let state = state();
        create(&state).await;

        let response = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&routes(state))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8_lossy(response.body());
        assert!(text.contains("api_requests_total"));
    }
}
