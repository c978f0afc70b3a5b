use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use exchange_core::{MatchError, Participant, ParticipantId, Roster, SearchOptions};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod telemetry;

use config::Config;
use error::{AppError, PersistError};

#[derive(Clone)]
pub struct AppState {
    roster: Arc<Roster>,
    pins: Arc<RwLock<HashMap<ParticipantId, String>>>,
    persist_path: Option<PathBuf>,
    persist_lock: Arc<Mutex<()>>,
    admin_password: String,
    search: SearchOptions,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl AppState {
    /// Empty state; nothing is read from `config.persist_path`.
    pub fn new(config: &Config) -> Self {
        Self {
            roster: Arc::new(Roster::new()),
            pins: Arc::new(RwLock::new(HashMap::new())),
            persist_path: config.persist_path.clone(),
            persist_lock: Arc::new(Mutex::new(())),
            admin_password: config.admin_password.clone(),
            search: config.search_options(),
        }
    }

    /// State restored from the snapshot at `config.persist_path`, if any.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut state = Self::new(config);
        let Some(path) = &config.persist_path else {
            return Ok(state);
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "no snapshot yet, starting empty");
                return Ok(state);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading snapshot {}", path.display()))
            }
        };
        let records: Vec<ParticipantRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;

        let mut pins = HashMap::with_capacity(records.len());
        let mut participants = Vec::with_capacity(records.len());
        for record in records {
            pins.insert(record.participant.id.clone(), record.pin_hash);
            participants.push(record.participant);
        }
        info!(participants = participants.len(), path = %path.display(), "snapshot loaded");
        state.roster = Arc::new(Roster::from_participants(participants)?);
        state.pins = Arc::new(RwLock::new(pins));
        Ok(state)
    }

    pub async fn with_persistence(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let config = Config {
            persist_path: Some(path.into()),
            ..Config::default()
        };
        Self::from_config(&config).await
    }

    /// Roster calls block on its lock, which a global run holds for the whole
    /// search, so they run off the async workers.
    async fn on_roster<T, F>(&self, op: F) -> Result<Result<T, MatchError>, JoinError>
    where
        F: FnOnce(&Roster) -> Result<T, MatchError> + Send + 'static,
        T: Send + 'static,
    {
        let roster = Arc::clone(&self.roster);
        tokio::task::spawn_blocking(move || op(&roster)).await
    }

    async fn records(&self) -> Result<Vec<ParticipantRecord>, PersistError> {
        let participants = self.on_roster(|roster| roster.snapshot()).await??;
        let pins = self.pins.read().await;
        Ok(participants
            .into_iter()
            .map(|participant| ParticipantRecord {
                pin_hash: pins.get(&participant.id).cloned().unwrap_or_default(),
                participant,
            })
            .collect())
    }

    /// Writes the full participant set. Writers are serialised and each takes
    /// its snapshot under the lock, so the last write is the newest state.
    async fn persist(&self) -> Result<(), PersistError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let records = self.records().await?;
        let json = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn authenticate(&self, name: &str, pin: &str) -> Result<Participant, AppError> {
        let name = name.trim();
        let pin = pin.trim();
        if name.is_empty() || pin.is_empty() {
            return Err(AppError::BadRequest("name and pin required".into()));
        }
        let lookup = name.to_string();
        let participant = self
            .on_roster(move |roster| roster.find_by_name(&lookup))
            .await??
            .ok_or_else(|| AppError::NotFound("participant not found".into()))?;

        let pins = self.pins.read().await;
        if pins.get(&participant.id) != Some(&hash_pin(&participant.id, pin)) {
            return Err(AppError::Unauthorized("invalid pin".into()));
        }
        Ok(participant)
    }

    fn require_admin(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let provided = headers
            .get("x-admin-password")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != self.admin_password {
            return Err(AppError::Unauthorized("invalid admin password".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantRecord {
    #[serde(flatten)]
    pub participant: Participant,
    pub pin_hash: String,
}

fn hash_pin(id: &str, pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b":");
    hasher.update(pin.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/exchange/participants", post(create_participant))
        .route("/exchange/participants/:name/assignment", get(own_assignment))
        .route("/exchange/draw", post(draw_recipient))
        .route("/exchange/generate", post(generate_exchange))
        .route("/exchange/summary", get(summary))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
struct CreateParticipantRequest {
    name: String,
    family: String,
    pin: String,
}

#[derive(Serialize)]
struct ParticipantView {
    id: String,
    name: String,
    family: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct RecipientView {
    name: String,
    family: Option<String>,
}

impl From<&Participant> for RecipientView {
    fn from(p: &Participant) -> Self {
        Self {
            name: p.name.clone(),
            family: p.family.clone(),
        }
    }
}

#[derive(Deserialize)]
struct DrawRequest {
    name: String,
    pin: String,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum DrawStatus {
    Assigned,
    AlreadyAssigned,
}

#[derive(Serialize)]
struct DrawResponse {
    status: DrawStatus,
    recipient: RecipientView,
}

#[derive(Serialize)]
struct AssignmentResponse {
    recipient: Option<RecipientView>,
}

#[derive(Deserialize)]
struct GenerateParams {
    seed: Option<u64>,
}

#[derive(Serialize)]
struct PairView {
    giver: String,
    recipient: String,
}

#[derive(Serialize)]
struct GenerateResponse {
    assignments: Vec<PairView>,
    steps: u64,
}

#[derive(Serialize)]
struct SummaryEntry {
    name: String,
    family: Option<String>,
    recipient: Option<RecipientView>,
}

async fn create_participant(
    State(state): State<AppState>,
    Json(payload): Json<CreateParticipantRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = payload.name.trim();
    let family = payload.family.trim();
    let pin = payload.pin.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("name required".into()));
    }
    if family.is_empty() {
        return Err(AppError::BadRequest("family required".into()));
    }
    if pin.is_empty() {
        return Err(AppError::BadRequest("pin required".into()));
    }

    let participant = Participant::new(Uuid::new_v4().to_string(), name, family);
    let pin_hash = hash_pin(&participant.id, pin);
    let added = participant.clone();
    state.on_roster(move |roster| roster.add(added)).await??;
    state
        .pins
        .write()
        .await
        .insert(participant.id.clone(), pin_hash);

    if let Err(err) = state.persist().await {
        let id = participant.id.clone();
        if !state.on_roster(move |roster| roster.withdraw(&id)).await?? {
            // Someone drew them before the rollback; keep them registered.
            warn!(name = %participant.name, "registration kept in memory after failed save");
            return Err(AppError::MatchedButNotSaved(err));
        }
        state.pins.write().await.remove(&participant.id);
        return Err(AppError::Storage(err));
    }

    info!(name = %participant.name, family = ?participant.family, "participant registered");
    Ok((
        StatusCode::CREATED,
        Json(ParticipantView {
            id: participant.id,
            name: participant.name,
            family: participant.family,
        }),
    ))
}

async fn draw_recipient(
    State(state): State<AppState>,
    Json(payload): Json<DrawRequest>,
) -> Result<Json<DrawResponse>, AppError> {
    let giver = state.authenticate(&payload.name, &payload.pin).await?;

    let giver_id = giver.id.clone();
    let outcome = state
        .on_roster(move |roster| roster.draw_for(&giver_id, &mut rand::thread_rng()))
        .await??;
    if outcome.is_new() {
        state
            .persist()
            .await
            .map_err(AppError::MatchedButNotSaved)?;
        info!(giver = %giver.name, "recipient drawn");
    }

    let recipient_id = outcome.recipient().clone();
    let recipient = state
        .on_roster(move |roster| roster.get(&recipient_id))
        .await??
        .ok_or_else(|| anyhow!("assigned recipient {} is not in the roster", outcome.recipient()))?;
    let status = if outcome.is_new() {
        DrawStatus::Assigned
    } else {
        DrawStatus::AlreadyAssigned
    };
    Ok(Json(DrawResponse {
        status,
        recipient: RecipientView::from(&recipient),
    }))
}

async fn own_assignment(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AssignmentResponse>, AppError> {
    let pin = headers
        .get("x-participant-pin")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("participant pin required".into()))?;
    let participant = state.authenticate(&name, pin).await?;

    let recipient = match participant.assigned_to {
        Some(id) => state
            .on_roster(move |roster| roster.get(&id))
            .await??
            .as_ref()
            .map(RecipientView::from),
        None => None,
    };
    Ok(Json(AssignmentResponse { recipient }))
}

async fn generate_exchange(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<GenerateParams>,
) -> Result<Json<GenerateResponse>, AppError> {
    state.require_admin(&headers)?;

    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy);
    let options = state.search;
    let solution = state
        .on_roster(move |roster| roster.generate(&mut rng, options))
        .await??;

    state
        .persist()
        .await
        .map_err(AppError::MatchedButNotSaved)?;

    let participants = state.on_roster(|roster| roster.snapshot()).await??;
    let names: HashMap<&str, &str> = participants
        .iter()
        .map(|p| (p.id.as_str(), p.name.as_str()))
        .collect();
    let assignments = participants
        .iter()
        .filter_map(|giver| {
            let recipient = solution.assignment.recipient_of(&giver.id)?;
            Some(PairView {
                giver: giver.name.clone(),
                recipient: names.get(recipient.as_str())?.to_string(),
            })
        })
        .collect();

    Ok(Json(GenerateResponse {
        assignments,
        steps: solution.stats.steps,
    }))
}

async fn summary(State(state): State<AppState>) -> Result<Json<Vec<SummaryEntry>>, AppError> {
    let participants = state.on_roster(|roster| roster.snapshot()).await??;
    let by_id: HashMap<&str, &Participant> =
        participants.iter().map(|p| (p.id.as_str(), p)).collect();

    let entries = participants
        .iter()
        .map(|p| SummaryEntry {
            name: p.name.clone(),
            family: p.family.clone(),
            recipient: p
                .assigned_to
                .as_deref()
                .and_then(|id| by_id.get(id))
                .map(|r| RecipientView::from(*r)),
        })
        .collect();
    Ok(Json(entries))
}
