// REST routes

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::address::AddressKey;
use crate::bus::{Address, AddressDescriptor, AddressFilter, AddressPatch};
use crate::persist::{Backup, Page};
use crate::telegram::Telegram;
use crate::types::{Direction, Error, Origin};
use crate::value::Value;

use super::ws::telegram_stream;
use super::{ApiError, ApiResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/addresses", get(list_addresses).post(create_address))
        .route("/api/addresses/ensure", post(ensure_address))
        .route(
            "/api/addresses/:key",
            get(get_address).put(update_address).delete(delete_address),
        )
        .route("/api/write", post(write_value))
        .route("/api/telegrams", get(recent_telegrams))
        .route("/api/ws", get(telegram_stream))
        .route("/api/blocks/types", get(list_types))
        .route("/api/blocks/reload", post(reload_custom_blocks))
        .route("/api/blocks/files", get(list_block_files))
        .route(
            "/api/blocks/files/:name",
            get(get_block_file).put(put_block_file).delete(delete_block_file),
        )
        .route("/api/blocks", get(list_blocks).post(create_block))
        .route("/api/blocks/:id", axum::routing::delete(delete_block))
        .route("/api/blocks/:id/enabled", post(set_enabled))
        .route("/api/blocks/:id/bind", post(bind_port))
        .route("/api/blocks/:id/unbind", post(unbind_port))
        .route("/api/blocks/:id/inputs/:port", post(set_input))
        .route("/api/blocks/:id/trigger", post(trigger_block))
        .route("/api/pages", get(list_pages).post(create_page))
        .route("/api/pages/:id", put(update_page).delete(delete_page))
        .route("/api/positions", get(get_positions).put(set_positions))
        .route("/api/backup", get(export_backup).post(import_backup))
}

// ── Addresses ────────────────────────────────────────────────────────────────

async fn list_addresses(
    State(state): State<AppState>,
    Query(filter): Query<AddressFilter>,
) -> Json<Vec<Address>> {
    Json(state.bus.list(&filter))
}

async fn get_address(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Address>> {
    let key = AddressKey::parse(&key)?;
    Ok(Json(state.bus.get(&key)?))
}

async fn create_address(
    State(state): State<AppState>,
    Json(desc): Json<AddressDescriptor>,
) -> ApiResult<Json<Address>> {
    Ok(Json(state.handle.create_address(desc).await?))
}

async fn ensure_address(
    State(state): State<AppState>,
    Json(desc): Json<AddressDescriptor>,
) -> ApiResult<Json<Address>> {
    Ok(Json(state.handle.ensure_address(desc).await?))
}

async fn update_address(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(patch): Json<AddressPatch>,
) -> ApiResult<Json<Address>> {
    Ok(Json(state.handle.update_address(&key, patch).await?))
}

async fn delete_address(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.delete_address(&key).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

#[derive(Deserialize)]
struct WriteRequest {
    address: String,
    /// Textual wire form; typed JSON values are accepted too.
    value: serde_json::Value,
}

async fn write_value(
    State(state): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<Json<Option<Telegram>>> {
    let dpt = AddressKey::parse(&req.address)
        .ok()
        .and_then(|key| state.bus.get(&key).ok())
        .and_then(|addr| addr.dpt);
    let value = match req.value {
        serde_json::Value::String(text) => Value::parse_text(&text, dpt.as_deref()),
        other => serde_json::from_value(other)
            .map_err(|e| ApiError(Error::TypeCoercion(e.to_string())))?,
    };
    Ok(Json(
        state.handle.write_address(&req.address, value, Origin::Api).await?,
    ))
}

#[derive(Deserialize)]
struct TelegramQuery {
    #[serde(default = "default_count")]
    count: usize,
}

fn default_count() -> usize {
    50
}

async fn recent_telegrams(
    State(state): State<AppState>,
    Query(query): Query<TelegramQuery>,
) -> Json<Vec<Telegram>> {
    Json(state.bus.broadcaster().recent(query.count))
}

// ── Blocks ───────────────────────────────────────────────────────────────────

async fn list_types(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let types = state.handle.list_types().await?;
    Ok(Json(serde_json::to_value(types).unwrap_or_default()))
}

async fn reload_custom_blocks(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let report = state.handle.reload_custom_blocks().await?;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

async fn list_blocks(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let blocks = state.handle.list_blocks().await?;
    Ok(Json(serde_json::to_value(blocks).unwrap_or_default()))
}

// ── Custom block files ───────────────────────────────────────────────────────

fn safe_module_name(name: &str) -> Result<String, ApiError> {
    crate::blocks::safe_module_name(name).map_err(ApiError)
}

async fn list_block_files(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&state.custom_blocks_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let meta = entry.metadata().ok();
            files.push(serde_json::json!({
                "filename": name,
                "size": meta.as_ref().map(|m| m.len()).unwrap_or(0),
                "modified": meta
                    .and_then(|m| m.modified().ok())
                    .map(chrono::DateTime::<chrono::Utc>::from),
            }));
        }
    }
    Ok(Json(serde_json::Value::Array(files)))
}

async fn get_block_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<String> {
    let name = safe_module_name(&name)?;
    std::fs::read_to_string(state.custom_blocks_dir.join(&name))
        .map_err(|_| ApiError(Error::NotFound(name)))
}

/// Upload or replace a module file. The source is parsed first so a broken
/// module is rejected instead of written; a valid one is stored and the
/// registry reloaded, restarting running instances of the replaced type.
async fn put_block_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let name = safe_module_name(&name)?;
    crate::blocks::CustomBlockDef::parse(&body).map_err(ApiError)?;
    std::fs::create_dir_all(&state.custom_blocks_dir).map_err(Error::from)?;
    std::fs::write(state.custom_blocks_dir.join(&name), body).map_err(Error::from)?;
    let report = state.handle.reload_custom_blocks().await?;
    Ok(Json(serde_json::json!({ "status": "saved", "filename": name, "report": report })))
}

async fn delete_block_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = safe_module_name(&name)?;
    let path = state.custom_blocks_dir.join(&name);
    if !path.exists() {
        return Err(ApiError(Error::NotFound(name)));
    }
    std::fs::remove_file(&path).map_err(Error::from)?;
    // instances of the now-missing type become unloadable on reload
    state.handle.reload_custom_blocks().await?;
    Ok(Json(serde_json::json!({ "status": "deleted", "filename": name })))
}

#[derive(Deserialize)]
struct CreateBlockRequest {
    block_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    page_id: Option<String>,
}

async fn create_block(
    State(state): State<AppState>,
    Json(req): Json<CreateBlockRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let info = state
        .handle
        .instantiate_block(&req.block_type, req.name, req.page_id)
        .await?;
    Ok(Json(serde_json::to_value(info).unwrap_or_default()))
}

async fn delete_block(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.delete_block(&id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

#[derive(Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

async fn set_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.set_enabled(&id, req.enabled).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct BindRequest {
    port: String,
    direction: Direction,
    address: String,
    #[serde(default)]
    auto_create: bool,
}

async fn bind_port(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BindRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let key = state
        .handle
        .bind(&id, &req.port, req.direction, &req.address, req.auto_create)
        .await?;
    Ok(Json(serde_json::json!({ "status": "bound", "address": key.to_string() })))
}

#[derive(Deserialize)]
struct UnbindRequest {
    port: String,
    direction: Direction,
}

async fn unbind_port(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UnbindRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.unbind(&id, &req.port, req.direction).await?;
    Ok(Json(serde_json::json!({ "status": "unbound" })))
}

#[derive(Deserialize)]
struct SetInputRequest {
    value: serde_json::Value,
}

async fn set_input(
    State(state): State<AppState>,
    Path((id, port)): Path<(String, String)>,
    Json(req): Json<SetInputRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let value = match req.value {
        serde_json::Value::String(text) => Value::parse_text(&text, None),
        other => serde_json::from_value(other)
            .map_err(|e| ApiError(Error::TypeCoercion(e.to_string())))?,
    };
    state.handle.set_input(&id, &port, value).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn trigger_block(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.trigger_block(&id).await?;
    Ok(Json(serde_json::json!({ "status": "triggered" })))
}

// ── Pages and positions ──────────────────────────────────────────────────────

async fn list_pages(State(state): State<AppState>) -> ApiResult<Json<Vec<Page>>> {
    Ok(Json(state.handle.list_pages().await?))
}

async fn create_page(
    State(state): State<AppState>,
    Json(page): Json<Page>,
) -> ApiResult<Json<Page>> {
    Ok(Json(state.handle.create_page(page).await?))
}

#[derive(Deserialize)]
struct PagePatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn update_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<PagePatch>,
) -> ApiResult<Json<Page>> {
    Ok(Json(
        state.handle.update_page(&id, patch.name, patch.description).await?,
    ))
}

async fn delete_page(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.delete_page(&id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn get_positions(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::Value::Object(
        state.handle.get_positions().await?,
    )))
}

async fn set_positions(
    State(state): State<AppState>,
    Json(positions): Json<serde_json::Map<String, serde_json::Value>>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.set_positions(positions).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ── Backup ───────────────────────────────────────────────────────────────────

async fn export_backup(State(state): State<AppState>) -> ApiResult<Json<Backup>> {
    Ok(Json(state.handle.export_backup().await?))
}

async fn import_backup(
    State(state): State<AppState>,
    Json(backup): Json<Backup>,
) -> ApiResult<Json<serde_json::Value>> {
    state.handle.import_backup(backup).await?;
    Ok(Json(serde_json::json!({ "status": "imported" })))
}
