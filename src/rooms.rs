pub mod msg;
pub mod registry;
mod ws;

use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::State,
    routing::get,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{AppResult, AppState, rooms::registry::RoomRegistry};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(list_rooms).post(new_room))
        .route("/ws", get(ws::chat_ws))
}

#[derive(Debug, Serialize)]
pub struct RoomListing {
    pub id: String,
    pub name: String,
}

#[debug_handler(state = AppState)]
async fn list_rooms(
    State(db_pool): State<SqlitePool>,
    State(registry): State<Arc<RoomRegistry>>,
) -> AppResult<Json<Vec<RoomListing>>> {
    let provisioned: Vec<(String, String)> =
        sqlx::query_as("SELECT id,name FROM rooms ORDER BY name")
            .fetch_all(&db_pool)
            .await?;

    let mut listings: Vec<RoomListing> = provisioned
        .into_iter()
        .map(|(id, name)| RoomListing { id, name })
        .collect();

    // rooms created lazily on first join only exist in the registry
    for id in registry.active_rooms() {
        if !listings.iter().any(|listing| listing.id == id) {
            listings.push(RoomListing {
                name: id.clone(),
                id,
            });
        }
    }

    Ok(Json(listings))
}

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomQuery {
    name: String,
}

#[debug_handler(state = AppState)]
async fn new_room(
    State(db_pool): State<SqlitePool>,
    State(registry): State<Arc<RoomRegistry>>,

    Json(NewRoomQuery { name }): Json<NewRoomQuery>,
) -> AppResult<Json<RoomListing>> {
    let id = Uuid::now_v7().to_string();
    sqlx::query("INSERT INTO rooms (id,name) values (?,?)")
        .bind(&id)
        .bind(&name)
        .execute(&db_pool)
        .await?;
    registry.provision(&id);

    Ok(Json(RoomListing { id, name }))
}
