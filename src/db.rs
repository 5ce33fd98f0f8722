use sqlx::SqlitePool;

// Only explicitly provisioned rooms live in the database; message history is
// in-memory and bounded (see rooms::registry). Rooms are never deleted here.
//
// rooms:
//   id    TEXT, unique
//   name  TEXT

pub async fn setup(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
    )
    .execute(db_pool)
    .await?;

    Ok(())
}
